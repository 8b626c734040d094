//! Frame log files: `{logDir}/{jobName}.{frameName}.rqlog`.
//!
//! The supervisor owns the live log exclusively; rotation happens before
//! the file is opened, never while a frame is writing.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::frame::request::FrameRequest;

pub struct FrameLog {
    file: File,
    path: PathBuf,
}

/// Create the log directory if needed, rotate any existing log, and open a
/// fresh world-readable one for append.
pub fn materialize(
    log_dir: &Path,
    job_name: &str,
    frame_name: &str,
    max_log_files: u32,
) -> io::Result<FrameLog> {
    std::fs::create_dir_all(log_dir)?;
    let path = log_dir.join(format!("{}.{}.rqlog", job_name, frame_name));
    rotate(&path, max_log_files)?;

    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    let mut perms = file.metadata()?.permissions();
    perms.set_mode(0o644);
    let _ = std::fs::set_permissions(&path, perms);
    Ok(FrameLog { file, path })
}

/// Move an existing live log aside as `.1`, `.2`, ... The suffix count is
/// capped at `max - 1` archives; once every slot is taken the oldest
/// archive is cycled instead of growing the set.
fn rotate(path: &Path, max_log_files: u32) -> io::Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let slot = (1..max_log_files)
        .find(|i| !archive_path(path, *i).exists())
        .unwrap_or(1);
    std::fs::rename(path, archive_path(path, slot))
}

fn archive_path(path: &Path, slot: u32) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(format!(".{}", slot));
    PathBuf::from(s)
}

impl FrameLog {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Duplicate the handle for the child's stdout/stderr redirection.
    pub fn stdio_handle(&self) -> io::Result<File> {
        self.file.try_clone()
    }

    pub fn writeln(&mut self, line: &str) -> io::Result<()> {
        writeln!(self.file, "{}", line)?;
        self.file.flush()
    }

    /// Timestamped banner recording everything needed to reproduce the run.
    pub fn write_header(
        &mut self,
        request: &FrameRequest,
        env: &BTreeMap<String, String>,
        cwd: &Path,
        hostname: &str,
        run_as_uid: Option<u32>,
        cpu_list: Option<&[u32]>,
    ) -> io::Result<()> {
        let f = &mut self.file;
        writeln!(f, "{}", "=".repeat(60))?;
        writeln!(f, "RenderQ JobSpec      {}", Utc::now().to_rfc3339())?;
        writeln!(f, "command              {}", request.command)?;
        match run_as_uid {
            Some(uid) => writeln!(f, "uid/gid              {}/{}", uid, request.gid)?,
            None => writeln!(f, "uid/gid              daemon (no privilege drop)")?,
        }
        writeln!(f, "cwd                  {}", cwd.display())?;
        writeln!(f, "logDestination       {}", self.path.display())?;
        writeln!(f, "renderHost           {}", hostname)?;
        writeln!(f, "jobId                {}", request.job_id)?;
        writeln!(f, "frameId              {}", request.frame_id)?;
        match cpu_list {
            Some(cpus) => {
                let list: Vec<String> = cpus.iter().map(u32::to_string).collect();
                writeln!(f, "cpuList              {}", list.join(","))?;
            }
            None => writeln!(f, "cpuList              not pinned")?,
        }
        writeln!(f, "{}", "-".repeat(60))?;
        writeln!(f, "Environment:")?;
        for (key, value) in env {
            writeln!(f, "    {}={}", key, value)?;
        }
        writeln!(f, "{}", "=".repeat(60))?;
        f.flush()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn write_footer(
        &mut self,
        exit_status: i32,
        exit_signal: i32,
        real_sec: u64,
        user_sec: u64,
        sys_sec: u64,
        max_rss_kb: u64,
        start_time: u64,
        end_time: u64,
    ) -> io::Result<()> {
        let f = &mut self.file;
        writeln!(f, "{}", "=".repeat(60))?;
        writeln!(f, "RenderQ Job Complete {}", Utc::now().to_rfc3339())?;
        writeln!(f, "exitStatus           {}", exit_status)?;
        writeln!(f, "exitSignal           {}", exit_signal)?;
        writeln!(f, "realtime             {}", real_sec)?;
        writeln!(f, "usertime             {}", user_sec)?;
        writeln!(f, "systime              {}", sys_sec)?;
        writeln!(f, "maxRss               {} kB", max_rss_kb)?;
        writeln!(f, "startTime            {}", start_time)?;
        writeln!(f, "endTime              {}", end_time)?;
        writeln!(f, "{}", "=".repeat(60))?;
        f.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::request::test_request;

    #[test]
    fn creates_directory_and_log() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("logs/show/shot");
        let log = materialize(&log_dir, "job", "0001", 15).unwrap();
        assert!(log.path().ends_with("job.0001.rqlog"));
        assert!(log.path().exists());
    }

    #[test]
    fn rotation_caps_archives() {
        let dir = tempfile::tempdir().unwrap();
        let max = 4u32;

        // Rotate well past the cap.
        for i in 0..10 {
            let mut log = materialize(dir.path(), "job", "0001", max).unwrap();
            log.writeln(&format!("run {}", i)).unwrap();
        }

        let archives: Vec<_> = (1..max)
            .map(|i| dir.path().join(format!("job.0001.rqlog.{}", i)))
            .collect();
        for a in &archives {
            assert!(a.exists(), "expected archive {:?}", a);
        }
        // Exactly max-1 archives and one live log, nothing else.
        assert!(!dir.path().join("job.0001.rqlog.4").exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), max as usize);
    }

    #[test]
    fn header_and_footer_are_written() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = materialize(dir.path(), "job", "0001", 15).unwrap();
        let req = test_request();
        let mut env = BTreeMap::new();
        env.insert("CUE_THREADS".to_string(), "1".to_string());

        log.write_header(&req, &env, Path::new("/tmp"), "host01", Some(1001), None)
            .unwrap();
        log.writeln("frame output").unwrap();
        log.write_footer(0, 0, 5, 3, 1, 2048, 100, 105).unwrap();

        let contents = std::fs::read_to_string(log.path()).unwrap();
        assert!(contents.contains(&req.command));
        assert!(contents.contains("CUE_THREADS=1"));
        assert!(contents.contains("frame output"));
        assert!(contents.contains("exitStatus           0"));
        assert!(contents.contains("maxRss               2048 kB"));
    }
}
