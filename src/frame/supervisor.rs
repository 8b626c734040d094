//! Per-frame supervisor: runs one accepted frame from launch to the
//! completion report. One tokio task per frame; the blocking points are
//! the spawn, the child wait, and the failed-launch backoff.

use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{
    RqdConfig, CORE_POINTS_PER_CORE, EXITSTATUS_FOR_FAILED_LAUNCH, EXITSTATUS_FOR_NIMBY_KILL,
};
use crate::frame::logfile::{self, FrameLog};
use crate::frame::request::{FrameExit, RunningFrame};
use crate::machine::Machine;
use crate::report::{FrameCompleteReport, FrameSummary, Report};

/// Kill reason prefix that coerces the reported exit status to the NIMBY
/// sentinel.
pub const NIMBY_KILL_REASON: &str = "NIMBY";

struct SpawnOutcome {
    status: i32,
    signal: i32,
    real_sec: u64,
    user_sec: u64,
    sys_sec: u64,
}

/// Run a frame to completion. Core release, cache removal, and the
/// completion report always happen, whatever went wrong earlier.
pub async fn run_frame(machine: Arc<Machine>, frame: Arc<RunningFrame>) {
    let frame_id = frame.request.frame_id;
    tracing::info!(frame_id = %frame_id, job = %frame.request.job_name, "Supervising frame");

    let (exit, launch_failed) = execute(&machine, &frame).await;
    frame.set_exit(exit);

    if launch_failed {
        // A broken host must not hot-loop through bookings.
        tokio::time::sleep(Duration::from_secs(
            machine.config.failed_launch_backoff_secs,
        ))
        .await;
    }

    finish(&machine, &frame, exit).await;
}

/// Release everything the launch reserved and emit the completion report.
/// Also used for frames re-adopted after a daemon restart.
pub async fn finish(machine: &Arc<Machine>, frame: &Arc<RunningFrame>, exit: FrameExit) {
    if let Some(cpus) = frame.attributes().cpu_list {
        machine.cpus.release(&cpus);
    }
    machine.ledger.release(frame.request.num_cores);
    machine.cache.remove(&frame.request.frame_id);

    let report = FrameCompleteReport {
        host: machine.render_host(),
        frame: FrameSummary::from_frame(frame),
        exit_status: exit.exit_status,
        exit_signal: exit.exit_signal,
        run_time_sec: frame.run_time_sec(),
    };
    machine.reporter.send(Report::FrameComplete(report)).await;
    machine.frame_finished();
    tracing::info!(
        frame_id = %frame.request.frame_id,
        exit_status = exit.exit_status,
        exit_signal = exit.exit_signal,
        "Frame finished"
    );
}

/// Steps 1-9 of the frame contract. Returns the final (possibly coerced)
/// exit facts and whether this counts as a failed launch.
async fn execute(machine: &Arc<Machine>, frame: &Arc<RunningFrame>) -> (FrameExit, bool) {
    // Step 1: materialise the log. Failure is a launch error surfaced to
    // the scheduler; there is nowhere to write a footer yet.
    let mut log = match logfile::materialize(
        &frame.request.log_dir,
        &frame.request.job_name,
        &frame.request.frame_name,
        machine.config.max_log_files,
    ) {
        Ok(log) => log,
        Err(e) => {
            tracing::error!(frame_id = %frame.request.frame_id, error = %e, "Cannot write frame log");
            frame.mark_ended();
            return (
                FrameExit {
                    exit_status: EXITSTATUS_FOR_FAILED_LAUNCH,
                    exit_signal: 0,
                },
                true,
            );
        }
    };

    let result = run_with_log(machine, frame, &mut log).await;
    frame.mark_ended();

    let (exit, failed, (real, user, sys)) = match result {
        Ok(outcome) => {
            frame.set_wall_clock(outcome.real_sec as i64);
            let mut status = outcome.status;
            if frame.kill_requested()
                && frame
                    .kill_reason()
                    .is_some_and(|r| r.starts_with(NIMBY_KILL_REASON))
            {
                status = EXITSTATUS_FOR_NIMBY_KILL;
            }
            (
                FrameExit {
                    exit_status: status,
                    exit_signal: outcome.signal,
                },
                false,
                (outcome.real_sec, outcome.user_sec, outcome.sys_sec),
            )
        }
        Err(e) => {
            tracing::error!(frame_id = %frame.request.frame_id, error = %e, "Frame launch failed");
            let _ = log.writeln(&format!("RQD: launch failed: {}", e));
            (
                FrameExit {
                    exit_status: EXITSTATUS_FOR_FAILED_LAUNCH,
                    exit_signal: 0,
                },
                true,
                (0, 0, 0),
            )
        }
    };
    if let Err(e) = log.write_footer(
        exit.exit_status,
        exit.exit_signal,
        real,
        user,
        sys,
        frame.max_rss_kb(),
        frame.start_time,
        frame.end_time(),
    ) {
        tracing::warn!(frame_id = %frame.request.frame_id, error = %e, "Could not write log footer");
    }
    (exit, failed)
}

/// Steps 2-8: environment, header, temp dir, spawn, wait.
async fn run_with_log(
    machine: &Arc<Machine>,
    frame: &Arc<RunningFrame>,
    log: &mut FrameLog,
) -> Result<SpawnOutcome, String> {
    let config = &machine.config;
    let request = &frame.request;
    let cpu_list = frame.attributes().cpu_list;

    // Step 2: compose the environment.
    let env = build_environment(
        config,
        frame,
        log.path(),
        machine.gpu_memory_kb(),
        machine.probe.static_info().hyperthread_multiplier,
    );

    // Privilege drop happens in the child, after fork; the daemon itself
    // never changes identity.
    let run_as_uid = if config.become_job_user && nix::unistd::geteuid().is_root() {
        Some(request.uid as u32)
    } else {
        None
    };

    // Step 4: per-frame temp directory, with fallbacks; never fatal.
    let temp_dir = frame_temp_dir(&config.temp_path, &request.job_name, &request.frame_name);

    // Step 3: header.
    log.write_header(
        request,
        &env,
        &temp_dir,
        &machine.probe.static_info().hostname,
        run_as_uid,
        cpu_list.as_deref(),
    )
    .map_err(|e| format!("cannot write log header: {}", e))?;

    // Step 5: spawn via a short shell script so long commands survive
    // argument limits and the process table shows a stable argv.
    let script = write_command_script(&temp_dir, request)
        .map_err(|e| format!("cannot write command script: {}", e))?;
    let stat_file = temp_dir.join(format!("rqd-stat.{}", request.frame_id));

    // A kill that raced the launch: skip the spawn entirely.
    if frame.kill_requested() {
        return Ok(SpawnOutcome {
            status: EXITSTATUS_FOR_NIMBY_KILL,
            signal: 0,
            real_sec: 0,
            user_sec: 0,
            sys_sec: 0,
        });
    }

    let mut argv: Vec<String> = Vec::new();
    let time_tool = Path::new("/usr/bin/time");
    if time_tool.exists() {
        argv.extend([
            "/usr/bin/time".to_string(),
            "-p".to_string(),
            "-o".to_string(),
            stat_file.to_string_lossy().into_owned(),
        ]);
    }
    if let Some(cpus) = &cpu_list {
        if Path::new("/usr/bin/taskset").exists() {
            let list: Vec<String> = cpus.iter().map(u32::to_string).collect();
            argv.extend([
                "/usr/bin/taskset".to_string(),
                "-c".to_string(),
                list.join(","),
            ]);
        }
    }
    if config.desktop {
        argv.push("nice".to_string());
    }
    argv.extend(["/bin/sh".to_string(), script.to_string_lossy().into_owned()]);

    let mut cmd = std::process::Command::new(&argv[0]);
    cmd.args(&argv[1..])
        .env_clear()
        .envs(&env)
        .current_dir(&temp_dir)
        .stdin(std::process::Stdio::null())
        .stdout(log.stdio_handle().map_err(|e| e.to_string())?)
        .stderr(log.stdio_handle().map_err(|e| e.to_string())?)
        .process_group(0);
    if let Some(uid) = run_as_uid {
        let gid = if request.gid > 0 {
            request.gid as u32
        } else {
            config.launch_frame_user_gid
        };
        cmd.uid(uid).gid(gid);
    }

    let mut child = tokio::process::Command::from(cmd)
        .spawn()
        .map_err(|e| format!("spawn failed: {}", e))?;
    let pid = child.id().unwrap_or(0);
    frame.set_pid(pid);
    tracing::info!(frame_id = %request.frame_id, pid, "Frame process started");

    // A kill recorded between the pre-spawn check and set_pid had no pid
    // to signal; deliver it now that one exists.
    if frame.kill_requested() {
        machine.deliver_kill(frame);
    }

    // Step 7: await exit. The kill path signals the process group from
    // outside; the wait picks the death up either way.
    let status = child
        .wait()
        .await
        .map_err(|e| format!("wait failed: {}", e))?;

    let (exit_status, exit_signal) = match (status.code(), status.signal()) {
        (Some(code), _) => (code, 0),
        (None, Some(sig)) => (1, sig),
        (None, None) => (1, 0),
    };

    let (real_sec, user_sec, sys_sec) = parse_time_stat(&stat_file);
    let _ = std::fs::remove_file(&stat_file);
    let _ = std::fs::remove_file(&script);

    Ok(SpawnOutcome {
        status: exit_status,
        signal: exit_signal,
        real_sec,
        user_sec,
        sys_sec,
    })
}

/// Baseline environment, optional host passthrough, then the per-frame
/// overrides. Request values win, except PATH when the operator opted in
/// to the host PATH.
fn build_environment(
    config: &RqdConfig,
    frame: &RunningFrame,
    log_path: &Path,
    gpu_memory_kb: u64,
    hyperthread_multiplier: u32,
) -> BTreeMap<String, String> {
    let request = &frame.request;
    let mut env = BTreeMap::new();

    env.insert(
        "PATH".to_string(),
        "/usr/local/bin:/usr/bin:/bin:/usr/sbin:/sbin".to_string(),
    );
    env.insert("TERM".to_string(), "unknown".to_string());
    if let Ok(tz) = std::env::var("TZ") {
        env.insert("TZ".to_string(), tz);
    }
    env.insert("USER".to_string(), request.user_name.clone());
    env.insert("LOGNAME".to_string(), request.user_name.clone());
    env.insert(
        "MAIL".to_string(),
        format!("/usr/mail/{}", request.user_name),
    );
    env.insert("HOME".to_string(), format!("/home/{}", request.user_name));
    env.insert("SHOW".to_string(), request.show.clone());
    env.insert("SHOT".to_string(), request.shot.clone());
    env.insert("JOB".to_string(), request.job_name.clone());
    env.insert("FRAME".to_string(), request.frame_name.clone());
    env.insert("CUE_JOB_ID".to_string(), request.job_id.to_string());
    env.insert("CUE_FRAME_ID".to_string(), request.frame_id.to_string());
    env.insert(
        "CUE_LOG_PATH".to_string(),
        log_path.to_string_lossy().into_owned(),
    );
    env.insert(
        "CUE_THREADS".to_string(),
        (request.num_cores / CORE_POINTS_PER_CORE).max(1).to_string(),
    );
    env.insert("CUE_GPU_MEMORY".to_string(), gpu_memory_kb.to_string());

    if config.use_all_host_env_vars {
        for (k, v) in std::env::vars() {
            env.insert(k, v);
        }
    } else {
        for name in &config.host_env_vars {
            if let Some((k, v)) = RqdConfig::host_env_value(name) {
                env.insert(k, v);
            }
        }
    }

    for (k, v) in &request.environment {
        env.insert(k.clone(), v.clone());
    }
    for (k, v) in &request.children_environment {
        env.insert(k.clone(), v.clone());
    }

    if let Some(cpus) = &frame.attributes().cpu_list {
        env.insert("CUE_HT".to_string(), "1".to_string());
        let pinned_cores = cpus.len() as u32 / hyperthread_multiplier.max(1);
        let threads: u32 = env
            .get("CUE_THREADS")
            .and_then(|t| t.parse().ok())
            .unwrap_or(1);
        env.insert(
            "CUE_THREADS".to_string(),
            threads.max(pinned_cores.max(1)).to_string(),
        );
    }

    if config.use_path_env_var {
        if let Ok(path) = std::env::var("PATH") {
            env.insert("PATH".to_string(), path);
        }
    }
    env
}

/// `{tempRoot}/{jobName}/{frameName}`, falling back to the job temp and
/// then the root itself.
fn frame_temp_dir(root: &Path, job_name: &str, frame_name: &str) -> PathBuf {
    let frame_dir = root.join(job_name).join(frame_name);
    if std::fs::create_dir_all(&frame_dir).is_ok() {
        return frame_dir;
    }
    let job_dir = root.join(job_name);
    if std::fs::create_dir_all(&job_dir).is_ok() {
        tracing::warn!(dir = %frame_dir.display(), "Frame temp dir failed, using job temp");
        return job_dir;
    }
    tracing::warn!(dir = %job_dir.display(), "Job temp dir failed, using process temp");
    root.to_path_buf()
}

fn write_command_script(
    temp_dir: &Path,
    request: &crate::frame::request::FrameRequest,
) -> std::io::Result<PathBuf> {
    let path = temp_dir.join(format!("rqd-cmd.{}.sh", request.frame_id));
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", request.command))?;
    let mut perms = std::fs::metadata(&path)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms)?;
    Ok(path)
}

/// Parse `time -p` output: `real N.NN / user N.NN / sys N.NN`. Any
/// failure is non-fatal and leaves zeros.
fn parse_time_stat(path: &Path) -> (u64, u64, u64) {
    let Ok(raw) = std::fs::read_to_string(path) else {
        return (0, 0, 0);
    };
    let mut real = 0u64;
    let mut user = 0u64;
    let mut sys = 0u64;
    for line in raw.lines() {
        let mut parts = line.split_whitespace();
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let secs = value.parse::<f64>().unwrap_or(0.0) as u64;
        match key {
            "real" => real = secs,
            "user" => user = secs,
            "sys" => sys = secs,
            _ => {}
        }
    }
    (real, user, sys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::request::test_request;
    use std::io::Write;

    #[test]
    fn environment_baseline_and_overrides() {
        let config = RqdConfig::default();
        let mut request = test_request();
        request
            .environment
            .insert("CUSTOM".to_string(), "yes".to_string());
        request
            .environment
            .insert("USER".to_string(), "overridden".to_string());
        let frame = RunningFrame::new(request);

        let env = build_environment(&config, &frame, Path::new("/tmp/f.rqlog"), 0, 2);
        assert_eq!(env.get("CUSTOM").map(String::as_str), Some("yes"));
        // Request environment wins over the baseline.
        assert_eq!(env.get("USER").map(String::as_str), Some("overridden"));
        assert_eq!(env.get("SHOW").map(String::as_str), Some("show"));
        assert_eq!(env.get("CUE_THREADS").map(String::as_str), Some("1"));
        assert!(env.contains_key("CUE_GPU_MEMORY"));
    }

    #[test]
    fn pinning_raises_cue_threads() {
        let config = RqdConfig::default();
        let mut request = test_request();
        request.num_cores = 100;
        let frame = RunningFrame::new(request);
        frame.set_cpu_list(vec![0, 1, 4, 5]); // two physical cores

        let env = build_environment(&config, &frame, Path::new("/tmp/f.rqlog"), 0, 2);
        assert_eq!(env.get("CUE_HT").map(String::as_str), Some("1"));
        assert_eq!(env.get("CUE_THREADS").map(String::as_str), Some("2"));
    }

    #[test]
    fn host_path_opt_in_wins_over_request() {
        let config = RqdConfig {
            use_path_env_var: true,
            ..RqdConfig::default()
        };
        let mut request = test_request();
        request
            .environment
            .insert("PATH".to_string(), "/frame/path".to_string());
        let frame = RunningFrame::new(request);

        let env = build_environment(&config, &frame, Path::new("/tmp/f.rqlog"), 0, 2);
        assert_eq!(env.get("PATH"), std::env::var("PATH").ok().as_ref());
    }

    #[test]
    fn temp_dir_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let good = frame_temp_dir(dir.path(), "job", "0001");
        assert!(good.ends_with("job/0001"));
        assert!(good.exists());
    }

    #[test]
    fn time_stat_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stat");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "real 12.34\nuser 8.00\nsys 1.99").unwrap();
        assert_eq!(parse_time_stat(&path), (12, 8, 1));
    }

    #[test]
    fn missing_time_stat_leaves_zeros() {
        assert_eq!(parse_time_stat(Path::new("/nonexistent/stat")), (0, 0, 0));
    }

    #[test]
    fn command_script_is_executable() {
        let dir = tempfile::tempdir().unwrap();
        let request = test_request();
        let script = write_command_script(dir.path(), &request).unwrap();
        let contents = std::fs::read_to_string(&script).unwrap();
        assert!(contents.contains(&request.command));
        let mode = std::fs::metadata(&script).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
    }
}
