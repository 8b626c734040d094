use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A frame launch command from the scheduler. Immutable once accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameRequest {
    pub frame_id: Uuid,
    /// Replaces the frame id on retries; unique per booking.
    pub resource_id: Uuid,
    pub job_id: Uuid,
    pub job_name: String,
    pub layer_name: String,
    pub frame_name: String,
    pub show: String,
    pub shot: String,
    pub user_name: String,
    pub uid: i64,
    #[serde(default)]
    pub gid: i64,
    pub log_dir: PathBuf,
    /// Single string handed to a shell.
    pub command: String,
    /// Requested cores in hundredths.
    pub num_cores: u32,
    /// Per-frame environment overrides; these win over the baseline.
    #[serde(default)]
    pub environment: HashMap<String, String>,
    /// Extra variables for the frame's own children, e.g. `CUE_IFRAME`.
    #[serde(default)]
    pub children_environment: HashMap<String, String>,
    #[serde(default)]
    pub threadable: bool,
    #[serde(default)]
    pub ignore_nimby: bool,
}

/// Soft attributes the agent attaches after accepting a frame.
/// Deliberately a fixed struct, not a free-form map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FrameAttributes {
    /// Logical CPUs pinned to this frame, when pinning succeeded.
    pub cpu_list: Option<Vec<u32>>,
}

/// Final exit facts for a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameExit {
    pub exit_status: i32,
    /// 0 unless the child died on a signal.
    pub exit_signal: i32,
}

/// A frame currently executing on this host.
///
/// Shared between the supervisor (owner), the daemon-wide resource sampler,
/// and the reporter, so the sampled fields are atomics and the rare-write
/// fields sit behind small mutexes.
#[derive(Debug)]
pub struct RunningFrame {
    pub request: FrameRequest,
    /// Process group leader pid; 0 until spawned.
    pid: AtomicU32,
    /// Seconds since epoch.
    pub start_time: u64,
    end_time: AtomicU64,
    exit: Mutex<Option<FrameExit>>,

    rss_kb: AtomicU64,
    max_rss_kb: AtomicU64,
    used_swap_kb: AtomicU64,
    utime_sec: AtomicU64,
    stime_sec: AtomicU64,

    kill_requested: AtomicBool,
    kill_reason: Mutex<Option<String>>,
    /// Wall/user/sys seconds recovered from the time wrapper, -1 until known.
    wall_clock_sec: AtomicI64,

    attributes: Mutex<FrameAttributes>,
}

pub fn epoch_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl RunningFrame {
    pub fn new(request: FrameRequest) -> Self {
        Self::with_start_time(request, epoch_now())
    }

    /// Used when re-adopting a frame from the crash-recovery snapshot.
    pub fn with_start_time(request: FrameRequest, start_time: u64) -> Self {
        Self {
            request,
            pid: AtomicU32::new(0),
            start_time,
            end_time: AtomicU64::new(0),
            exit: Mutex::new(None),
            rss_kb: AtomicU64::new(0),
            max_rss_kb: AtomicU64::new(0),
            used_swap_kb: AtomicU64::new(0),
            utime_sec: AtomicU64::new(0),
            stime_sec: AtomicU64::new(0),
            kill_requested: AtomicBool::new(false),
            kill_reason: Mutex::new(None),
            wall_clock_sec: AtomicI64::new(-1),
            attributes: Mutex::new(FrameAttributes::default()),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid.load(Ordering::SeqCst)
    }

    pub fn set_pid(&self, pid: u32) {
        self.pid.store(pid, Ordering::SeqCst);
    }

    pub fn end_time(&self) -> u64 {
        self.end_time.load(Ordering::SeqCst)
    }

    pub fn mark_ended(&self) {
        self.end_time.store(epoch_now(), Ordering::SeqCst);
    }

    pub fn set_exit(&self, exit: FrameExit) {
        *self.exit.lock().unwrap() = Some(exit);
    }

    pub fn exit(&self) -> Option<FrameExit> {
        *self.exit.lock().unwrap()
    }

    /// Sampler write path: refresh usage numbers for the whole child tree.
    pub fn note_usage(&self, rss_kb: u64, swap_kb: u64, utime_sec: u64, stime_sec: u64) {
        self.rss_kb.store(rss_kb, Ordering::Relaxed);
        self.max_rss_kb.fetch_max(rss_kb, Ordering::Relaxed);
        self.used_swap_kb.store(swap_kb, Ordering::Relaxed);
        self.utime_sec.store(utime_sec, Ordering::Relaxed);
        self.stime_sec.store(stime_sec, Ordering::Relaxed);
    }

    pub fn rss_kb(&self) -> u64 {
        self.rss_kb.load(Ordering::Relaxed)
    }

    pub fn max_rss_kb(&self) -> u64 {
        self.max_rss_kb.load(Ordering::Relaxed)
    }

    pub fn used_swap_kb(&self) -> u64 {
        self.used_swap_kb.load(Ordering::Relaxed)
    }

    pub fn used_cpu_sec(&self) -> u64 {
        self.utime_sec.load(Ordering::Relaxed) + self.stime_sec.load(Ordering::Relaxed)
    }

    /// Record a kill request. Returns true on the first request so the
    /// caller knows whether to deliver the signal.
    pub fn request_kill(&self, reason: &str) -> bool {
        let first = !self.kill_requested.swap(true, Ordering::SeqCst);
        if first {
            *self.kill_reason.lock().unwrap() = Some(reason.to_string());
        }
        first
    }

    pub fn kill_requested(&self) -> bool {
        self.kill_requested.load(Ordering::SeqCst)
    }

    pub fn kill_reason(&self) -> Option<String> {
        self.kill_reason.lock().unwrap().clone()
    }

    pub fn set_wall_clock(&self, secs: i64) {
        self.wall_clock_sec.store(secs, Ordering::SeqCst);
    }

    pub fn run_time_sec(&self) -> u64 {
        let wall = self.wall_clock_sec.load(Ordering::SeqCst);
        if wall >= 0 {
            return wall as u64;
        }
        let end = self.end_time();
        let end = if end == 0 { epoch_now() } else { end };
        end.saturating_sub(self.start_time)
    }

    pub fn set_cpu_list(&self, cpus: Vec<u32>) {
        self.attributes.lock().unwrap().cpu_list = Some(cpus);
    }

    pub fn attributes(&self) -> FrameAttributes {
        self.attributes.lock().unwrap().clone()
    }
}

/// A minimal valid request for unit tests across the crate.
#[cfg(test)]
pub fn test_request() -> FrameRequest {
    FrameRequest {
        frame_id: Uuid::new_v4(),
        resource_id: Uuid::new_v4(),
        job_id: Uuid::new_v4(),
        job_name: "show-shot-job".to_string(),
        layer_name: "render".to_string(),
        frame_name: "0001-render".to_string(),
        show: "show".to_string(),
        shot: "shot".to_string(),
        user_name: "artist".to_string(),
        uid: 1001,
        gid: 20,
        log_dir: PathBuf::from("/tmp"),
        command: "/bin/echo hi".to_string(),
        num_cores: 100,
        environment: HashMap::new(),
        children_environment: HashMap::new(),
        threadable: false,
        ignore_nimby: false,
    }
}
