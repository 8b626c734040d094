//! Lifecycle controller: owns every long-lived component, accepts or
//! refuses frame launches, reacts to idle-detector transitions, and
//! carries the shutdown/restart/reboot intent until the host drains.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{RqdConfig, CORE_POINTS_PER_CORE};
use crate::error::{Result, RqdError};
use crate::frame::request::{FrameExit, FrameRequest, RunningFrame};
use crate::frame::{sampler, supervisor, FrameCache};
use crate::host::hyperthread::ThreadAllocator;
use crate::host::nimby::{ConsoleActivity, Nimby, NimbyEvent};
use crate::host::probe::HostProbe;
use crate::ledger::CoreLedger;
use crate::report::{
    BootReport, FrameSummary, HardwareState, LockState, RenderHost, Report, ReporterHandle,
    StatusReport,
};

/// Cadence of idle-detector state evaluation while the host is unlocked.
/// Input itself is captured event-driven by the detector's listener.
const NIMBY_POLL_SECS: u64 = 5;

/// Poll period for adopted frames, which have no child handle to await.
const ADOPTED_POLL_SECS: u64 = 5;

/// Exit status reported for adopted frames; their real exit facts died
/// with the previous daemon incarnation.
const ADOPTED_EXIT_STATUS: i32 = 1;

/// What the daemon intends to do once the last frame completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    None,
    Shutdown,
    Restart,
    Reboot,
}

/// Action the process takes after the run loop returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitAction {
    Shutdown,
    Restart,
    Reboot,
}

pub struct Machine {
    pub config: Arc<RqdConfig>,
    pub probe: Arc<HostProbe>,
    pub cpus: Arc<ThreadAllocator>,
    pub ledger: Arc<CoreLedger>,
    pub cache: Arc<FrameCache>,
    pub nimby: Nimby,
    pub reporter: ReporterHandle,
    token: CancellationToken,
    intent: Mutex<Intent>,
    manual_locked: AtomicBool,
    accepting: AtomicBool,
    /// Poked on completions and intent changes so the run loop re-checks
    /// the drain condition without waiting out a timer.
    wake: Notify,
    last_locked_check: Mutex<Instant>,
}

impl Machine {
    pub fn new(
        config: Arc<RqdConfig>,
        reporter: ReporterHandle,
        token: CancellationToken,
    ) -> Arc<Self> {
        let probe = Arc::new(HostProbe::new(config.clone()));
        let cpus = Arc::new(ThreadAllocator::from_sys());
        let nimby = Nimby::new(config.nimby, Box::new(ConsoleActivity::new()));
        Self::with_parts(config, probe, cpus, nimby, reporter, token)
    }

    /// Composition root used by `new` and by tests that substitute probes
    /// or activity sources.
    pub fn with_parts(
        config: Arc<RqdConfig>,
        probe: Arc<HostProbe>,
        cpus: Arc<ThreadAllocator>,
        nimby: Nimby,
        reporter: ReporterHandle,
        token: CancellationToken,
    ) -> Arc<Self> {
        let total = probe.static_info().total_cores;
        Arc::new(Self {
            config,
            probe,
            cpus,
            ledger: Arc::new(CoreLedger::new(total)),
            cache: Arc::new(FrameCache::new()),
            nimby,
            reporter,
            token,
            intent: Mutex::new(Intent::None),
            manual_locked: AtomicBool::new(false),
            accepting: AtomicBool::new(true),
            wake: Notify::new(),
            last_locked_check: Mutex::new(Instant::now()),
        })
    }

    // ---- frame launch and kill ----

    /// Validate and accept a frame. On success the supervisor task is
    /// already running; every failure leaves the ledger, allocator, and
    /// cache exactly as they were.
    pub fn launch(self: &Arc<Self>, request: FrameRequest) -> Result<Arc<RunningFrame>> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(RqdError::ShutdownPending);
        }
        if self.nimby.locked() && !request.ignore_nimby {
            return Err(RqdError::NimbyLocked);
        }
        // Malformed whether or not privileges are dropped at spawn.
        if request.uid <= 0 {
            return Err(RqdError::InvalidRequest(format!(
                "frame {} requests uid {}",
                request.frame_id, request.uid
            )));
        }
        if request.num_cores == 0 {
            return Err(RqdError::InvalidRequest(format!(
                "frame {} requests zero cores",
                request.frame_id
            )));
        }
        let max_frames = (self.probe.static_info().total_cores / CORE_POINTS_PER_CORE) as usize;
        if self.cache.len() >= max_frames.max(1) {
            return Err(RqdError::InvalidRequest(format!(
                "host already runs {} frames",
                self.cache.len()
            )));
        }

        let frame = Arc::new(RunningFrame::new(request));

        // Pinning is best effort and only for threadable frames; an
        // exhausted allocator just means the frame floats.
        let pinned = if frame.request.threadable && frame.request.num_cores >= CORE_POINTS_PER_CORE
        {
            self.cpus.reserve(frame.request.num_cores)
        } else {
            None
        };
        if let Some(cpus) = &pinned {
            frame.set_cpu_list(cpus.clone());
        }

        if let Err(e) = self.ledger.reserve(frame.request.num_cores) {
            if let Some(cpus) = &pinned {
                self.cpus.release(cpus);
            }
            return Err(e);
        }
        if let Err(e) = self.cache.store(frame.clone()) {
            self.ledger.release(frame.request.num_cores);
            if let Some(cpus) = &pinned {
                self.cpus.release(cpus);
            }
            return Err(e);
        }

        tokio::spawn(supervisor::run_frame(self.clone(), frame.clone()));
        Ok(frame)
    }

    /// Kill one frame: SIGTERM to its process group now, SIGKILL after the
    /// grace period if it is still around. Best effort: an unknown id is a
    /// no-op and the first recorded reason wins. Repeat kills re-signal,
    /// so a kill that found no pid yet still lands on retry.
    pub fn kill_frame(&self, id: &Uuid, reason: &str) {
        let Some(frame) = self.cache.get(id) else {
            tracing::debug!(frame_id = %id, "Kill for unknown frame ignored");
            return;
        };
        if frame.request_kill(reason) {
            tracing::info!(frame_id = %id, reason, "Killing frame");
        }
        self.deliver_kill(&frame);
    }

    /// Signal the frame's process group and arm the SIGKILL escalation.
    /// A frame with no pid yet is left alone here; the supervisor re-checks
    /// the kill flag on both sides of the spawn and calls back in.
    pub(crate) fn deliver_kill(&self, frame: &Arc<RunningFrame>) {
        let pid = frame.pid();
        if pid == 0 {
            return;
        }
        signal_group(pid, Signal::SIGTERM);

        let cache = self.cache.clone();
        let grace = self.config.kill_grace_secs;
        let id = frame.request.frame_id;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(grace)).await;
            if cache.contains(&id) && sampler::pid_alive(pid) {
                tracing::warn!(frame_id = %id, pid, "Frame survived SIGTERM, escalating");
                signal_group(pid, Signal::SIGKILL);
            }
        });
    }

    fn kill_all(&self, reason: &str, spare_nimby_immune: bool) {
        for frame in self.cache.running() {
            if spare_nimby_immune && frame.request.ignore_nimby {
                continue;
            }
            self.kill_frame(&frame.request.frame_id, reason);
        }
    }

    // ---- operator locks ----

    pub fn lock_cores(&self, n: u32) {
        if n >= self.probe.static_info().total_cores {
            self.manual_locked.store(true, Ordering::SeqCst);
        }
        self.ledger.lock(n);
        self.reporter.try_send(Report::Status(self.status_report()));
    }

    pub fn lock_all(&self) {
        self.manual_locked.store(true, Ordering::SeqCst);
        self.ledger.lock_all();
        self.reporter.try_send(Report::Status(self.status_report()));
    }

    pub fn unlock_cores(&self, n: u32) {
        self.ledger.unlock(n);
        self.reporter.try_send(Report::Status(self.status_report()));
    }

    /// Full unlock also rescinds any pending shutdown/restart/reboot and
    /// reopens the host for bookings.
    pub fn unlock_all(&self) {
        self.manual_locked.store(false, Ordering::SeqCst);
        *self.intent.lock().unwrap() = Intent::None;
        self.accepting.store(true, Ordering::SeqCst);
        self.ledger.unlock_all();
        self.reporter.try_send(Report::Status(self.status_report()));
        self.wake.notify_one();
    }

    pub fn set_nimby(&self, enabled: bool) {
        if let Some(NimbyEvent::Unlocked) = self.nimby.set_enabled(enabled) {
            if !self.manual_locked.load(Ordering::SeqCst) {
                self.ledger.unlock_all();
            }
        }
    }

    // ---- lifecycle intent ----

    pub fn intent(&self) -> Intent {
        *self.intent.lock().unwrap()
    }

    fn set_intent(&self, intent: Intent) {
        *self.intent.lock().unwrap() = intent;
        self.accepting.store(false, Ordering::SeqCst);
        self.ledger.lock_all();
        self.wake.notify_one();
    }

    pub fn shutdown_idle(&self) {
        tracing::info!("Shutdown scheduled for when the host drains");
        self.set_intent(Intent::Shutdown);
    }

    pub fn shutdown_now(&self) {
        self.set_intent(Intent::Shutdown);
        self.kill_all("Host shutdown", false);
    }

    pub fn restart_idle(&self) {
        tracing::info!("Restart scheduled for when the host drains");
        self.set_intent(Intent::Restart);
    }

    pub fn restart_now(&self) {
        self.set_intent(Intent::Restart);
        self.kill_all("Host restart", false);
    }

    /// Reboot once idle. Refused while someone is at the console, and
    /// refused outright without the privilege to reboot.
    pub fn reboot_idle(&self) -> Result<()> {
        if self.nimby.user_session_active() {
            return Err(RqdError::UserLoggedIn);
        }
        if !nix::unistd::geteuid().is_root() {
            return Err(RqdError::NotRoot);
        }
        tracing::info!("Reboot scheduled for when the host drains");
        self.set_intent(Intent::Reboot);
        Ok(())
    }

    pub fn reboot_now(&self) -> Result<()> {
        if self.nimby.user_session_active() {
            return Err(RqdError::UserLoggedIn);
        }
        if !nix::unistd::geteuid().is_root() {
            return Err(RqdError::NotRoot);
        }
        self.set_intent(Intent::Reboot);
        self.kill_all("Host reboot", false);
        Ok(())
    }

    /// Poked by supervisors when a frame finishes.
    pub fn frame_finished(&self) {
        self.wake.notify_one();
    }

    fn due_exit(&self) -> Option<ExitAction> {
        if !self.cache.is_empty() {
            return None;
        }
        match self.intent() {
            Intent::None => None,
            Intent::Shutdown => Some(ExitAction::Shutdown),
            Intent::Restart => Some(ExitAction::Restart),
            Intent::Reboot => Some(ExitAction::Reboot),
        }
    }

    // ---- reporting ----

    /// Host descriptor from the most recent sample; does not touch the OS.
    pub fn render_host(&self) -> RenderHost {
        let info = self.probe.static_info();
        let s = self.probe.last_sample();
        let hardware_state = if self.intent() == Intent::Reboot {
            HardwareState::Rebooting
        } else {
            HardwareState::Up
        };
        let lock_state = if self.manual_locked.load(Ordering::SeqCst) {
            LockState::Locked
        } else if self.nimby.locked() {
            LockState::NimbyLocked
        } else {
            LockState::Open
        };
        RenderHost {
            name: info.hostname.clone(),
            facility: self.config.facility.clone(),
            tags: self.config.tags.clone(),
            os: info.os.clone(),
            boot_time: info.boot_time,
            total_cores: info.total_cores,
            num_procs: info.num_procs,
            hyperthread_multiplier: info.hyperthread_multiplier,
            total_mem_kb: info.total_mem_kb,
            free_mem_kb: s.free_mem_kb,
            total_swap_kb: info.total_swap_kb,
            free_swap_kb: s.free_swap_kb,
            total_mcp_kb: s.total_mcp_kb,
            free_mcp_kb: s.free_mcp_kb,
            total_gpu_kb: s.total_gpu_kb,
            free_gpu_kb: s.free_gpu_kb,
            load: s.load,
            nimby_enabled: self.nimby.enabled(),
            hardware_state,
            lock_state,
            uid: nix::unistd::getuid().as_raw(),
        }
    }

    /// Free GPU memory from the last sample, for `CUE_GPU_MEMORY`.
    pub fn gpu_memory_kb(&self) -> u64 {
        self.probe.last_sample().free_gpu_kb
    }

    pub fn boot_report(&self) -> BootReport {
        BootReport {
            host: self.render_host(),
            cores: self.ledger.snapshot(),
        }
    }

    pub fn status_report(&self) -> StatusReport {
        StatusReport {
            host: self.render_host(),
            cores: self.ledger.snapshot(),
            frames: self
                .cache
                .running()
                .iter()
                .map(|f| FrameSummary::from_frame(f))
                .collect(),
        }
    }

    async fn status_tick(&self) {
        self.probe.sample().await;
        self.reporter.send(Report::Status(self.status_report())).await;
        self.write_snapshot();
    }

    fn write_snapshot(&self) {
        if let Some(path) = &self.config.backup_cache_path {
            if let Err(e) = self.cache.snapshot_to_disk(path) {
                tracing::warn!(path = %path.display(), error = %e, "Frame snapshot failed");
            }
        }
    }

    // ---- idle detector ----

    async fn idle_tick(&self) {
        if !self.nimby.enabled() {
            return;
        }
        // Locked hosts are re-evaluated on a slower cadence.
        if self.nimby.locked() {
            let mut last = self.last_locked_check.lock().unwrap();
            if last.elapsed() < Duration::from_secs(self.config.check_interval_locked) {
                return;
            }
            *last = Instant::now();
        }

        let sample = self.probe.sample().await;
        let manual = self.manual_locked.load(Ordering::SeqCst);
        match self.nimby.tick(&sample, manual, &self.config) {
            Some(NimbyEvent::Locked) => {
                self.ledger.lock_all();
                self.kill_all("NIMBY Triggered", true);
                self.reporter.send(Report::Status(self.status_report())).await;
            }
            Some(NimbyEvent::Unlocked) => {
                if !manual {
                    self.ledger.unlock_all();
                }
                self.reporter.send(Report::Status(self.status_report())).await;
            }
            None => {}
        }
    }

    // ---- startup and run loop ----

    /// Re-adopt frames recorded by a previous incarnation: book their
    /// cores again and watch the pids for exit.
    pub fn adopt_snapshot(self: &Arc<Self>) {
        let Some(path) = &self.config.backup_cache_path else {
            return;
        };
        let adopted = self
            .cache
            .reconcile_from_disk(path, self.config.backup_cache_ttl_secs);
        for frame in adopted {
            if let Err(e) = self.ledger.reserve(frame.request.num_cores) {
                tracing::warn!(
                    frame_id = %frame.request.frame_id,
                    error = %e,
                    "Adopted frame no longer fits the ledger"
                );
            }
            tokio::spawn(watch_adopted(self.clone(), frame));
        }
    }

    /// Drive the periodic work until shutdown. Returns the action to take,
    /// or `None` on a plain signal-driven exit that leaves frames running.
    pub async fn run(self: Arc<Self>) -> Option<ExitAction> {
        let mut ping =
            tokio::time::interval(Duration::from_secs(self.config.ping_interval_secs));
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut idle = tokio::time::interval(Duration::from_secs(NIMBY_POLL_SECS));
        idle.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if let Some(action) = self.due_exit() {
                self.write_snapshot();
                tracing::info!(?action, "Host drained, acting on intent");
                return Some(action);
            }
            tokio::select! {
                _ = self.token.cancelled() => {
                    // Children keep running; the snapshot lets the next
                    // incarnation pick them back up.
                    self.write_snapshot();
                    tracing::info!("Stop signal received, frames left running");
                    return None;
                }
                _ = ping.tick() => self.status_tick().await,
                _ = idle.tick() => self.idle_tick().await,
                _ = self.wake.notified() => {}
            }
        }
    }
}

fn signal_group(pid: u32, sig: Signal) {
    if let Err(e) = killpg(Pid::from_raw(pid as i32), sig) {
        tracing::debug!(pid, ?sig, error = %e, "Signal delivery failed");
    }
}

/// An adopted frame has no child handle; poll the pid until it is gone,
/// then settle it like any other completion.
async fn watch_adopted(machine: Arc<Machine>, frame: Arc<RunningFrame>) {
    let pid = frame.pid();
    let mut poll = tokio::time::interval(Duration::from_secs(ADOPTED_POLL_SECS));
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        poll.tick().await;
        if !sampler::pid_alive(pid) {
            break;
        }
    }
    frame.mark_ended();
    let exit = FrameExit {
        exit_status: ADOPTED_EXIT_STATUS,
        exit_signal: 0,
    };
    frame.set_exit(exit);
    supervisor::finish(&machine, &frame, exit).await;
}
