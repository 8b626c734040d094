use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::RqdConfig;
use crate::host::probe::HostSample;

/// Where the idle detector learns about the human at the keyboard.
/// Behind a trait so tests can script activity.
pub trait ActivitySource: Send + Sync {
    /// True when console input was seen since the last call.
    fn input_detected(&self) -> bool;

    /// True when a desktop session or logged-in user is present.
    fn user_session_active(&self) -> bool;
}

/// Production source: a dedicated listener thread blocks in poll(2) on the
/// evdev character devices and raises a flag the instant any of them turns
/// readable, so no keystroke burst can fall between checks. Session
/// presence comes from a populated `/run/user` (logind) or
/// `/tmp/.X11-unix` (X11).
pub struct ConsoleActivity {
    seen: Arc<AtomicBool>,
}

impl ConsoleActivity {
    pub fn new() -> Self {
        let fds = open_input_devices();
        if fds.is_empty() {
            tracing::warn!("No readable input devices, NIMBY relies on session detection only");
        }
        Self::with_fds(fds)
    }

    /// The listener thread owns the fds and lives for the process
    /// lifetime. Fds are forced non-blocking; the drain relies on it.
    fn with_fds(fds: Vec<i32>) -> Self {
        let seen = Arc::new(AtomicBool::new(false));
        if !fds.is_empty() {
            for &fd in &fds {
                unsafe { libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK) };
            }
            let flag = seen.clone();
            let _ = std::thread::Builder::new()
                .name("nimby-input".to_string())
                .spawn(move || listen_for_input(fds, flag));
        }
        Self { seen }
    }
}

impl Default for ConsoleActivity {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivitySource for ConsoleActivity {
    fn input_detected(&self) -> bool {
        self.seen.swap(false, Ordering::SeqCst)
    }

    fn user_session_active(&self) -> bool {
        dir_has_entries(Path::new("/run/user")) || dir_has_entries(Path::new("/tmp/.X11-unix"))
    }
}

fn open_input_devices() -> Vec<i32> {
    let mut fds = Vec::new();
    if let Ok(entries) = std::fs::read_dir("/dev/input") {
        for entry in entries.flatten() {
            let name = entry.file_name();
            if !name.to_string_lossy().starts_with("event") {
                continue;
            }
            let path = std::ffi::CString::new(entry.path().to_string_lossy().into_owned())
                .expect("device path has no NUL");
            let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDONLY | libc::O_NONBLOCK) };
            if fd >= 0 {
                fds.push(fd);
            }
        }
    }
    fds
}

/// Wait without a timeout for any device to turn readable, drain it, and
/// mark the flag. Devices that error or hang up are dropped; the thread
/// exits when none remain.
fn listen_for_input(fds: Vec<i32>, seen: Arc<AtomicBool>) {
    let mut pfds: Vec<libc::pollfd> = fds
        .iter()
        .map(|&fd| libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();
    loop {
        let ready = unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, -1) };
        if ready < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            tracing::warn!(error = %err, "Input poll failed, stopping input detection");
            break;
        }
        for pfd in &mut pfds {
            if pfd.revents & libc::POLLIN != 0 {
                drain_input(pfd.fd);
                seen.store(true, Ordering::SeqCst);
            }
        }
        pfds.retain_mut(|pfd| {
            let dead =
                pfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0;
            if dead {
                unsafe { libc::close(pfd.fd) };
            }
            pfd.revents = 0;
            !dead
        });
        if pfds.is_empty() {
            tracing::warn!("All input devices gone, stopping input detection");
            return;
        }
    }
    for pfd in &pfds {
        unsafe { libc::close(pfd.fd) };
    }
}

fn drain_input(fd: i32) {
    let mut buf = [0u8; 4096];
    while unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) } > 0 {}
}

fn dir_has_entries(path: &Path) -> bool {
    std::fs::read_dir(path)
        .map(|mut d| d.next().is_some())
        .unwrap_or(false)
}

/// Transition emitted by a detector tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NimbyEvent {
    Locked,
    Unlocked,
}

/// The idle detector: decides whether the host is presently usable for
/// rendering. The lifecycle controller drives `tick` and reacts to the
/// transitions (killing frames on `Locked`).
pub struct Nimby {
    enabled: AtomicBool,
    locked: AtomicBool,
    last_activity: Mutex<Instant>,
    source: Box<dyn ActivitySource>,
}

impl Nimby {
    pub fn new(enabled: bool, source: Box<dyn ActivitySource>) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            locked: AtomicBool::new(false),
            last_activity: Mutex::new(Instant::now()),
            source,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Enable or disable at runtime. Disabling drops any nimby lock.
    /// Returns the resulting transition, if any.
    pub fn set_enabled(&self, enabled: bool) -> Option<NimbyEvent> {
        self.enabled.store(enabled, Ordering::SeqCst);
        if !enabled && self.locked.swap(false, Ordering::SeqCst) {
            return Some(NimbyEvent::Unlocked);
        }
        None
    }

    pub fn locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    /// Whether a desktop session or logged-in user is present right now.
    pub fn user_session_active(&self) -> bool {
        self.source.user_session_active()
    }

    /// Evaluate the state machine once.
    ///
    /// Unlocked -> Locked on any user presence. Locked -> Unlocked only
    /// when the console has been idle for `MINIMUM_IDLE`, memory, swap and
    /// load are within bounds, and no operator lock is in force.
    pub fn tick(
        &self,
        sample: &HostSample,
        manual_lock: bool,
        config: &RqdConfig,
    ) -> Option<NimbyEvent> {
        if !self.enabled() {
            return None;
        }

        let present = self.source.input_detected() || self.source.user_session_active();
        if present {
            *self.last_activity.lock().unwrap() = Instant::now();
        }

        if !self.locked() {
            if present {
                self.locked.store(true, Ordering::SeqCst);
                tracing::info!("NIMBY locked: user present");
                return Some(NimbyEvent::Locked);
            }
            return None;
        }

        let idle_for = self.last_activity.lock().unwrap().elapsed();
        let can_unlock = !manual_lock
            && idle_for >= Duration::from_secs(config.minimum_idle)
            && sample.free_mem_kb > config.minimum_mem_kb
            && sample.free_swap_kb > config.minimum_swap_kb
            && sample.load < config.maximum_load;
        if can_unlock {
            self.locked.store(false, Ordering::SeqCst);
            tracing::info!(idle_secs = idle_for.as_secs(), "NIMBY unlocked: host idle");
            return Some(NimbyEvent::Unlocked);
        }
        None
    }

    /// Force the locked state without consulting the source (used when the
    /// controller adopts a lock that predates this process).
    #[cfg(test)]
    pub fn force_lock(&self) {
        self.locked.store(true, Ordering::SeqCst);
    }

    /// Pretend the console has been quiet since `ago`.
    #[cfg(test)]
    pub fn backdate_activity(&self, ago: Duration) {
        *self.last_activity.lock().unwrap() = Instant::now() - ago;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    /// Scripted source for tests.
    struct Scripted {
        input: AtomicBool,
        session: AtomicBool,
    }

    impl Scripted {
        fn quiet() -> Self {
            Self {
                input: AtomicBool::new(false),
                session: AtomicBool::new(false),
            }
        }
    }

    impl ActivitySource for Scripted {
        fn input_detected(&self) -> bool {
            self.input.swap(false, Ordering::SeqCst)
        }
        fn user_session_active(&self) -> bool {
            self.session.load(Ordering::SeqCst)
        }
    }

    fn healthy_sample() -> HostSample {
        HostSample {
            free_mem_kb: 4_000_000,
            free_swap_kb: 4_000_000,
            load: 10,
            ..HostSample::default()
        }
    }

    fn quiet_config() -> RqdConfig {
        RqdConfig {
            minimum_idle: 0,
            ..RqdConfig::default()
        }
    }

    #[test]
    fn input_locks() {
        let src = Scripted::quiet();
        src.input.store(true, Ordering::SeqCst);
        let nimby = Nimby::new(true, Box::new(src));
        let event = nimby.tick(&healthy_sample(), false, &quiet_config());
        assert_eq!(event, Some(NimbyEvent::Locked));
        assert!(nimby.locked());
    }

    #[test]
    fn session_presence_locks() {
        let src = Scripted::quiet();
        src.session.store(true, Ordering::SeqCst);
        let nimby = Nimby::new(true, Box::new(src));
        assert_eq!(
            nimby.tick(&healthy_sample(), false, &quiet_config()),
            Some(NimbyEvent::Locked)
        );
    }

    #[test]
    fn unlocks_only_when_idle_and_healthy() {
        let nimby = Nimby::new(true, Box::new(Scripted::quiet()));
        nimby.force_lock();
        nimby.backdate_activity(Duration::from_secs(1000));

        let config = RqdConfig::default(); // minimum_idle = 900

        // Memory pressure keeps it locked.
        let starved = HostSample {
            free_mem_kb: 1000,
            free_swap_kb: 4_000_000,
            load: 10,
            ..HostSample::default()
        };
        assert_eq!(nimby.tick(&starved, false, &config), None);
        assert!(nimby.locked());

        // Manual lock keeps it locked.
        assert_eq!(nimby.tick(&healthy_sample(), true, &config), None);

        // Healthy and idle unlocks.
        assert_eq!(
            nimby.tick(&healthy_sample(), false, &config),
            Some(NimbyEvent::Unlocked)
        );
        assert!(!nimby.locked());
    }

    #[test]
    fn recent_activity_blocks_unlock() {
        let nimby = Nimby::new(true, Box::new(Scripted::quiet()));
        nimby.force_lock();
        nimby.backdate_activity(Duration::from_secs(10));
        assert_eq!(
            nimby.tick(&healthy_sample(), false, &RqdConfig::default()),
            None
        );
    }

    #[test]
    fn console_listener_flags_readable_input() {
        let mut pipe = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(pipe.as_mut_ptr()) }, 0);
        let source = ConsoleActivity::with_fds(vec![pipe[0]]);
        assert!(!source.input_detected());

        let burst = b"keypress";
        let wrote = unsafe {
            libc::write(pipe[1], burst.as_ptr() as *const libc::c_void, burst.len())
        };
        assert_eq!(wrote, burst.len() as isize);

        let deadline = Instant::now() + Duration::from_secs(2);
        while !source.input_detected() {
            assert!(Instant::now() < deadline, "input never flagged");
            std::thread::sleep(Duration::from_millis(10));
        }
        // Edge-triggered: the flag clears once read.
        assert!(!source.input_detected());
        unsafe { libc::close(pipe[1]) };
    }

    #[test]
    fn disabled_detector_never_locks_and_drops_lock() {
        let src = Scripted::quiet();
        src.input.store(true, Ordering::SeqCst);
        let nimby = Nimby::new(false, Box::new(src));
        assert_eq!(nimby.tick(&healthy_sample(), false, &quiet_config()), None);
        assert!(!nimby.locked());

        nimby.force_lock();
        assert_eq!(nimby.set_enabled(false), Some(NimbyEvent::Unlocked));
        assert!(!nimby.locked());
    }
}
