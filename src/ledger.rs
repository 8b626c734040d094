use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RqdError};

/// Point-in-time view of the core ledger, in hundredths of a core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreStats {
    pub total_cores: u32,
    pub idle_cores: u32,
    pub locked_cores: u32,
    pub booked_cores: u32,
}

#[derive(Debug)]
struct Cores {
    total: u32,
    idle: u32,
    locked: u32,
    booked: u32,
    /// Lock requests that could not be honoured because the cores were
    /// booked at the time; satisfied as frames release cores.
    pending_locked: u32,
}

/// Single source of truth for core accounting on this host.
///
/// All counts are in hundredths of a core. The mutex is held only for O(1)
/// arithmetic; callers must never hold a reference across blocking I/O.
#[derive(Debug)]
pub struct CoreLedger {
    inner: Mutex<Cores>,
}

impl CoreLedger {
    pub fn new(total: u32) -> Self {
        Self {
            inner: Mutex::new(Cores {
                total,
                idle: total,
                locked: 0,
                booked: 0,
                pending_locked: 0,
            }),
        }
    }

    pub fn snapshot(&self) -> CoreStats {
        let c = self.inner.lock().unwrap();
        CoreStats {
            total_cores: c.total,
            idle_cores: c.idle,
            locked_cores: c.locked,
            booked_cores: c.booked,
        }
    }

    /// Move `n` cores from idle to booked. Fails without any state change
    /// when fewer than `n` cores are idle.
    pub fn reserve(&self, n: u32) -> Result<()> {
        let mut c = self.inner.lock().unwrap();
        if c.idle < n {
            return Err(RqdError::InsufficientCores {
                requested: n,
                idle: c.idle,
            });
        }
        c.idle -= n;
        c.booked += n;
        c.check("reserve");
        Ok(())
    }

    /// Return `n` booked cores. Pending lock requests are fed first; the
    /// remainder goes back to idle, capped so idle never exceeds
    /// `total - locked - booked`.
    pub fn release(&self, n: u32) {
        let mut c = self.inner.lock().unwrap();
        if c.booked < n {
            tracing::warn!(
                booked = c.booked,
                releasing = n,
                "Releasing more cores than are booked, clamping"
            );
            c.booked = 0;
        } else {
            c.booked -= n;
        }
        let to_lock = n.min(c.pending_locked);
        c.pending_locked -= to_lock;
        c.locked += to_lock;
        let reclaim = n - to_lock;
        let cap = c.total.saturating_sub(c.locked + c.booked);
        c.idle = (c.idle + reclaim).min(cap);
        c.check("release");
    }

    /// Lock up to `n` cores. Whatever is idle moves to locked immediately;
    /// any shortfall is remembered and honoured as frames complete.
    pub fn lock(&self, n: u32) {
        let mut c = self.inner.lock().unwrap();
        let now = n.min(c.idle);
        c.idle -= now;
        c.locked += now;
        c.pending_locked += n - now;
        // A pending lock beyond what bookings could ever free is meaningless.
        let max_pending = c.total.saturating_sub(c.locked + c.idle);
        c.pending_locked = c.pending_locked.min(max_pending);
        c.check("lock");
    }

    /// Unlock `n` cores: cancels pending lock requests first, then moves
    /// locked cores back to idle.
    pub fn unlock(&self, n: u32) {
        let mut c = self.inner.lock().unwrap();
        let cancelled = n.min(c.pending_locked);
        c.pending_locked -= cancelled;
        let back = (n - cancelled).min(c.locked);
        c.locked -= back;
        c.idle += back;
        c.check("unlock");
    }

    pub fn lock_all(&self) {
        let total = self.inner.lock().unwrap().total;
        self.lock(total);
    }

    pub fn unlock_all(&self) {
        let total = self.inner.lock().unwrap().total;
        self.unlock(total);
    }

    pub fn idle(&self) -> u32 {
        self.inner.lock().unwrap().idle
    }

    pub fn locked(&self) -> u32 {
        self.inner.lock().unwrap().locked
    }
}

impl Cores {
    /// Repair the state to the nearest consistent value after a mutation.
    /// A violation here is an accounting bug, so it is logged loudly, but
    /// the daemon keeps running on the repaired state.
    fn check(&mut self, op: &str) {
        if self.idle + self.locked + self.booked > self.total {
            tracing::error!(
                op,
                total = self.total,
                idle = self.idle,
                locked = self.locked,
                booked = self.booked,
                "Core ledger invariant violated, repairing"
            );
            let over = self.idle + self.locked + self.booked - self.total;
            self.idle = self.idle.saturating_sub(over);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_and_release_round_trip() {
        let ledger = CoreLedger::new(800);
        ledger.reserve(200).unwrap();
        let s = ledger.snapshot();
        assert_eq!(s.idle_cores, 600);
        assert_eq!(s.booked_cores, 200);

        ledger.release(200);
        let s = ledger.snapshot();
        assert_eq!(s.idle_cores, 800);
        assert_eq!(s.booked_cores, 0);
    }

    #[test]
    fn reserve_fails_without_change_when_insufficient() {
        let ledger = CoreLedger::new(400);
        ledger.reserve(300).unwrap();
        let err = ledger.reserve(200).unwrap_err();
        assert!(matches!(
            err,
            RqdError::InsufficientCores {
                requested: 200,
                idle: 100
            }
        ));
        let s = ledger.snapshot();
        assert_eq!(s.idle_cores, 100);
        assert_eq!(s.booked_cores, 300);
    }

    #[test]
    fn lock_then_unlock_is_identity() {
        let ledger = CoreLedger::new(800);
        let before = ledger.snapshot();
        ledger.lock(300);
        ledger.unlock(300);
        assert_eq!(ledger.snapshot(), before);
    }

    #[test]
    fn lock_beyond_idle_goes_pending_and_is_honoured_on_release() {
        let ledger = CoreLedger::new(400);
        ledger.reserve(300).unwrap();
        ledger.lock(400);
        let s = ledger.snapshot();
        assert_eq!(s.idle_cores, 0);
        assert_eq!(s.locked_cores, 100);
        assert_eq!(s.booked_cores, 300);

        // Frame completes; its cores feed the pending lock, not idle.
        ledger.release(300);
        let s = ledger.snapshot();
        assert_eq!(s.idle_cores, 0);
        assert_eq!(s.locked_cores, 400);
        assert_eq!(s.booked_cores, 0);
    }

    #[test]
    fn unlock_cancels_pending_first() {
        let ledger = CoreLedger::new(400);
        ledger.reserve(400).unwrap();
        ledger.lock(200); // all pending
        ledger.unlock(200);
        ledger.release(400);
        let s = ledger.snapshot();
        assert_eq!(s.idle_cores, 400);
        assert_eq!(s.locked_cores, 0);
    }

    #[test]
    fn lock_all_and_unlock_all() {
        let ledger = CoreLedger::new(800);
        ledger.reserve(200).unwrap();
        ledger.lock_all();
        let s = ledger.snapshot();
        assert_eq!(s.idle_cores, 0);
        assert_eq!(s.locked_cores, 600);
        assert_eq!(s.booked_cores, 200);

        ledger.unlock_all();
        let s = ledger.snapshot();
        assert_eq!(s.idle_cores, 600);
        assert_eq!(s.locked_cores, 0);
        assert_eq!(s.booked_cores, 200);
    }

    #[test]
    fn double_release_clamps_and_stays_consistent() {
        let ledger = CoreLedger::new(400);
        ledger.reserve(200).unwrap();
        ledger.release(200);
        ledger.release(200);
        let s = ledger.snapshot();
        assert_eq!(s.booked_cores, 0);
        assert_eq!(s.idle_cores, 400);
        assert!(s.idle_cores + s.locked_cores + s.booked_cores <= s.total_cores);
    }
}
