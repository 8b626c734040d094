use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, RqdError};
use crate::frame::request::{epoch_now, FrameRequest, RunningFrame};
use crate::frame::sampler;

/// Slack allowed when matching a snapshot entry's recorded start time
/// against the live process table. Outside this window the pid is assumed
/// to have been reused by an unrelated process.
const START_TIME_SLACK_SECS: u64 = 2;

/// One entry of the crash-recovery snapshot: just enough to re-adopt the
/// child after a daemon restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub frame_id: Uuid,
    pub pid: u32,
    pub start_time: u64,
    pub request: FrameRequest,
}

/// Every frame currently executing on this host, keyed by frame id.
///
/// The mutex guards O(1) map work only; callers must never hold a returned
/// frame's lock while blocked on I/O.
#[derive(Debug, Default)]
pub struct FrameCache {
    frames: Mutex<HashMap<Uuid, Arc<RunningFrame>>>,
}

impl FrameCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a frame. The uniqueness check and the insertion happen under
    /// one lock, so two launches with the same id cannot both succeed.
    pub fn store(&self, frame: Arc<RunningFrame>) -> Result<()> {
        let mut frames = self.frames.lock().unwrap();
        let id = frame.request.frame_id;
        if frames.contains_key(&id) {
            return Err(RqdError::DuplicateFrame(id));
        }
        frames.insert(id, frame);
        Ok(())
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<RunningFrame>> {
        self.frames.lock().unwrap().get(id).cloned()
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.frames.lock().unwrap().contains_key(id)
    }

    /// Idempotent removal.
    pub fn remove(&self, id: &Uuid) -> Option<Arc<RunningFrame>> {
        self.frames.lock().unwrap().remove(id)
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.frames.lock().unwrap().keys().copied().collect()
    }

    pub fn running(&self) -> Vec<Arc<RunningFrame>> {
        self.frames.lock().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().unwrap().is_empty()
    }

    /// Serialise the cache for crash recovery. Written to a temp file and
    /// renamed into place so readers never see a partial snapshot.
    pub fn snapshot_to_disk(&self, path: &Path) -> std::io::Result<()> {
        let entries: Vec<SnapshotEntry> = self
            .running()
            .into_iter()
            .map(|f| SnapshotEntry {
                frame_id: f.request.frame_id,
                pid: f.pid(),
                start_time: f.start_time,
                request: f.request.clone(),
            })
            .collect();

        let json = serde_json::to_vec_pretty(&entries)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)
    }

    /// Re-adopt frames recorded by a previous daemon incarnation.
    ///
    /// An entry is adopted only when it is younger than `ttl_secs`, its pid
    /// is still alive, and the live process's start time matches the
    /// recorded one; anything else is discarded. Returns the adopted
    /// frames so the controller can book their cores and watch for exit.
    pub fn reconcile_from_disk(&self, path: &Path, ttl_secs: u64) -> Vec<Arc<RunningFrame>> {
        let raw = match std::fs::read(path) {
            Ok(raw) => raw,
            Err(_) => return Vec::new(),
        };
        let entries: Vec<SnapshotEntry> = match serde_json::from_slice(&raw) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(error = %e, "Discarding unreadable frame cache snapshot");
                return Vec::new();
            }
        };

        let now = epoch_now();
        let mut adopted = Vec::new();
        for entry in entries {
            if now.saturating_sub(entry.start_time) > ttl_secs {
                tracing::info!(frame_id = %entry.frame_id, "Snapshot entry expired, discarding");
                continue;
            }
            if !sampler::pid_alive(entry.pid) {
                tracing::info!(frame_id = %entry.frame_id, pid = entry.pid, "Snapshot pid gone, discarding");
                continue;
            }
            match sampler::process_start_time(entry.pid) {
                Some(live_start)
                    if live_start.abs_diff(entry.start_time) <= START_TIME_SLACK_SECS => {}
                _ => {
                    tracing::warn!(
                        frame_id = %entry.frame_id,
                        pid = entry.pid,
                        "Snapshot pid reused by another process, discarding"
                    );
                    continue;
                }
            }

            let frame = Arc::new(RunningFrame::with_start_time(
                entry.request,
                entry.start_time,
            ));
            frame.set_pid(entry.pid);
            if self.store(frame.clone()).is_ok() {
                tracing::info!(frame_id = %frame.request.frame_id, pid = entry.pid, "Re-adopted running frame");
                adopted.push(frame);
            }
        }
        adopted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::request::test_request;

    #[test]
    fn duplicate_store_is_refused() {
        let cache = FrameCache::new();
        let frame = Arc::new(RunningFrame::new(test_request()));
        let id = frame.request.frame_id;
        cache.store(frame.clone()).unwrap();

        let dup = Arc::new(RunningFrame::new(frame.request.clone()));
        let err = cache.store(dup).unwrap_err();
        assert!(matches!(err, RqdError::DuplicateFrame(d) if d == id));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn remove_is_idempotent() {
        let cache = FrameCache::new();
        let frame = Arc::new(RunningFrame::new(test_request()));
        let id = frame.request.frame_id;
        cache.store(frame).unwrap();

        assert!(cache.remove(&id).is_some());
        assert!(cache.remove(&id).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn snapshot_round_trip_adopts_live_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");

        // Our own pid with our own start time is the one pid guaranteed to
        // pass the aliveness and identity checks.
        let own_pid = std::process::id();
        let own_start = sampler::process_start_time(own_pid).unwrap();

        let cache = FrameCache::new();
        let frame = Arc::new(RunningFrame::with_start_time(test_request(), own_start));
        frame.set_pid(own_pid);
        let id = frame.request.frame_id;
        cache.store(frame).unwrap();
        cache.snapshot_to_disk(&path).unwrap();

        let restored = FrameCache::new();
        let adopted = restored.reconcile_from_disk(&path, 3600);
        assert_eq!(adopted.len(), 1);
        assert!(restored.contains(&id));
        assert_eq!(adopted[0].pid(), own_pid);
    }

    #[test]
    fn reconcile_discards_dead_and_reused_pids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");

        let cache = FrameCache::new();
        let dead = Arc::new(RunningFrame::new(test_request()));
        dead.set_pid(4_000_000);
        cache.store(dead).unwrap();

        // pid 1 is alive but its start time will not match a fresh frame.
        let reused = Arc::new(RunningFrame::new(test_request()));
        reused.set_pid(1);
        cache.store(reused).unwrap();

        cache.snapshot_to_disk(&path).unwrap();

        let restored = FrameCache::new();
        assert!(restored.reconcile_from_disk(&path, 3600).is_empty());
        assert!(restored.is_empty());
    }

    #[test]
    fn reconcile_honours_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");

        let cache = FrameCache::new();
        let frame = Arc::new(RunningFrame::with_start_time(
            test_request(),
            epoch_now() - 7200,
        ));
        frame.set_pid(std::process::id());
        cache.store(frame).unwrap();
        cache.snapshot_to_disk(&path).unwrap();

        let restored = FrameCache::new();
        assert!(restored.reconcile_from_disk(&path, 3600).is_empty());
    }

    #[test]
    fn missing_snapshot_is_not_an_error() {
        let cache = FrameCache::new();
        let adopted =
            cache.reconcile_from_disk(Path::new("/nonexistent/cache.json"), 3600);
        assert!(adopted.is_empty());
    }
}
