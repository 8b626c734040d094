//! Outbound channel to the scheduler.
//!
//! A single task drains a FIFO queue, so delivery order is preserved per
//! report type. Status reports are fire-and-forget (the next tick
//! re-announces everything); frame-complete reports are retried because
//! they carry state the scheduler cannot reconstruct.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{RqdConfig, MAX_STARTUP_CONNECT_DELAY_SEC};
use crate::error::{Result, RqdError};
use crate::report::{BootReport, FrameCompleteReport, StatusReport};

/// Retry ceiling for frame-complete deliveries. Beyond this the report is
/// spooled to disk and re-sent when the reporter next starts.
const MAX_COMPLETE_ATTEMPTS: u32 = 5;

/// Boot report attempts before the daemon gives up and exits.
const MAX_BOOT_ATTEMPTS: u32 = 10;

#[derive(Debug)]
pub enum Report {
    Status(StatusReport),
    FrameComplete(FrameCompleteReport),
}

/// Cloneable producer side of the report queue.
#[derive(Clone)]
pub struct ReporterHandle {
    tx: mpsc::Sender<Report>,
}

impl ReporterHandle {
    pub async fn send(&self, report: Report) {
        if self.tx.send(report).await.is_err() {
            tracing::warn!("Reporter queue closed, dropping report");
        }
    }

    /// Non-async producer path; used from sync control handlers.
    pub fn try_send(&self, report: Report) {
        if let Err(e) = self.tx.try_send(report) {
            tracing::warn!(error = %e, "Reporter queue full or closed, dropping report");
        }
    }
}

pub struct Reporter {
    client: reqwest::Client,
    base: String,
    startup_delay: Duration,
    critical_delay: Duration,
    /// Where undeliverable frame-complete reports survive a restart.
    /// Lives next to the frame snapshot; `None` when snapshots are off.
    spool_path: Option<PathBuf>,
}

impl Reporter {
    pub fn new(config: &RqdConfig) -> (Self, ReporterHandle, mpsc::Receiver<Report>) {
        let (tx, rx) = mpsc::channel(256);
        (
            Self {
                client: reqwest::Client::new(),
                base: config.cuebot_endpoint.trim_end_matches('/').to_string(),
                startup_delay: Duration::from_secs(config.startup_connect_delay_secs),
                critical_delay: Duration::from_secs(config.critical_report_delay_secs),
                spool_path: config
                    .backup_cache_path
                    .as_ref()
                    .map(|p| p.with_file_name("pending-reports.json")),
            },
            ReporterHandle { tx },
            rx,
        )
    }

    async fn post<T: serde::Serialize>(&self, path: &str, body: &T) -> Result<()> {
        let url = format!("{}{}", self.base, path);
        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| RqdError::Report(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(RqdError::Report(format!(
                "{} returned {}",
                url,
                resp.status()
            )));
        }
        Ok(())
    }

    /// Deliver the boot report, backing off exponentially up to the
    /// ceiling. Failure here is fatal to the daemon: a host that cannot
    /// announce itself should be visibly down.
    pub async fn send_boot(&self, report: &BootReport) -> Result<()> {
        let mut delay = self.startup_delay;
        for attempt in 1..=MAX_BOOT_ATTEMPTS {
            match self.post("/report/boot", report).await {
                Ok(()) => {
                    tracing::info!(host = %report.host.name, "Boot report delivered");
                    return Ok(());
                }
                Err(e) if attempt == MAX_BOOT_ATTEMPTS => return Err(e),
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "Boot report failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(MAX_STARTUP_CONNECT_DELAY_SEC));
                }
            }
        }
        unreachable!("boot retry loop returns before exhausting attempts")
    }

    /// Drain the queue until the daemon shuts down. Completions spooled by
    /// a previous incarnation are re-sent first.
    pub async fn run(self, mut rx: mpsc::Receiver<Report>, token: CancellationToken) {
        self.flush_spool().await;
        loop {
            let report = tokio::select! {
                r = rx.recv() => match r {
                    Some(r) => r,
                    None => break,
                },
                _ = token.cancelled() => break,
            };
            match report {
                Report::Status(status) => {
                    if let Err(e) = self.post("/report/status", &status).await {
                        tracing::warn!(error = %e, "Status report failed, next tick re-announces");
                    }
                }
                Report::FrameComplete(complete) => {
                    if !self.send_complete(&complete).await {
                        self.spool(complete);
                    }
                }
            }
        }
        tracing::debug!("Reporter stopped");
    }

    /// Deliver one completion, retrying up to the ceiling. Returns whether
    /// the scheduler accepted it.
    async fn send_complete(&self, report: &FrameCompleteReport) -> bool {
        for attempt in 1..=MAX_COMPLETE_ATTEMPTS {
            match self.post("/report/frame-complete", report).await {
                Ok(()) => return true,
                Err(e) => {
                    tracing::warn!(
                        frame_id = %report.frame.frame_id,
                        attempt,
                        error = %e,
                        "Frame-complete report failed"
                    );
                    if attempt < MAX_COMPLETE_ATTEMPTS {
                        tokio::time::sleep(self.critical_delay).await;
                    }
                }
            }
        }
        false
    }

    /// A completion carries state the scheduler cannot reconstruct, so an
    /// undeliverable one is persisted instead of dropped.
    fn spool(&self, report: FrameCompleteReport) {
        let Some(path) = &self.spool_path else {
            tracing::error!(
                frame_id = %report.frame.frame_id,
                "Dropping undeliverable frame-complete report, no snapshot path configured"
            );
            return;
        };
        let mut pending = read_spool(path);
        pending.push(report);
        match write_spool(path, &pending) {
            Ok(()) => {
                tracing::warn!(
                    path = %path.display(),
                    count = pending.len(),
                    "Frame-complete report spooled for redelivery"
                );
            }
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "Cannot spool frame-complete report");
            }
        }
    }

    async fn flush_spool(&self) {
        let Some(path) = &self.spool_path else {
            return;
        };
        let pending = read_spool(path);
        if pending.is_empty() {
            return;
        }
        let _ = std::fs::remove_file(path);
        tracing::info!(count = pending.len(), "Redelivering spooled frame-complete reports");
        for report in pending {
            if !self.send_complete(&report).await {
                self.spool(report);
            }
        }
    }
}

fn read_spool(path: &Path) -> Vec<FrameCompleteReport> {
    let Ok(raw) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    serde_json::from_str(&raw).unwrap_or_else(|e| {
        tracing::warn!(path = %path.display(), error = %e, "Discarding unreadable report spool");
        Vec::new()
    })
}

/// Write temp + rename, same as the frame snapshot.
fn write_spool(path: &Path, reports: &[FrameCompleteReport]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, serde_json::to_vec(reports)?)?;
    std::fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_exits_when_all_handles_drop() {
        let config = RqdConfig::default();
        let (reporter, handle, rx) = Reporter::new(&config);
        let token = CancellationToken::new();
        drop(handle);
        // No producers left: run must return immediately.
        reporter.run(rx, token).await;
    }

    #[tokio::test]
    async fn run_exits_on_cancellation() {
        let config = RqdConfig::default();
        let (reporter, _handle, rx) = Reporter::new(&config);
        let token = CancellationToken::new();
        token.cancel();
        reporter.run(rx, token).await;
    }
}
