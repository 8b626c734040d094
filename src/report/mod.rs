//! Outbound report payloads. Field names are the daemon's side of the
//! wire contract with the scheduler; the semantics follow the host and
//! frame data model.

pub mod reporter;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::frame::request::{FrameAttributes, RunningFrame};
use crate::ledger::CoreStats;

pub use reporter::{Report, Reporter, ReporterHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HardwareState {
    Up,
    Down,
    Rebooting,
    Repair,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockState {
    Open,
    NimbyLocked,
    Locked,
}

/// The host descriptor: static facts plus the latest sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderHost {
    pub name: String,
    pub facility: String,
    pub tags: Vec<String>,
    pub os: String,
    pub boot_time: u64,
    /// Hundredths of a core.
    pub total_cores: u32,
    pub num_procs: u32,
    pub hyperthread_multiplier: u32,
    pub total_mem_kb: u64,
    pub free_mem_kb: u64,
    pub total_swap_kb: u64,
    pub free_swap_kb: u64,
    pub total_mcp_kb: u64,
    pub free_mcp_kb: u64,
    pub total_gpu_kb: u64,
    pub free_gpu_kb: u64,
    /// One-minute load x100 over the hyper-thread multiplier, plus the
    /// configured modifier.
    pub load: u32,
    pub nimby_enabled: bool,
    pub hardware_state: HardwareState,
    pub lock_state: LockState,
    /// Unix uid the daemon runs under.
    pub uid: u32,
}

/// Per-frame entry carried on status and completion reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameSummary {
    pub frame_id: Uuid,
    pub resource_id: Uuid,
    pub job_id: Uuid,
    pub job_name: String,
    pub layer_name: String,
    pub frame_name: String,
    pub num_cores: u32,
    pub pid: u32,
    pub start_time: u64,
    pub rss_kb: u64,
    pub max_rss_kb: u64,
    pub used_swap_kb: u64,
    pub used_cpu_sec: u64,
    pub attributes: FrameAttributes,
}

impl FrameSummary {
    pub fn from_frame(frame: &RunningFrame) -> Self {
        Self {
            frame_id: frame.request.frame_id,
            resource_id: frame.request.resource_id,
            job_id: frame.request.job_id,
            job_name: frame.request.job_name.clone(),
            layer_name: frame.request.layer_name.clone(),
            frame_name: frame.request.frame_name.clone(),
            num_cores: frame.request.num_cores,
            pid: frame.pid(),
            start_time: frame.start_time,
            rss_kb: frame.rss_kb(),
            max_rss_kb: frame.max_rss_kb(),
            used_swap_kb: frame.used_swap_kb(),
            used_cpu_sec: frame.used_cpu_sec(),
            attributes: frame.attributes(),
        }
    }
}

/// Sent exactly once after the daemon initialises.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootReport {
    pub host: RenderHost,
    pub cores: CoreStats,
}

/// Sent on the ping timer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub host: RenderHost,
    pub cores: CoreStats,
    pub frames: Vec<FrameSummary>,
}

/// Sent after every supervisor finishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameCompleteReport {
    pub host: RenderHost,
    pub frame: FrameSummary,
    pub exit_status: i32,
    pub exit_signal: i32,
    pub run_time_sec: u64,
}
