//! Frame execution: the launch request model, the cache of running
//! frames, per-frame logs, the resource sampler, and the supervisor.

pub mod cache;
pub mod logfile;
pub mod request;
pub mod sampler;
pub mod supervisor;

pub use cache::FrameCache;
pub use request::{FrameAttributes, FrameExit, FrameRequest, RunningFrame};
