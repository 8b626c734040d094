//! Render host agent: runs frames on behalf of a render farm scheduler,
//! reports host and frame state back to it, and yields to humans at the
//! keyboard.

pub mod config;
pub mod control;
pub mod error;
pub mod frame;
pub mod host;
pub mod ledger;
pub mod machine;
pub mod report;
pub mod shutdown;

pub use config::RqdConfig;
pub use error::{Result, RqdError};
pub use machine::{ExitAction, Machine};
