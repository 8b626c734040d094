use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum RqdError {
    #[error("Frame already running: {0}")]
    DuplicateFrame(Uuid),

    #[error("Insufficient idle cores: requested {requested}, idle {idle}")]
    InsufficientCores { requested: u32, idle: u32 },

    #[error("Host is down")]
    HostDown,

    #[error("Host is NIMBY locked")]
    NimbyLocked,

    #[error("Shutdown pending, not accepting launches")]
    ShutdownPending,

    #[error("Invalid frame request: {0}")]
    InvalidRequest(String),

    #[error("Frame not found: {0}")]
    FrameNotFound(Uuid),

    #[error("User logged in, refusing reboot")]
    UserLoggedIn,

    #[error("Operation requires root")]
    NotRoot,

    #[error("Report delivery failed: {0}")]
    Report(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RqdError>;
