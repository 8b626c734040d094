pub mod hyperthread;
pub mod nimby;
pub mod probe;

pub use hyperthread::ThreadAllocator;
pub use nimby::{ActivitySource, ConsoleActivity, Nimby, NimbyEvent};
pub use probe::{HostProbe, HostSample, StaticHostInfo};
