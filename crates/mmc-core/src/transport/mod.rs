//! Transport layer module.

#[cfg(target_os = "linux")]
pub mod ioctl;
pub mod mock;
pub mod traits;

#[cfg(target_os = "linux")]
pub use ioctl::IoctlTransport;
pub use mock::{LoggedCommand, MockTransport};
pub use traits::{MmcTransport, TransportError};
