//! mmc-core: host-side MMC/eMMC command layer.
//!
//! Drives an eMMC device through raw command submission: EXT_CSD access,
//! write protection, partition provisioning, erase and sanitize, RPMB and
//! field firmware update.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Register**: EXT_CSD field offsets and typed accessors
//! - **Protocol**: Command encoding and R1 status decoding
//! - **Transport**: Command submission (Linux ioctl, simulated device)
//! - **Ops**: Device transactions built on the two layers above
//! - **Auth**: RPMB HMAC-SHA256
//! - **Events**: Observer pattern for front ends
//! - **Session**: Configuration and orchestrator
//!
//! # Example
//!
//! ```no_run
//! use mmc_core::session::{MmcSession, SessionConfig, load_firmware};
//! use mmc_core::transport::MockTransport;
//!
//! let session = MmcSession::new(MockTransport::new(), SessionConfig::default());
//! let image = load_firmware("fw.bin").expect("firmware");
//! session.run_ffu(&image, None).expect("FFU failed");
//! ```

pub mod auth;
pub mod error;
pub mod events;
pub mod ops;
pub mod payload;
pub mod protocol;
pub mod register;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use auth::RpmbKey;
pub use error::{MmcError, Result};
pub use events::{FfuPhase, LogLevel, MmcEvent, MmcObserver, NullObserver, TracingObserver};
pub use payload::{ChunkState, FirmwareImage};
pub use protocol::{CommandBatch, CommandDescriptor, DeviceStatus, StatusReport};
pub use register::{ExtCsd, Revision};
pub use session::{MmcSession, ObservableTransport, SessionConfig};
#[cfg(target_os = "linux")]
pub use transport::IoctlTransport;
pub use transport::{MmcTransport, MockTransport, TransportError};
