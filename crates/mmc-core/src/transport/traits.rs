//! Device transport abstraction.
//!
//! Defines the `MmcTransport` trait through which every transaction talks
//! to the device, allowing different implementations (Linux ioctl,
//! simulated device, etc.).

use thiserror::Error;

use crate::protocol::{CommandBatch, CommandDescriptor, CommandResponse};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to open {path}: {source}")]
    OpenFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("CMD{opcode} failed: {source}")]
    CommandFailed {
        opcode: u8,
        #[source]
        source: std::io::Error,
    },

    #[error("Multi-command batch of {len} failed: {source}")]
    BatchFailed {
        len: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("Batch of {0} commands is outside the supported range")]
    InvalidBatch(usize),

    #[error("Could not query device size: {0}")]
    SizeQuery(#[source] std::io::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Abstract MMC command transport.
///
/// This trait enables:
/// - Production implementation over the Linux MMC block ioctls
/// - Simulated device for unit testing
///
/// Data-bearing read commands receive their data in the descriptor's own
/// buffer.
pub trait MmcTransport: Send + Sync {
    /// Issue one command and wait for it to finish.
    fn issue(&self, cmd: &mut CommandDescriptor) -> Result<CommandResponse, TransportError>;

    /// Issue every command of `batch` in order without interleaving.
    ///
    /// Either all responses are returned or the batch fails as a unit.
    fn issue_batch(&self, batch: &mut CommandBatch) -> Result<Vec<CommandResponse>, TransportError>;

    /// Device size in 512-byte blocks.
    fn capacity_blocks(&self) -> Result<u64, TransportError>;

    /// Path or name used in diagnostics.
    fn device_name(&self) -> &str;
}

impl<T: MmcTransport + ?Sized> MmcTransport for &T {
    fn issue(&self, cmd: &mut CommandDescriptor) -> Result<CommandResponse, TransportError> {
        (**self).issue(cmd)
    }

    fn issue_batch(&self, batch: &mut CommandBatch) -> Result<Vec<CommandResponse>, TransportError> {
        (**self).issue_batch(batch)
    }

    fn capacity_blocks(&self) -> Result<u64, TransportError> {
        (**self).capacity_blocks()
    }

    fn device_name(&self) -> &str {
        (**self).device_name()
    }
}
