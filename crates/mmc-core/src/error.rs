//! Error taxonomy for device transactions.

use thiserror::Error;

use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum MmcError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Could not write 0x{value:02x} to EXT_CSD[{index}]: {source}")]
    SwitchFailed {
        index: u8,
        value: u8,
        #[source]
        source: TransportError,
    },

    #[error("{feature} is not supported: {reason}")]
    Unsupported {
        feature: &'static str,
        reason: String,
    },

    #[error("{0}")]
    Precondition(String),

    #[error("Device rejected {operation}: {detail}")]
    DeviceRejected {
        operation: &'static str,
        detail: String,
    },

    /// The data is still handed back so the caller can inspect it.
    #[error("RPMB authentication code mismatch over {} byte(s) of data", .data.len())]
    IntegrityMismatch { data: Vec<u8> },
}

impl MmcError {
    pub(crate) fn unsupported(feature: &'static str, reason: impl Into<String>) -> Self {
        Self::Unsupported {
            feature,
            reason: reason.into(),
        }
    }

    pub(crate) fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition(message.into())
    }

    pub(crate) fn rejected(operation: &'static str, detail: impl Into<String>) -> Self {
        Self::DeviceRejected {
            operation,
            detail: detail.into(),
        }
    }
}

pub type Result<T, E = MmcError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_failures_surface_through_transport() {
        let io = std::io::Error::other("ioctl failed");
        let err: MmcError = TransportError::CommandFailed { opcode: 8, source: io }.into();
        assert!(matches!(err, MmcError::Transport(TransportError::CommandFailed { opcode: 8, .. })));
        let source = std::error::Error::source(&err).and_then(std::error::Error::source);
        assert_eq!(source.map(ToString::to_string).as_deref(), Some("ioctl failed"));
    }
}
