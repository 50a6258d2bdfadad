//! Device transactions built on the command encoder and a transport.
//!
//! Every operation reads EXT_CSD afresh, checks the device can do what is
//! asked and only then issues mutating commands.

pub mod boot;
pub mod erase;
pub mod ffu;
pub mod partition;
pub mod rpmb;
pub mod settings;
pub mod write_protect;

use tracing::debug;

use crate::error::{MmcError, Result};
use crate::protocol::{CommandDescriptor, DeviceStatus};
use crate::transport::MmcTransport;

/// Write one EXT_CSD byte with CMD6.
pub fn write_ext_csd<T: MmcTransport + ?Sized>(transport: &T, index: usize, value: u8) -> Result<()> {
    let index = u8::try_from(index)
        .map_err(|_| MmcError::precondition(format!("EXT_CSD index {} is not writable", index)))?;
    debug!(index, value = %format!("0x{:02x}", value), "EXT_CSD write");
    let mut cmd = CommandDescriptor::switch(index, value);
    transport
        .issue(&mut cmd)
        .map_err(|source| MmcError::SwitchFailed { index, value, source })?;
    Ok(())
}

/// CMD13: current R1 status.
pub fn send_status<T: MmcTransport + ?Sized>(transport: &T) -> Result<DeviceStatus> {
    let mut cmd = CommandDescriptor::send_status();
    let response = transport.issue(&mut cmd)?;
    Ok(response.status())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register::fields::EXT_CSD_CACHE_CTRL;
    use crate::transport::MockTransport;

    #[test]
    fn test_write_ext_csd_maps_failure() {
        let mock = MockTransport::new();
        mock.fail_switch(EXT_CSD_CACHE_CTRL as u8);
        let err = write_ext_csd(&mock, EXT_CSD_CACHE_CTRL, 1).unwrap_err();
        assert!(matches!(err, MmcError::SwitchFailed { index: 33, value: 1, .. }));
    }

    #[test]
    fn test_write_ext_csd_rejects_read_only_offsets() {
        let mock = MockTransport::new();
        assert!(write_ext_csd(&mock, 300, 1).is_err());
        assert!(mock.command_log().is_empty());
    }

    #[test]
    fn test_send_status() {
        let mock = MockTransport::new();
        assert_eq!(send_status(&mock).unwrap().bits(), 0x900);
    }
}
