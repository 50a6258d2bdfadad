//! Single-register device settings and status queries.

use std::str::FromStr;

use tracing::{info, instrument, warn};

use super::{send_status, write_ext_csd};
use crate::error::{MmcError, Result};
use crate::protocol::constants::*;
use crate::protocol::{CommandClass, CommandDescriptor, Direction, ResponseKind, StatusReport};
use crate::register::fields::*;
use crate::register::{ExtCsd, Revision};
use crate::transport::MmcTransport;

/// CMD13 decoded into named conditions.
pub fn status<T: MmcTransport + ?Sized>(transport: &T) -> Result<StatusReport> {
    Ok(send_status(transport)?.report())
}

/// Raw EXT_CSD write for fields without a dedicated operation.
#[instrument(skip(transport), fields(device = transport.device_name()))]
pub fn write_register<T: MmcTransport + ?Sized>(transport: &T, index: usize, value: u8) -> Result<()> {
    write_ext_csd(transport, index, value)?;
    info!(index, value = %format!("0x{:02x}", value), "EXT_CSD written");
    Ok(())
}

/// Make the RST_n signal permanently enabled or disabled.
///
/// RST_n_FUNCTION is one-time programmable, so a device that already
/// carries either setting is refused.
#[instrument(skip(transport), fields(device = transport.device_name()))]
pub fn set_hw_reset<T: MmcTransport + ?Sized>(transport: &T, enable: bool) -> Result<()> {
    let csd = ExtCsd::read(transport)?;
    match csd.rst_n_function() & EXT_CSD_RST_N_EN_MASK {
        EXT_CSD_HW_RESET_EN => {
            return Err(MmcError::precondition("H/W Reset is already permanently enabled"));
        }
        EXT_CSD_HW_RESET_DIS => {
            return Err(MmcError::precondition("H/W Reset is already permanently disabled"));
        }
        _ => {}
    }

    let value = if enable {
        EXT_CSD_HW_RESET_EN
    } else {
        EXT_CSD_HW_RESET_DIS
    };
    warn!(enable, "Programming RST_n_FUNCTION (one-time)");
    write_ext_csd(transport, EXT_CSD_RST_N_FUNCTION, value)
}

/// Background operations enable mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BkopsMode {
    Auto,
    Manual,
}

impl FromStr for BkopsMode {
    type Err = MmcError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(Self::Auto),
            "manual" => Ok(Self::Manual),
            other => Err(MmcError::precondition(format!(
                "Invalid mode for BKOPS_EN: {}. Valid options: auto or manual",
                other
            ))),
        }
    }
}

#[instrument(skip(transport), fields(device = transport.device_name()))]
pub fn enable_bkops<T: MmcTransport + ?Sized>(transport: &T, mode: BkopsMode) -> Result<()> {
    let csd = ExtCsd::read(transport)?;
    let value = match mode {
        BkopsMode::Auto => {
            csd.require_revision(Revision::V5_0, "AUTO_EN in BKOPS_EN")?;
            BKOPS_AUTO_ENABLE
        }
        BkopsMode::Manual => BKOPS_MAN_ENABLE,
    };
    write_ext_csd(transport, EXT_CSD_BKOPS_EN, value)
}

#[instrument(skip(transport), fields(device = transport.device_name()))]
pub fn set_cache<T: MmcTransport + ?Sized>(transport: &T, enable: bool) -> Result<()> {
    let csd = ExtCsd::read(transport)?;
    csd.require_revision(Revision::V4_5, "Cache")?;
    if csd.cache_size() == 0 {
        return Err(MmcError::unsupported("Cache", "device has no cache"));
    }
    write_ext_csd(transport, EXT_CSD_CACHE_CTRL, enable as u8)
}

/// Result of a request to leave 512-byte emulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeSectorOutcome {
    /// USE_NATIVE_SECTOR written; takes effect after a device reset.
    Switched,
    /// Already running with 4 KiB data sectors.
    AlreadyNative,
}

#[instrument(skip(transport), fields(device = transport.device_name()))]
pub fn disable_512b_emulation<T: MmcTransport + ?Sized>(transport: &T) -> Result<NativeSectorOutcome> {
    let csd = ExtCsd::read(transport)?;
    let native = csd.native_sector_size() != 0;
    let data = csd.data_sector_size() != 0;

    if native && !data && csd.wr_rel_param() & EN_REL_WR != 0 {
        write_ext_csd(transport, EXT_CSD_USE_NATIVE_SECTOR, 0x01)?;
        info!("512B emulation disabled; reset the device to switch to 4KB native sectors");
        Ok(NativeSectorOutcome::Switched)
    } else if native && data {
        info!("512B emulation mode is already disabled");
        Ok(NativeSectorOutcome::AlreadyNative)
    } else {
        Err(MmcError::unsupported(
            "Disabling 512B emulation",
            "device has no 4KB native sector or lacks EN_REL_WR",
        ))
    }
}

/// Default CMD56 argument: read direction.
pub const GEN_CMD_READ_ARG: u32 = 0x01;

/// CMD56 in read mode; returns the 512-byte vendor block.
#[instrument(skip(transport), fields(device = transport.device_name(), arg = %format!("0x{:08x}", arg)))]
pub fn general_command_read<T: MmcTransport + ?Sized>(transport: &T, arg: u32) -> Result<Vec<u8>> {
    if arg & 0x1 == 0 {
        return Err(MmcError::precondition("GEN_CMD read argument must have bit 0 set"));
    }
    let mut cmd = CommandDescriptor::single(MMC_GEN_CMD, Direction::Read, 1, arg, None)
        .with_response(ResponseKind::R1, CommandClass::Adtc);
    transport.issue(&mut cmd)?;
    Ok(cmd.data)
}
