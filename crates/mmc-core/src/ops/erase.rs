//! Erase, trim, discard and sanitize.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::error::{MmcError, Result};
use crate::protocol::constants::*;
use crate::protocol::{CommandBatch, CommandDescriptor, DeviceStatus};
use crate::register::ExtCsd;
use crate::register::fields::*;
use crate::transport::{MmcTransport, TransportError};

/// CMD38 flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EraseKind {
    Legacy,
    Discard,
    SecureErase,
    SecureTrim1,
    SecureTrim2,
    Trim,
}

impl EraseKind {
    pub const ALL: [EraseKind; 6] = [
        Self::Legacy,
        Self::Discard,
        Self::SecureErase,
        Self::SecureTrim1,
        Self::SecureTrim2,
        Self::Trim,
    ];

    /// CMD38 argument.
    pub fn argument(self) -> u32 {
        match self {
            Self::Legacy => 0x0000_0000,
            Self::Discard => 0x0000_0003,
            Self::SecureErase => 0x8000_0000,
            Self::SecureTrim1 => 0x8000_0001,
            Self::SecureTrim2 => 0x8000_8000,
            Self::Trim => 0x0000_0001,
        }
    }

    /// SEC_FEATURE_SUPPORT bits the device must advertise.
    pub fn required_features(self) -> u8 {
        match self {
            Self::Legacy | Self::Discard => 0,
            Self::SecureErase => EXT_CSD_SEC_ER_EN,
            Self::SecureTrim1 | Self::SecureTrim2 => EXT_CSD_SEC_ER_EN | EXT_CSD_SEC_GB_CL_EN,
            Self::Trim => EXT_CSD_SEC_GB_CL_EN,
        }
    }

    pub fn token(self) -> &'static str {
        match self {
            Self::Legacy => "legacy",
            Self::Discard => "discard",
            Self::SecureErase => "secure-erase",
            Self::SecureTrim1 => "secure-trim1",
            Self::SecureTrim2 => "secure-trim2",
            Self::Trim => "trim",
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Legacy => "Legacy Erase",
            Self::Discard => "Discard",
            Self::SecureErase => "Secure Erase",
            Self::SecureTrim1 => "Secure Trim Step 1",
            Self::SecureTrim2 => "Secure Trim Step 2",
            Self::Trim => "Trim",
        }
    }
}

impl fmt::Display for EraseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EraseKind {
    type Err = MmcError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.token() == s)
            .ok_or_else(|| MmcError::precondition(format!("Unknown erase type: {}", s)))
    }
}

/// Status bits on CMD35/CMD36 that mean the range was refused.
const RANGE_ERRORS: DeviceStatus = DeviceStatus::from_bits_retain(
    DeviceStatus::ERASE_PARAM.bits() | DeviceStatus::ADDRESS_MISALIGN.bits() | DeviceStatus::ADDRESS_OUT_OF_RANGE.bits(),
);

/// Build the three-command erase batch for `[start, end]`.
pub fn erase_batch(kind: EraseKind, start: u32, end: u32) -> CommandBatch {
    CommandBatch::new(vec![
        CommandDescriptor::erase_group_bound(MMC_ERASE_GROUP_START, start),
        CommandDescriptor::erase_group_bound(MMC_ERASE_GROUP_END, end),
        CommandDescriptor::erase(kind.argument()),
    ])
}

/// Erase the inclusive address range `[start, end]`.
///
/// Addresses are sectors on block-addressed parts and bytes otherwise.
#[instrument(skip(transport), fields(device = transport.device_name(), start = %format!("0x{:08x}", start), end = %format!("0x{:08x}", end)))]
pub fn erase<T: MmcTransport + ?Sized>(transport: &T, kind: EraseKind, start: u32, end: u32) -> Result<()> {
    if end < start {
        return Err(MmcError::precondition(format!(
            "erase start [0x{:08x}] > erase end [0x{:08x}]",
            start, end
        )));
    }

    let csd = ExtCsd::read(transport)?;
    let required = kind.required_features();
    if csd.sec_feature_support() & required != required {
        return Err(MmcError::unsupported(
            "Erase",
            format!("{} needs SEC_FEATURE_SUPPORT 0x{:02x}", kind, required),
        ));
    }
    if csd.high_capacity_erase_groups() {
        debug!(
            erase_unit_bytes = csd.hc_erase_grp_size() as u64 * HC_ERASE_UNIT_BYTES,
            erase_timeout_ms = csd.erase_timeout_mult() as u32 * 300,
            "High capacity erase groups in effect"
        );
    }

    info!(%kind, "Executing erase");
    let mut batch = erase_batch(kind, start, end);
    let responses = transport.issue_batch(&mut batch)?;
    let [group_start, group_end, erase_cmd] = responses.as_slice() else {
        return Err(TransportError::InvalidBatch(responses.len()).into());
    };

    for response in [group_start, group_end] {
        let status = response.status();
        if status.intersects(RANGE_ERRORS) {
            warn!(status = %format!("0x{:08x}", status.bits()), "Erase range rejected");
            return Err(MmcError::rejected(
                "erase range",
                format!("response 0x{:08x}", status.bits()),
            ));
        }
    }
    let status = erase_cmd.status();
    if status.contains(DeviceStatus::ERASE_SEQ_ERROR) {
        return Err(MmcError::rejected(
            "erase",
            format!("ERASE_SEQ_ERROR in response 0x{:08x}", status.bits()),
        ));
    }

    info!(%kind, "Erase succeeded");
    Ok(())
}

/// Start a sanitize operation. `timeout_ms` of zero leaves the wait to the
/// transport.
#[instrument(skip(transport), fields(device = transport.device_name()))]
pub fn sanitize<T: MmcTransport + ?Sized>(transport: &T, timeout_ms: u32) -> Result<()> {
    let csd = ExtCsd::read(transport)?;
    if csd.sec_feature_support() & EXT_CSD_SEC_SANITIZE == 0 {
        return Err(MmcError::unsupported("Sanitize", "SEC_SANITIZE not set"));
    }

    let mut cmd =
        CommandDescriptor::switch(EXT_CSD_SANITIZE_START as u8, 0x01).with_timeout_ms(timeout_ms);
    transport.issue(&mut cmd).map_err(|source| MmcError::SwitchFailed {
        index: EXT_CSD_SANITIZE_START as u8,
        value: 0x01,
        source,
    })?;
    info!(timeout_ms, "Sanitize complete");
    Ok(())
}
