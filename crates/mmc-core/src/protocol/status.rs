//! R1 device status decoding.
//!
//! The first response word of an R1/R1b command carries error and status
//! condition bits plus the current device state in bits 9..12.

use std::fmt;

bitflags::bitflags! {
    /// Condition bits of an R1 response.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DeviceStatus: u32 {
        const ADDRESS_OUT_OF_RANGE = 1 << 31;
        const ADDRESS_MISALIGN     = 1 << 30;
        const BLOCK_LEN_ERROR      = 1 << 29;
        const ERASE_SEQ_ERROR      = 1 << 28;
        const ERASE_PARAM          = 1 << 27;
        const WP_VIOLATION         = 1 << 26;
        const DEVICE_IS_LOCKED     = 1 << 25;
        const LOCK_UNLOCK_FAILED   = 1 << 24;
        const COM_CRC_ERROR        = 1 << 23;
        const ILLEGAL_COMMAND      = 1 << 22;
        const DEVICE_ECC_FAILED    = 1 << 21;
        const CC_ERROR             = 1 << 20;
        const ERROR                = 1 << 19;
        const CID_CSD_OVERWRITE    = 1 << 16;
        const WP_ERASE_SKIP        = 1 << 15;
        const ERASE_RESET          = 1 << 13;
        const READY_FOR_DATA       = 1 << 8;
        const SWITCH_ERROR         = 1 << 7;
        const EXCEPTION_EVENT      = 1 << 6;
        const APP_CMD              = 1 << 5;
    }
}

impl DeviceStatus {
    /// Bits that report a failure rather than a condition.
    pub const ERROR_BITS: Self = Self::from_bits_retain(
        Self::ADDRESS_OUT_OF_RANGE.bits()
            | Self::ADDRESS_MISALIGN.bits()
            | Self::BLOCK_LEN_ERROR.bits()
            | Self::ERASE_SEQ_ERROR.bits()
            | Self::ERASE_PARAM.bits()
            | Self::WP_VIOLATION.bits()
            | Self::LOCK_UNLOCK_FAILED.bits()
            | Self::COM_CRC_ERROR.bits()
            | Self::ILLEGAL_COMMAND.bits()
            | Self::DEVICE_ECC_FAILED.bits()
            | Self::CC_ERROR.bits()
            | Self::ERROR.bits()
            | Self::CID_CSD_OVERWRITE.bits()
            | Self::WP_ERASE_SKIP.bits()
            | Self::ERASE_RESET.bits()
            | Self::SWITCH_ERROR.bits(),
    );

    /// Wrap a raw response word, keeping the state field.
    pub const fn from_response(word: u32) -> Self {
        Self::from_bits_retain(word)
    }

    /// Current device state, `None` for reserved encodings.
    pub fn state(self) -> Option<DeviceState> {
        DeviceState::from_bits(((self.bits() >> 9) & 0x0F) as u8)
    }

    /// Only the error bits that are set.
    pub fn errors(self) -> Self {
        self & Self::ERROR_BITS
    }

    pub fn has_error(self) -> bool {
        !self.errors().is_empty()
    }

    /// Full decode for display.
    pub fn report(self) -> StatusReport {
        let mut errors = Vec::new();
        let mut conditions = Vec::new();
        for (name, flag) in self.iter_names() {
            if Self::ERROR_BITS.contains(flag) {
                errors.push(name);
            } else {
                conditions.push(name);
            }
        }
        StatusReport {
            raw: self.bits(),
            state: self.state(),
            errors,
            conditions,
        }
    }
}

/// Device state machine position (R1 bits 9..12).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceState {
    Idle = 0,
    Ready = 1,
    Ident = 2,
    Standby = 3,
    Transfer = 4,
    Data = 5,
    Receive = 6,
    Program = 7,
    Disconnect = 8,
    BusTest = 9,
    Sleep = 10,
}

impl DeviceState {
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits & 0x0F {
            0 => Some(Self::Idle),
            1 => Some(Self::Ready),
            2 => Some(Self::Ident),
            3 => Some(Self::Standby),
            4 => Some(Self::Transfer),
            5 => Some(Self::Data),
            6 => Some(Self::Receive),
            7 => Some(Self::Program),
            8 => Some(Self::Disconnect),
            9 => Some(Self::BusTest),
            10 => Some(Self::Sleep),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceState::Idle => "IDLE",
            DeviceState::Ready => "READY",
            DeviceState::Ident => "IDENT",
            DeviceState::Standby => "STDBY",
            DeviceState::Transfer => "TRANS",
            DeviceState::Data => "DATA",
            DeviceState::Receive => "RCV",
            DeviceState::Program => "PRG",
            DeviceState::Disconnect => "DIS",
            DeviceState::BusTest => "BTST",
            DeviceState::Sleep => "SLP",
        };
        f.write_str(name)
    }
}

/// Decoded SEND_STATUS response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub raw: u32,
    pub state: Option<DeviceState>,
    pub errors: Vec<&'static str>,
    pub conditions: Vec<&'static str>,
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "SEND_STATUS response: 0x{:08x}", self.raw)?;
        for name in &self.errors {
            writeln!(f, "ERROR: {}", name)?;
        }
        match self.state {
            Some(state) => writeln!(f, "DEVICE STATE: {}", state)?,
            None => writeln!(f, "DEVICE STATE: INVALID (reserved encoding)")?,
        }
        for name in &self.conditions {
            writeln!(f, "STATUS: {}", name)?;
        }
        Ok(())
    }
}

/// The four response words returned for one command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandResponse(pub [u32; 4]);

impl CommandResponse {
    /// Interpret word 0 as an R1 status.
    pub fn status(&self) -> DeviceStatus {
        DeviceStatus::from_response(self.0[0])
    }

    pub fn from_r1(word: u32) -> Self {
        Self([word, 0, 0, 0])
    }
}
