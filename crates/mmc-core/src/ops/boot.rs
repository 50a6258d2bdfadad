//! Boot partition configuration and boot-mode reads.

use std::fmt;
use std::str::FromStr;

use tracing::{debug, info, instrument};

use super::write_ext_csd;
use crate::error::{MmcError, Result};
use crate::protocol::constants::*;
use crate::protocol::{CommandBatch, CommandClass, CommandDescriptor, Direction, ResponseKind};
use crate::register::ExtCsd;
use crate::register::fields::*;
use crate::transport::MmcTransport;

/// Partition the device boots from, as encoded in PART_CONFIG[5:3].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootArea {
    Disabled = 0,
    Boot0 = 1,
    Boot1 = 2,
    UserArea = 7,
}

impl BootArea {
    pub fn from_number(number: u8) -> Result<Self> {
        match number {
            0 => Ok(Self::Disabled),
            1 => Ok(Self::Boot0),
            2 => Ok(Self::Boot1),
            7 => Ok(Self::UserArea),
            other => Err(MmcError::precondition(format!(
                "Cannot enable the boot area {}; valid values are 0, 1, 2 and 7",
                other
            ))),
        }
    }
}

/// PART_CONFIG after selecting `area` and the boot acknowledge flag.
pub fn part_config_value(current: u8, area: BootArea, send_ack: bool) -> u8 {
    let mut value = current;
    match area {
        BootArea::Disabled => value &= !(7 << 3),
        BootArea::Boot0 => {
            value |= 1 << 3;
            value &= !(3 << 4);
        }
        BootArea::Boot1 => {
            value |= 1 << 4;
            value &= !(1 << 3);
            value &= !(1 << 5);
        }
        BootArea::UserArea => value |= 7 << 3,
    }
    if send_ack {
        value |= EXT_CSD_PART_CONFIG_ACC_ACK;
    } else {
        value &= !EXT_CSD_PART_CONFIG_ACC_ACK;
    }
    value
}

/// Select the boot partition. With `send_ack` the device answers the boot
/// request with the "010" acknowledge pattern.
#[instrument(skip(transport), fields(device = transport.device_name()))]
pub fn enable_boot_partition<T: MmcTransport + ?Sized>(transport: &T, area: BootArea, send_ack: bool) -> Result<()> {
    let csd = ExtCsd::read(transport)?;
    let value = part_config_value(csd.part_config(), area, send_ack);
    write_ext_csd(transport, EXT_CSD_PART_CONFIG, value)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootMode {
    SingleBackward,
    SingleHs,
    Dual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootBusReset {
    X1,
    Retain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootBusWidth {
    X1,
    X4,
    X8,
}

impl FromStr for BootMode {
    type Err = MmcError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "single_backward" => Ok(Self::SingleBackward),
            "single_hs" => Ok(Self::SingleHs),
            "dual" => Ok(Self::Dual),
            _ => Err(MmcError::precondition(format!("illegal <boot_mode> specified: {}", s))),
        }
    }
}

impl FromStr for BootBusReset {
    type Err = MmcError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "x1" => Ok(Self::X1),
            "retain" => Ok(Self::Retain),
            _ => Err(MmcError::precondition(format!(
                "illegal <reset_boot_bus_conditions> specified: {}",
                s
            ))),
        }
    }
}

impl FromStr for BootBusWidth {
    type Err = MmcError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "x1" => Ok(Self::X1),
            "x4" => Ok(Self::X4),
            "x8" => Ok(Self::X8),
            _ => Err(MmcError::precondition(format!("illegal <boot_bus_width> specified: {}", s))),
        }
    }
}

/// BOOT_BUS_CONDITIONS contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootBusConditions {
    pub mode: BootMode,
    pub reset: BootBusReset,
    pub width: BootBusWidth,
}

impl BootBusConditions {
    pub fn value(&self) -> u8 {
        let mode = match self.mode {
            BootMode::SingleBackward => BOOT_MODE_SINGLE_BACKWARD,
            BootMode::SingleHs => BOOT_MODE_SINGLE_HS,
            BootMode::Dual => BOOT_MODE_DUAL,
        };
        let reset = match self.reset {
            BootBusReset::X1 => BOOT_BUS_RESET_X1,
            BootBusReset::Retain => BOOT_BUS_RESET_RETAIN,
        };
        let width = match self.width {
            BootBusWidth::X1 => BOOT_BUS_WIDTH_X1,
            BootBusWidth::X4 => BOOT_BUS_WIDTH_X4,
            BootBusWidth::X8 => BOOT_BUS_WIDTH_X8,
        };
        mode | reset | width
    }
}

impl fmt::Display for BootBusConditions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{:?}/{:?} (0x{:02x})", self.mode, self.reset, self.width, self.value())
    }
}

#[instrument(skip(transport), fields(device = transport.device_name()))]
pub fn set_boot_bus_conditions<T: MmcTransport + ?Sized>(transport: &T, conditions: BootBusConditions) -> Result<()> {
    let csd = ExtCsd::read(transport)?;
    let value = conditions.value();
    info!(
        from = %format!("0x{:02x}", csd.boot_bus_conditions()),
        to = %format!("0x{:02x}", value),
        "Changing BOOT_BUS_CONDITIONS"
    );
    write_ext_csd(transport, EXT_CSD_BOOT_BUS_CONDITIONS, value)
}

/// CMD0 flavour without a data phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleKind {
    /// GO_IDLE_STATE: soft reset.
    SoftReset,
    /// GO_PRE_IDLE_STATE.
    PreIdle,
}

impl IdleKind {
    fn argument(self) -> u32 {
        match self {
            Self::SoftReset => MMC_GO_IDLE_STATE_ARG,
            Self::PreIdle => MMC_GO_PRE_IDLE_STATE_ARG,
        }
    }
}

/// Send CMD0. The device drops off the bus, so a transport error is
/// expected and only logged.
#[instrument(skip(transport), fields(device = transport.device_name()))]
pub fn go_idle<T: MmcTransport + ?Sized>(transport: &T, kind: IdleKind) {
    let mut cmd = CommandDescriptor::go_idle(kind.argument());
    if let Err(e) = transport.issue(&mut cmd) {
        debug!(error = %e, "CMD0 reported an error");
    }
}

/// Number of 512-byte blocks read by an alternative boot operation.
pub fn boot_read_blocks(csd: &ExtCsd) -> u32 {
    let size = csd.boot_partition_size();
    if size > MMC_IOC_MAX_BYTES {
        info!("Boot partition size is bigger than the ioctl limit, limiting to 512K");
    }
    (size.min(MMC_IOC_MAX_BYTES) / MMC_BLOCK_SIZE) as u32
}

/// Read the boot partition through the alternative boot mode.
#[instrument(skip(transport), fields(device = transport.device_name()))]
pub fn alternative_boot_read<T: MmcTransport + ?Sized>(transport: &T) -> Result<Vec<u8>> {
    let csd = ExtCsd::read(transport)?;
    if csd.boot_info() & EXT_CSD_BOOT_INFO_ALT == 0 {
        return Err(MmcError::unsupported(
            "Alternative boot",
            "BOOT_INFO does not advertise alternative boot mode",
        ));
    }
    if csd.part_config() & EXT_CSD_PART_CONFIG_ACC_ACK != 0 {
        return Err(MmcError::precondition("Boot Ack must not be enabled"));
    }
    let blocks = boot_read_blocks(&csd);

    let pre_idle = CommandDescriptor::go_idle(MMC_GO_PRE_IDLE_STATE_ARG)
        .with_response(ResponseKind::None, CommandClass::Ac);
    let boot = CommandDescriptor::single(MMC_GO_IDLE_STATE, Direction::Read, blocks, MMC_BOOT_INITIATION_ARG, None)
        .with_response(ResponseKind::None, CommandClass::Adtc)
        .with_data_timeout_ns(BOOT_DATA_TIMEOUT_NS);

    let mut batch = CommandBatch::new(vec![pre_idle, boot]);
    transport.issue_batch(&mut batch)?;
    let data = batch.into_commands().pop().map(|cmd| cmd.data).unwrap_or_default();
    info!(bytes = data.len(), "Boot data read");
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    #[test]
    fn test_part_config_values() {
        assert_eq!(part_config_value(0x38, BootArea::Disabled, false), 0x00);
        assert_eq!(part_config_value(0x30, BootArea::Boot0, true), 0x48);
        assert_eq!(part_config_value(0x28, BootArea::Boot1, false), 0x10);
        assert_eq!(part_config_value(0x41, BootArea::UserArea, false), 0x39);
        assert!(BootArea::from_number(3).is_err());
    }

    #[test]
    fn test_enable_boot_partition_keeps_access_bits() {
        let mock = MockTransport::new();
        mock.set_ext_csd_byte(EXT_CSD_PART_CONFIG, 0x03);
        enable_boot_partition(&mock, BootArea::Boot1, true).unwrap();
        assert_eq!(mock.ext_csd_byte(EXT_CSD_PART_CONFIG), 0x53);
    }

    #[test]
    fn test_boot_bus_conditions() {
        let mock = MockTransport::new();
        let conditions = BootBusConditions {
            mode: "dual".parse().unwrap(),
            reset: "retain".parse().unwrap(),
            width: "x8".parse().unwrap(),
        };
        set_boot_bus_conditions(&mock, conditions).unwrap();
        assert_eq!(mock.ext_csd_byte(EXT_CSD_BOOT_BUS_CONDITIONS), 0x16);
        assert!("x16".parse::<BootBusWidth>().is_err());
    }

    #[test]
    fn test_go_idle_ignores_errors() {
        let mock = MockTransport::new();
        mock.fail_opcode(MMC_GO_IDLE_STATE);
        go_idle(&mock, IdleKind::PreIdle);
        let cmd = &mock.command_log()[0];
        assert_eq!(cmd.arg, 0xF0F0_F0F0);
        assert_eq!(cmd.flags, MMC_RSP_NONE | MMC_CMD_BC);
    }

    #[test]
    fn test_alternative_boot_read_caps_at_ioctl_limit() {
        let mock = MockTransport::new();
        let data = alternative_boot_read(&mock).unwrap();
        assert_eq!(data.len(), MMC_IOC_MAX_BYTES);
        assert_eq!(data[300], (300 % 251) as u8);

        let log = mock.command_log();
        assert_eq!(log[1].flags, MMC_RSP_NONE | MMC_CMD_AC);
        assert_eq!(log[2].flags, MMC_RSP_NONE | MMC_CMD_ADTC);
        assert_eq!(log[2].blocks, 1024);
        assert_eq!(log[2].data_timeout_ns, BOOT_DATA_TIMEOUT_NS);
    }

    #[test]
    fn test_alternative_boot_small_partition() {
        let mock = MockTransport::new();
        mock.set_ext_csd_byte(EXT_CSD_BOOT_MULT, 2);
        assert_eq!(alternative_boot_read(&mock).unwrap().len(), 256 * 1024);
    }

    #[test]
    fn test_alternative_boot_preconditions() {
        let mock = MockTransport::new();
        mock.set_ext_csd_byte(EXT_CSD_PART_CONFIG, EXT_CSD_PART_CONFIG_ACC_ACK);
        assert!(matches!(alternative_boot_read(&mock), Err(MmcError::Precondition(_))));

        mock.set_ext_csd_byte(EXT_CSD_BOOT_INFO, 0);
        assert!(matches!(
            alternative_boot_read(&mock),
            Err(MmcError::Unsupported { .. })
        ));
    }
}
