//! Partition provisioning: general purpose partitions, the enhanced user
//! area and write reliability, finished by the one-time
//! PARTITION_SETTING_COMPLETED write.
//!
//! Provisioning is a session: several calls may run in [`CommitMode::Chained`]
//! before exactly one call commits.

use std::fmt;

use tracing::{info, instrument, warn};

use super::{send_status, write_ext_csd};
use crate::error::{MmcError, Result};
use crate::protocol::DeviceStatus;
use crate::register::fields::*;
use crate::register::{ExtCsd, gp_size_mult_offset};
use crate::transport::MmcTransport;

/// What to do with PARTITION_SETTING_COMPLETED after a provisioning step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    /// Leave the flag alone; the settings are lost at the next power cycle.
    DryRun,
    /// Write the flag now.
    Commit,
    /// Leave the flag alone; more provisioning calls will follow.
    Chained,
}

impl CommitMode {
    /// `-y`, `-n` or `-c`.
    pub fn from_flag(flag: &str) -> Option<Self> {
        match flag {
            "-y" => Some(Self::Commit),
            "-n" => Some(Self::DryRun),
            "-c" => Some(Self::Chained),
            _ => None,
        }
    }
}

/// How a provisioning call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Dry run: registers written but not made permanent.
    NotCommitted,
    /// Chained: waiting for a later commit.
    Deferred,
    /// Flag written; a power cycle applies the layout.
    Committed,
}

/// Write PARTITION_SETTING_COMPLETED according to `mode`.
#[instrument(skip(transport), fields(device = transport.device_name()))]
pub fn complete_partitioning<T: MmcTransport + ?Sized>(transport: &T, mode: CommitMode) -> Result<CommitOutcome> {
    match mode {
        CommitMode::DryRun => {
            warn!("NOT setting PARTITION_SETTING_COMPLETED; changes take effect neither now nor after a power cycle");
            Ok(CommitOutcome::NotCommitted)
        }
        CommitMode::Chained => {
            info!("Expecting more partition settings before writing PARTITION_SETTING_COMPLETED");
            Ok(CommitOutcome::Deferred)
        }
        CommitMode::Commit => {
            warn!("Setting OTP PARTITION_SETTING_COMPLETED");
            write_ext_csd(transport, EXT_CSD_PARTITION_SETTING_COMPLETED, 0x01)?;
            let status = send_status(transport)?;
            if status.contains(DeviceStatus::SWITCH_ERROR) {
                return Err(MmcError::rejected(
                    "PARTITION_SETTING_COMPLETED",
                    format!("SWITCH_ERROR in status 0x{:08x}", status.bits()),
                ));
            }
            info!("PARTITION_SETTING_COMPLETED set; power cycle the device for the settings to take effect");
            Ok(CommitOutcome::Committed)
        }
    }
}

/// Sizes in KiB as summed by the consistency check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityCheck {
    pub gp_kib: [u64; 4],
    pub user_enhanced_kib: u64,
    pub enhanced_kib: u64,
    pub max_enhanced_kib: u64,
    pub requested_kib: u64,
    pub capacity_kib: u64,
}

impl CapacityCheck {
    /// Sum the programmed sizes from one EXT_CSD snapshot.
    pub fn from_ext_csd(csd: &ExtCsd) -> Self {
        let size_kib = |mult: u32| mult as u64 * csd.partition_align_kib();
        let attributes = csd.partitions_attribute();

        let mut gp_kib = [0u64; 4];
        let mut enhanced_kib = 0;
        for (i, size) in gp_kib.iter_mut().enumerate() {
            let index = i as u8 + 1;
            *size = size_kib(csd.gp_size_mult(index));
            if attributes & (1 << index) != 0 {
                enhanced_kib += *size;
            }
        }
        let user_enhanced_kib = size_kib(csd.enh_size_mult());
        if attributes & EXT_CSD_ENH_USR != 0 {
            enhanced_kib += user_enhanced_kib;
        }

        Self {
            gp_kib,
            user_enhanced_kib,
            enhanced_kib,
            max_enhanced_kib: size_kib(csd.max_enh_size_mult()),
            requested_kib: gp_kib.iter().sum::<u64>() + user_enhanced_kib,
            capacity_kib: csd.sector_count() as u64 / 2,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.enhanced_kib > self.max_enhanced_kib {
            return Err(MmcError::precondition(format!(
                "Programmed total enhanced size {} KiB cannot exceed max enhanced area {} KiB",
                self.enhanced_kib, self.max_enhanced_kib
            )));
        }
        if self.requested_kib > self.capacity_kib {
            return Err(MmcError::precondition(format!(
                "Requested total partition size {} KiB cannot exceed card capacity {} KiB",
                self.requested_kib, self.capacity_kib
            )));
        }
        Ok(())
    }
}

impl fmt::Display for CapacityCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, size) in self.gp_kib.iter().enumerate() {
            writeln!(f, "GP{} Partition Size: {} KiB", i + 1, size)?;
        }
        writeln!(f, "Enhanced User Data Area Size: {} KiB", self.user_enhanced_kib)?;
        writeln!(f, "Total enhanced: {} KiB of {} KiB", self.enhanced_kib, self.max_enhanced_kib)?;
        write!(f, "Total requested: {} KiB of {} KiB", self.requested_kib, self.capacity_kib)
    }
}

/// Re-read EXT_CSD and check the programmed layout fits the device.
pub fn check_capacity<T: MmcTransport + ?Sized>(transport: &T) -> Result<CapacityCheck> {
    let check = CapacityCheck::from_ext_csd(&ExtCsd::read(transport)?);
    check.validate()?;
    Ok(check)
}

fn ensure_unpartitioned(csd: &ExtCsd) -> Result<()> {
    if csd.partition_setting_completed() {
        return Err(MmcError::precondition("Device is already partitioned"));
    }
    Ok(())
}

fn alignment_kib(csd: &ExtCsd) -> Result<u64> {
    match csd.partition_align_kib() {
        0 => Err(MmcError::unsupported(
            "Partitioning",
            "HC_ERASE_GRP_SIZE or HC_WP_GRP_SIZE is zero",
        )),
        align => Ok(align),
    }
}

/// Largest value the 3-byte size multiplier fields hold.
pub const MAX_SIZE_MULT: u32 = 0xFF_FFFF;

/// Size multiplier for `length_kib`, rounded to the nearest alignment unit.
pub fn size_mult(length_kib: u64, align_kib: u64) -> Result<u32> {
    let too_large = || {
        MmcError::precondition(format!(
            "{} KiB exceeds the largest partition size ({} units of {} KiB)",
            length_kib, MAX_SIZE_MULT, align_kib
        ))
    };
    let rounded = length_kib.checked_add(align_kib / 2).ok_or_else(too_large)?;
    u32::try_from(rounded / align_kib)
        .ok()
        .filter(|&mult| mult <= MAX_SIZE_MULT)
        .ok_or_else(too_large)
}

/// One general purpose partition to define.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpPartition {
    /// 1..=4
    pub index: u8,
    pub length_kib: u64,
    pub enhanced: bool,
    /// Extended attribute nibble, 0 for none.
    pub ext_attribute: u8,
}

impl GpPartition {
    fn validate(&self) -> Result<()> {
        if !(1..=4).contains(&self.index) {
            return Err(MmcError::precondition(
                "Invalid gp partition number; valid range [1-4]",
            ));
        }
        if self.enhanced && self.ext_attribute != 0 {
            return Err(MmcError::precondition(
                "Not allowed to set both enhanced attribute and extended attribute",
            ));
        }
        if self.ext_attribute > 0x0F {
            return Err(MmcError::precondition(format!(
                "Extended attribute {} does not fit in 4 bits",
                self.ext_attribute
            )));
        }
        Ok(())
    }
}

/// Define one general purpose partition.
#[instrument(skip(transport), fields(device = transport.device_name()))]
pub fn create_gp_partition<T: MmcTransport + ?Sized>(
    transport: &T,
    partition: &GpPartition,
    mode: CommitMode,
) -> Result<CommitOutcome> {
    partition.validate()?;

    let csd = ExtCsd::read(transport)?;
    ensure_unpartitioned(&csd)?;
    let mult = size_mult(partition.length_kib, alignment_kib(&csd)?)?;

    write_ext_csd(transport, EXT_CSD_ERASE_GROUP_DEF, 0x01)?;

    let base = gp_size_mult_offset(partition.index);
    write_ext_csd(transport, base + 2, (mult >> 16) as u8)?;
    write_ext_csd(transport, base + 1, (mult >> 8) as u8)?;
    write_ext_csd(transport, base, mult as u8)?;

    let enh_bit = 1u8 << partition.index;
    let attributes = if partition.enhanced {
        csd.partitions_attribute() | enh_bit
    } else {
        csd.partitions_attribute() & !enh_bit
    };
    write_ext_csd(transport, EXT_CSD_PARTITIONS_ATTRIBUTE, attributes)?;

    let slot = (partition.index as usize - 1) / 2;
    let shift = 4 * ((partition.index - 1) % 2);
    let ext = (csd.ext_partitions_attribute(slot) & !(0x0F << shift)) | (partition.ext_attribute << shift);
    write_ext_csd(transport, EXT_CSD_EXT_PARTITIONS_ATTRIBUTE_0 + slot, ext)?;

    let check = check_capacity(transport)?;
    info!(
        index = partition.index,
        mult,
        requested_kib = check.requested_kib,
        "General purpose partition defined"
    );
    complete_partitioning(transport, mode)
}

/// Start address as written to ENH_START_ADDR: bytes on byte-addressed
/// parts, sectors otherwise, rounded down to the alignment unit.
pub fn enhanced_start_address(start_kib: u32, block_addressed: bool, align_kib: u64) -> Result<u32> {
    let unit = if block_addressed { 1024 / 512 } else { 1024 };
    let address = start_kib as u64 * unit;
    u32::try_from((address / align_kib) * align_kib).map_err(|_| {
        MmcError::precondition(format!(
            "Enhanced area start {} KiB does not fit ENH_START_ADDR",
            start_kib
        ))
    })
}

/// Define the enhanced region of the user area.
#[instrument(skip(transport), fields(device = transport.device_name()))]
pub fn set_enhanced_area<T: MmcTransport + ?Sized>(
    transport: &T,
    start_kib: u32,
    length_kib: u64,
    mode: CommitMode,
) -> Result<CommitOutcome> {
    let csd = ExtCsd::read(transport)?;
    if csd.partitioning_support() & EXT_CSD_ENH_ATTRIBUTE_EN == 0 {
        return Err(MmcError::unsupported(
            "Enhanced user area",
            "device cannot have enhanced tech",
        ));
    }
    ensure_unpartitioned(&csd)?;

    let align = alignment_kib(&csd)?;
    let mult = size_mult(length_kib, align)?;
    let start = enhanced_start_address(start_kib, csd.is_block_addressed(), align)?;

    write_ext_csd(transport, EXT_CSD_ERASE_GROUP_DEF, 0x01)?;
    for byte in (0..4).rev() {
        write_ext_csd(transport, EXT_CSD_ENH_START_ADDR_0 + byte, (start >> (8 * byte)) as u8)?;
    }
    for byte in (0..3).rev() {
        write_ext_csd(transport, EXT_CSD_ENH_SIZE_MULT_0 + byte, (mult >> (8 * byte)) as u8)?;
    }
    write_ext_csd(
        transport,
        EXT_CSD_PARTITIONS_ATTRIBUTE,
        csd.partitions_attribute() | EXT_CSD_ENH_USR,
    )?;

    check_capacity(transport)?;
    info!(start, mult, "Done setting ENH_USR area");
    complete_partitioning(transport, mode)
}

/// Enable reliable writes for `partition` (0 = user area, 1..=4 = GP).
#[instrument(skip(transport), fields(device = transport.device_name()))]
pub fn set_write_reliability<T: MmcTransport + ?Sized>(
    transport: &T,
    partition: u8,
    mode: CommitMode,
) -> Result<CommitOutcome> {
    if partition > 4 {
        return Err(MmcError::precondition(format!(
            "Invalid partition {} for write reliability; valid range [0-4]",
            partition
        )));
    }

    let csd = ExtCsd::read(transport)?;
    ensure_unpartitioned(&csd)?;
    if csd.wr_rel_param() & HS_CTRL_REL == 0 {
        return Err(MmcError::unsupported(
            "Write reliability",
            "WR_REL_SET is read-only",
        ));
    }

    let value = csd.wr_rel_set() | (1 << partition);
    write_ext_csd(transport, EXT_CSD_WR_REL_SET, value)?;
    info!(value = %format!("0x{:02x}", value), "Done setting EXT_CSD_WR_REL_SET");
    complete_partitioning(transport, mode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::*;
    use crate::transport::MockTransport;

    fn gp(index: u8, length_kib: u64) -> GpPartition {
        GpPartition {
            index,
            length_kib,
            enhanced: false,
            ext_attribute: 0,
        }
    }

    #[test]
    fn test_size_mult_rounds_half_up() {
        assert_eq!(size_mult(255, 512).unwrap(), 0);
        assert_eq!(size_mult(256, 512).unwrap(), 1);
        assert_eq!(size_mult(767, 512).unwrap(), 1);
        assert_eq!(size_mult(768, 512).unwrap(), 2);
    }

    #[test]
    fn test_size_mult_rejects_values_past_24_bits() {
        assert_eq!(size_mult(MAX_SIZE_MULT as u64 * 512, 512).unwrap(), MAX_SIZE_MULT);
        for length_kib in [(MAX_SIZE_MULT as u64 + 1) * 512, 1 << 45, u64::MAX] {
            assert!(matches!(size_mult(length_kib, 512), Err(MmcError::Precondition(_))));
        }
    }

    #[test]
    fn test_oversized_gp_partition_writes_nothing() {
        let mock = MockTransport::new();
        let err = create_gp_partition(&mock, &gp(1, 1 << 45), CommitMode::Chained).unwrap_err();
        assert!(matches!(err, MmcError::Precondition(_)));
        assert!(mock.mutating_commands().is_empty());
    }

    #[test]
    fn test_create_gp_writes_size_big_byte_first() {
        let mock = MockTransport::new();
        for offset in EXT_CSD_SEC_COUNT_0..EXT_CSD_SEC_COUNT_0 + 4 {
            mock.set_ext_csd_byte(offset, 0xFF);
        }
        let outcome = create_gp_partition(&mock, &gp(2, 0x012345 * 512), CommitMode::Chained).unwrap();
        assert_eq!(outcome, CommitOutcome::Deferred);

        let writes = mock.switch_writes();
        assert_eq!(writes[0], (EXT_CSD_ERASE_GROUP_DEF as u8, 1));
        assert_eq!(&writes[1..4], &[(148, 0x01), (147, 0x23), (146, 0x45)]);
        assert_eq!(mock.ext_csd().gp_size_mult(2), 0x012345);
        assert_eq!(mock.ext_csd_byte(EXT_CSD_PARTITION_SETTING_COMPLETED), 0);
    }

    #[test]
    fn test_create_gp_sets_attributes() {
        let mock = MockTransport::new();
        mock.set_ext_csd_byte(EXT_CSD_EXT_PARTITIONS_ATTRIBUTE_0 + 1, 0xA5);

        let request = GpPartition {
            enhanced: true,
            ..gp(3, 1024)
        };
        create_gp_partition(&mock, &request, CommitMode::Chained).unwrap();
        assert_eq!(mock.ext_csd_byte(EXT_CSD_PARTITIONS_ATTRIBUTE) & (1 << 3), 1 << 3);
        // Partition 3 owns the low nibble of byte 53.
        assert_eq!(mock.ext_csd_byte(EXT_CSD_EXT_PARTITIONS_ATTRIBUTE_0 + 1), 0xA0);

        let request = GpPartition {
            ext_attribute: 0x3,
            ..gp(4, 1024)
        };
        create_gp_partition(&mock, &request, CommitMode::Chained).unwrap();
        assert_eq!(mock.ext_csd_byte(EXT_CSD_EXT_PARTITIONS_ATTRIBUTE_0 + 1), 0x30);
    }

    #[test]
    fn test_invalid_requests_touch_nothing() {
        let mock = MockTransport::new();
        assert!(create_gp_partition(&mock, &gp(5, 1024), CommitMode::Commit).is_err());
        let both = GpPartition {
            enhanced: true,
            ext_attribute: 1,
            ..gp(1, 1024)
        };
        assert!(create_gp_partition(&mock, &both, CommitMode::Commit).is_err());
        assert!(mock.command_log().is_empty());
    }

    #[test]
    fn test_already_partitioned_is_refused() {
        let mock = MockTransport::new();
        mock.set_ext_csd_byte(EXT_CSD_PARTITION_SETTING_COMPLETED, 1);
        let err = set_enhanced_area(&mock, 0, 1024, CommitMode::Commit).unwrap_err();
        assert!(err.to_string().contains("already partitioned"));
        assert!(mock.mutating_commands().is_empty());
    }

    #[test]
    fn test_enhanced_area_over_max_never_commits() {
        let mock = MockTransport::new();
        // Max is 256 * 512 KiB.
        let err = set_enhanced_area(&mock, 0, 200_000, CommitMode::Commit).unwrap_err();
        assert!(matches!(err, MmcError::Precondition(_)));
        assert!(
            !mock
                .switch_writes()
                .iter()
                .any(|&(index, _)| index as usize == EXT_CSD_PARTITION_SETTING_COMPLETED)
        );
    }

    #[test]
    fn test_enhanced_area_commit() {
        let mock = MockTransport::new();
        let outcome = set_enhanced_area(&mock, 2048, 4096, CommitMode::Commit).unwrap();
        assert_eq!(outcome, CommitOutcome::Committed);

        let csd = mock.ext_csd();
        assert_eq!(csd.enh_size_mult(), 8);
        // 2048 KiB on a sector-addressed part is sector 4096.
        assert_eq!(csd.enh_start_addr(), 4096);
        assert_ne!(csd.partitions_attribute() & EXT_CSD_ENH_USR, 0);
        assert!(csd.partition_setting_completed());
        assert_eq!(mock.command_log().last().unwrap().opcode, MMC_SEND_STATUS);
    }

    #[test]
    fn test_commit_reports_switch_error() {
        let mock = MockTransport::new();
        mock.set_response(MMC_SEND_STATUS, DeviceStatus::SWITCH_ERROR.bits());
        let err = complete_partitioning(&mock, CommitMode::Commit).unwrap_err();
        assert!(matches!(err, MmcError::DeviceRejected { .. }));
    }

    #[test]
    fn test_dry_run_writes_nothing() {
        let mock = MockTransport::new();
        assert_eq!(complete_partitioning(&mock, CommitMode::DryRun).unwrap(), CommitOutcome::NotCommitted);
        assert!(mock.command_log().is_empty());
    }

    #[test]
    fn test_capacity_overflow() {
        let mock = MockTransport::new();
        // 4 GiB part; ask for 5 GiB.
        let err = create_gp_partition(&mock, &gp(1, 5 * 1024 * 1024), CommitMode::Commit).unwrap_err();
        assert!(err.to_string().contains("cannot exceed card capacity"));
    }

    #[test]
    fn test_write_reliability() {
        let mock = MockTransport::new();
        set_write_reliability(&mock, 2, CommitMode::Chained).unwrap();
        assert_eq!(mock.ext_csd_byte(EXT_CSD_WR_REL_SET), 1 << 2);

        mock.set_ext_csd_byte(EXT_CSD_WR_REL_PARAM, 0);
        assert!(matches!(
            set_write_reliability(&mock, 1, CommitMode::Chained),
            Err(MmcError::Unsupported { .. })
        ));
    }

    #[test]
    fn test_enhanced_start_address_rounding() {
        assert_eq!(enhanced_start_address(3, true, 4).unwrap(), 4);
        assert_eq!(enhanced_start_address(3, false, 512).unwrap(), 3072);
    }

    #[test]
    fn test_enhanced_start_past_u32_is_rejected() {
        assert_eq!(enhanced_start_address(0x7FFF_FFFF, true, 1).unwrap(), 0xFFFF_FFFE);
        assert!(matches!(
            enhanced_start_address(4 * 1024 * 1024, false, 512),
            Err(MmcError::Precondition(_))
        ));
    }
}
