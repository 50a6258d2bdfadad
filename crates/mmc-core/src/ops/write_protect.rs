//! Write protection of user-area groups and boot partitions.

use std::fmt;

use tracing::{debug, info, instrument, warn};

use super::write_ext_csd;
use crate::error::{MmcError, Result};
use crate::protocol::CommandDescriptor;
use crate::protocol::constants::WP_GROUPS_PER_QUERY;
use crate::register::fields::*;
use crate::register::{ExtCsd, Revision};
use crate::transport::MmcTransport;

/// Protection state of one write protect group, as encoded by CMD31.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtectionType {
    None = 0,
    Temporary = 1,
    PowerOn = 2,
    Permanent = 3,
}

impl ProtectionType {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x3 {
            0 => Self::None,
            1 => Self::Temporary,
            2 => Self::PowerOn,
            _ => Self::Permanent,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::None => "No",
            Self::Temporary => "Temporary",
            Self::PowerOn => "Power-on",
            Self::Permanent => "Permanent",
        }
    }
}

/// Run of adjacent groups sharing one protection type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectedRange {
    pub first_group: u64,
    pub last_group: u64,
    pub kind: ProtectionType,
    group_size: u64,
}

impl ProtectedRange {
    pub fn first_block(&self) -> u64 {
        self.first_group * self.group_size
    }

    pub fn last_block(&self) -> u64 {
        (self.last_group + 1) * self.group_size - 1
    }
}

impl fmt::Display for ProtectedRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Write Protect Groups {}-{} (Blocks {}-{}), {} Write Protection",
            self.first_group,
            self.last_group,
            self.first_block(),
            self.last_block(),
            self.kind.description()
        )
    }
}

/// Merge per-group protection types into ranges. The last run is always
/// emitted.
pub fn coalesce<I>(types: I, group_size: u64) -> Vec<ProtectedRange>
where
    I: IntoIterator<Item = ProtectionType>,
{
    let mut ranges: Vec<ProtectedRange> = Vec::new();
    for (group, kind) in types.into_iter().enumerate() {
        let group = group as u64;
        match ranges.last_mut() {
            Some(open) if open.kind == kind => open.last_group = group,
            _ => ranges.push(ProtectedRange {
                first_group: group,
                last_group: group,
                kind,
                group_size,
            }),
        }
    }
    ranges
}

/// Result of a user-area protection scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserWpReport {
    pub group_size: u32,
    pub group_count: u64,
    pub ranges: Vec<ProtectedRange>,
}

impl fmt::Display for UserWpReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Write Protect Group size in blocks/bytes: {}/{}",
            self.group_size,
            self.group_size as u64 * 512
        )?;
        for range in &self.ranges {
            writeln!(f, "{}", range)?;
        }
        Ok(())
    }
}

fn wp_group_size(csd: &ExtCsd) -> Result<u32> {
    match csd.wp_group_size_blocks() {
        0 => Err(MmcError::unsupported(
            "User write protection",
            "HC_ERASE_GRP_SIZE or HC_WP_GRP_SIZE is zero",
        )),
        size => Ok(size),
    }
}

/// Query every group of the user area, 32 groups per CMD31.
#[instrument(skip_all, fields(device = transport.device_name()))]
pub fn user_status<T: MmcTransport + ?Sized>(transport: &T) -> Result<UserWpReport> {
    let csd = ExtCsd::read(transport)?;
    let group_size = wp_group_size(&csd)?;
    let group_count = transport.capacity_blocks()? / group_size as u64;
    debug!(group_size, group_count, "Scanning write protection");

    let mut types = Vec::with_capacity(group_count as usize);
    let mut group = 0u64;
    while group < group_count {
        let mut cmd = CommandDescriptor::send_write_prot_type((group * group_size as u64) as u32);
        transport.issue(&mut cmd)?;
        let bits = cmd
            .data
            .iter()
            .take(8)
            .fold(0u64, |acc, &byte| (acc << 8) | byte as u64);

        let in_query = (group_count - group).min(WP_GROUPS_PER_QUERY as u64);
        for i in 0..in_query {
            types.push(ProtectionType::from_bits(((bits >> (2 * i)) & 0x3) as u8));
        }
        group += WP_GROUPS_PER_QUERY as u64;
    }

    Ok(UserWpReport {
        group_size,
        group_count,
        ranges: coalesce(types, group_size as u64),
    })
}

/// Protection requested by `user_set`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserWpType {
    /// Clear protection.
    None,
    Temporary,
    PowerOn,
    Permanent,
}

impl UserWpType {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "none" => Some(Self::None),
            "temp" => Some(Self::Temporary),
            "pwron" => Some(Self::PowerOn),
            "perm" => Some(Self::Permanent),
            _ => None,
        }
    }
}

/// Protect or unprotect `count` blocks starting at `start`.
///
/// Both must be multiples of the group size and the range must lie within
/// the device; nothing is written otherwise.
/// USER_WP is switched to the requested mode for the duration of the
/// per-group commands and restored afterwards. A failing group command
/// leaves earlier groups modified.
#[instrument(skip(transport), fields(device = transport.device_name()))]
pub fn user_set<T: MmcTransport + ?Sized>(
    transport: &T,
    kind: UserWpType,
    start: u32,
    count: u32,
    allow_dangerous: bool,
) -> Result<()> {
    if kind == UserWpType::Permanent && !allow_dangerous {
        return Err(MmcError::precondition(
            "Permanent write protection is irreversible; enable allow_dangerous to use it",
        ));
    }

    let csd = ExtCsd::read(transport)?;
    let group_size = wp_group_size(&csd)?;
    if start % group_size != 0 || count % group_size != 0 {
        return Err(MmcError::precondition(format!(
            "<start block> and <blocks> must be a multiple of the Write Protect Group ({})",
            group_size
        )));
    }
    let capacity = transport.capacity_blocks()?;
    let end = start
        .checked_add(count)
        .filter(|&end| u64::from(end) <= capacity)
        .ok_or_else(|| {
            MmcError::precondition(format!(
                "blocks {}+{} lie beyond the end of the device ({} blocks)",
                start, count, capacity
            ))
        })?;

    let original = csd.user_wp();
    if kind != UserWpType::None {
        let mut user_wp = original & !USER_WP_CLEAR;
        match kind {
            UserWpType::PowerOn => user_wp |= USER_WP_US_PWR_WP_EN,
            UserWpType::Permanent => user_wp |= USER_WP_US_PERM_WP_EN,
            _ => {}
        }
        if user_wp != original {
            write_ext_csd(transport, EXT_CSD_USER_WP, user_wp)?;
        }
    }

    let on = kind != UserWpType::None;
    for block in (start..end).step_by(group_size as usize) {
        let mut cmd = CommandDescriptor::write_protect(block, on);
        transport.issue(&mut cmd)?;
    }
    info!(start, count, groups = count / group_size, ?kind, "Write protection applied");

    if kind != UserWpType::None {
        write_ext_csd(transport, EXT_CSD_USER_WP, original)?;
    }
    Ok(())
}

/// Lock state of one boot partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootLock {
    Unlocked,
    PowerOn,
    Permanent,
}

impl fmt::Display for BootLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unlocked => "not locked",
            Self::PowerOn => "locked until next power on",
            Self::Permanent => "locked permanently",
        })
    }
}

/// Decoded BOOT_WP / BOOT_WP_STATUS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootWpStatus {
    pub boot_wp: u8,
    pub boot_wp_status: u8,
    pub power_lock_possible: bool,
    pub permanent_lock_possible: bool,
    pub partitions: [BootLock; 2],
}

impl BootWpStatus {
    pub fn decode(boot_wp: u8, boot_wp_status: u8) -> Self {
        let lock = |perm: u8, pwr: u8| {
            if boot_wp_status & perm != 0 {
                BootLock::Permanent
            } else if boot_wp_status & pwr != 0 {
                BootLock::PowerOn
            } else {
                BootLock::Unlocked
            }
        };
        Self {
            boot_wp,
            boot_wp_status,
            power_lock_possible: boot_wp & EXT_CSD_BOOT_WP_B_PWR_WP_DIS == 0,
            permanent_lock_possible: boot_wp & EXT_CSD_BOOT_WP_B_PERM_WP_DIS == 0,
            partitions: [
                lock(EXT_CSD_BOOT_WP_S_AREA_0_PERM, EXT_CSD_BOOT_WP_S_AREA_0_PWR),
                lock(EXT_CSD_BOOT_WP_S_AREA_1_PERM, EXT_CSD_BOOT_WP_S_AREA_1_PWR),
            ],
        }
    }
}

impl fmt::Display for BootWpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let possible = |yes: bool| if yes { "possible" } else { "not possible" };
        writeln!(f, "Boot write protection status registers [BOOT_WP_STATUS]: 0x{:02x}", self.boot_wp_status)?;
        writeln!(f, "Boot Area Write protection [BOOT_WP]: 0x{:02x}", self.boot_wp)?;
        writeln!(f, " Power ro locking: {}", possible(self.power_lock_possible))?;
        writeln!(f, " Permanent ro locking: {}", possible(self.permanent_lock_possible))?;
        for (i, lock) in self.partitions.iter().enumerate() {
            writeln!(f, " partition {} ro lock status: {}", i, lock)?;
        }
        Ok(())
    }
}

/// Boot partition protection state. Reserved before revision 4.41.
#[instrument(skip_all, fields(device = transport.device_name()))]
pub fn boot_status<T: MmcTransport + ?Sized>(transport: &T) -> Result<BootWpStatus> {
    let csd = ExtCsd::read(transport)?;
    csd.require_revision(Revision::V4_41, "Boot write protection")?;
    Ok(BootWpStatus::decode(csd.boot_wp(), csd.boot_wp_status()))
}

/// BOOT_WP value that protects `partition` (`None` for both).
///
/// When one partition is already permanently protected and a power-on lock
/// is requested, the permanent selector keeps pointing at the partition
/// that already carries it and the power-on lock goes to the other one.
pub fn boot_wp_value(boot_wp: u8, boot_wp_status: u8, partition: Option<u8>, permanent: bool) -> u8 {
    let mut value = boot_wp;
    let mut partition = partition;

    if value & EXT_CSD_BOOT_WP_B_PERM_WP_EN != 0 && !permanent {
        if boot_wp_status & EXT_CSD_BOOT_WP_S_AREA_1_PERM != 0 {
            value |= EXT_CSD_BOOT_WP_B_PERM_WP_SEC_SEL;
            if partition != Some(1) {
                partition = Some(0);
            }
        } else if partition != Some(0) {
            partition = Some(1);
        }
    }

    if let Some(partition) = partition {
        value |= EXT_CSD_BOOT_WP_B_SEC_WP_SEL;
        if partition == 1 {
            value |= if permanent {
                EXT_CSD_BOOT_WP_B_PERM_WP_SEC_SEL
            } else {
                EXT_CSD_BOOT_WP_B_PWR_WP_SEC_SEL
            };
        }
    }

    value | if permanent {
        EXT_CSD_BOOT_WP_B_PERM_WP_EN
    } else {
        EXT_CSD_BOOT_WP_B_PWR_WP_EN
    }
}

/// Lock one or both boot partitions read-only.
#[instrument(skip(transport), fields(device = transport.device_name()))]
pub fn boot_set<T: MmcTransport + ?Sized>(
    transport: &T,
    partition: Option<u8>,
    permanent: bool,
    allow_dangerous: bool,
) -> Result<()> {
    if let Some(p) = partition.filter(|&p| p > 1) {
        return Err(MmcError::precondition(format!(
            "Invalid partition number (must be 0 or 1): {}",
            p
        )));
    }
    if permanent && !allow_dangerous {
        return Err(MmcError::precondition(
            "Permanent boot write protection is irreversible; enable allow_dangerous to use it",
        ));
    }

    let csd = ExtCsd::read(transport)?;
    let value = boot_wp_value(csd.boot_wp(), csd.boot_wp_status(), partition, permanent);
    if permanent {
        warn!(?partition, "Setting permanent boot write protection");
    }
    write_ext_csd(transport, EXT_CSD_BOOT_WP, value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::*;
    use crate::transport::MockTransport;
    use proptest::prelude::*;

    const GROUP: u32 = 1024;

    fn mock_with_groups(groups: u64) -> MockTransport {
        let mock = MockTransport::new();
        mock.set_capacity_blocks(groups * GROUP as u64);
        mock
    }

    #[test]
    fn test_coalesce_flushes_last_range() {
        use ProtectionType::*;
        let ranges = coalesce([None, None, Temporary, Temporary, Temporary, PowerOn], 1);
        assert_eq!(ranges.len(), 3);
        assert_eq!((ranges[0].first_group, ranges[0].last_group, ranges[0].kind), (0, 1, None));
        assert_eq!((ranges[1].first_group, ranges[1].last_group, ranges[1].kind), (2, 4, Temporary));
        assert_eq!((ranges[2].first_group, ranges[2].last_group, ranges[2].kind), (5, 5, PowerOn));
    }

    #[test]
    fn test_range_display() {
        let ranges = coalesce([ProtectionType::PowerOn; 2], 1024);
        assert_eq!(
            ranges[0].to_string(),
            "Write Protect Groups 0-1 (Blocks 0-2047), Power-on Write Protection"
        );
    }

    #[test]
    fn test_user_status_spans_query_windows() {
        let mock = mock_with_groups(40);
        mock.set_protection(31, 1);
        mock.set_protection(32, 1);
        mock.set_protection(39, 3);

        let report = user_status(&mock).unwrap();
        assert_eq!(report.group_count, 40);
        let summary: Vec<_> = report
            .ranges
            .iter()
            .map(|r| (r.first_group, r.last_group, r.kind))
            .collect();
        assert_eq!(
            summary,
            vec![
                (0, 30, ProtectionType::None),
                (31, 32, ProtectionType::Temporary),
                (33, 38, ProtectionType::None),
                (39, 39, ProtectionType::Permanent),
            ]
        );

        let queries: Vec<_> = mock
            .command_log()
            .into_iter()
            .filter(|c| c.opcode == MMC_SEND_WRITE_PROT_TYPE)
            .map(|c| c.arg)
            .collect();
        assert_eq!(queries, vec![0, 32 * GROUP]);
    }

    #[test]
    fn test_user_set_power_on_restores_user_wp() {
        let mock = mock_with_groups(16);
        mock.set_ext_csd_byte(EXT_CSD_USER_WP, USER_WP_US_PWR_WP_DIS);

        user_set(&mock, UserWpType::PowerOn, 2 * GROUP, 3 * GROUP, false).unwrap();

        assert_eq!(
            mock.switch_writes(),
            vec![
                (EXT_CSD_USER_WP as u8, USER_WP_US_PWR_WP_EN),
                (EXT_CSD_USER_WP as u8, USER_WP_US_PWR_WP_DIS),
            ]
        );
        assert_eq!((2..5).map(|g| mock.protection(g)).collect::<Vec<_>>(), vec![2, 2, 2]);
        assert_eq!(mock.protection(5), 0);
    }

    #[test]
    fn test_user_set_none_skips_register() {
        let mock = mock_with_groups(4);
        mock.set_protection(1, 1);
        user_set(&mock, UserWpType::None, GROUP, GROUP, false).unwrap();
        assert!(mock.switch_writes().is_empty());
        assert_eq!(mock.protection(1), 0);
    }

    #[test]
    fn test_permanent_requires_opt_in() {
        let mock = mock_with_groups(4);
        let err = user_set(&mock, UserWpType::Permanent, 0, GROUP, false).unwrap_err();
        assert!(matches!(err, MmcError::Precondition(_)));
        assert!(mock.command_log().is_empty());
    }

    #[test]
    fn test_set_twice_is_idempotent() {
        let mock = mock_with_groups(8);
        user_set(&mock, UserWpType::Temporary, 0, 4 * GROUP, false).unwrap();
        let once: Vec<_> = (0..8).map(|g| mock.protection(g)).collect();
        user_set(&mock, UserWpType::Temporary, 0, 4 * GROUP, false).unwrap();
        let twice: Vec<_> = (0..8).map(|g| mock.protection(g)).collect();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_single_block_groups_below_4_41() {
        let mock = mock_with_groups(1);
        mock.set_ext_csd_byte(EXT_CSD_REV, 3);
        user_set(&mock, UserWpType::Temporary, 7, 3, false).unwrap();
        let args: Vec<_> = mock
            .command_log()
            .into_iter()
            .filter(|c| c.opcode == MMC_SET_WRITE_PROT)
            .map(|c| c.arg)
            .collect();
        assert_eq!(args, vec![7, 8, 9]);
    }

    #[test]
    fn test_user_set_rejects_range_wrapping_u32() {
        let mock = MockTransport::new();
        mock.set_capacity_blocks(u64::from(u32::MAX) + 1);
        let err = user_set(&mock, UserWpType::PowerOn, 0xFFFF_FC00, 2 * GROUP, false).unwrap_err();
        assert!(matches!(err, MmcError::Precondition(_)));
        assert!(mock.mutating_commands().is_empty());
    }

    #[test]
    fn test_user_set_rejects_range_past_capacity() {
        let mock = mock_with_groups(8);
        let err = user_set(&mock, UserWpType::Temporary, 6 * GROUP, 3 * GROUP, false).unwrap_err();
        assert!(matches!(err, MmcError::Precondition(_)));
        assert!(mock.mutating_commands().is_empty());

        user_set(&mock, UserWpType::Temporary, 6 * GROUP, 2 * GROUP, false).unwrap();
        assert_eq!(mock.protection(7), 1);
    }

    #[test]
    fn test_boot_tie_break_keeps_permanent_selector() {
        // Partition 1 is permanently locked; a power-on lock must go to 0.
        let value = boot_wp_value(
            EXT_CSD_BOOT_WP_B_PERM_WP_EN,
            EXT_CSD_BOOT_WP_S_AREA_1_PERM,
            None,
            false,
        );
        assert_eq!(
            value,
            EXT_CSD_BOOT_WP_B_PERM_WP_EN
                | EXT_CSD_BOOT_WP_B_PERM_WP_SEC_SEL
                | EXT_CSD_BOOT_WP_B_SEC_WP_SEL
                | EXT_CSD_BOOT_WP_B_PWR_WP_EN
        );

        // Partition 0 is permanently locked; the power-on lock goes to 1.
        let value = boot_wp_value(EXT_CSD_BOOT_WP_B_PERM_WP_EN, EXT_CSD_BOOT_WP_S_AREA_0_PERM, None, false);
        assert_eq!(
            value,
            EXT_CSD_BOOT_WP_B_PERM_WP_EN
                | EXT_CSD_BOOT_WP_B_SEC_WP_SEL
                | EXT_CSD_BOOT_WP_B_PWR_WP_SEC_SEL
                | EXT_CSD_BOOT_WP_B_PWR_WP_EN
        );
    }

    #[test]
    fn test_boot_wp_plain_cases() {
        assert_eq!(boot_wp_value(0, 0, None, false), EXT_CSD_BOOT_WP_B_PWR_WP_EN);
        assert_eq!(
            boot_wp_value(0, 0, Some(1), true),
            EXT_CSD_BOOT_WP_B_SEC_WP_SEL | EXT_CSD_BOOT_WP_B_PERM_WP_SEC_SEL | EXT_CSD_BOOT_WP_B_PERM_WP_EN
        );
        assert_eq!(
            boot_wp_value(0, 0, Some(0), false),
            EXT_CSD_BOOT_WP_B_SEC_WP_SEL | EXT_CSD_BOOT_WP_B_PWR_WP_EN
        );
    }

    #[test]
    fn test_boot_status_decoding() {
        let mock = MockTransport::new();
        mock.set_ext_csd_byte(EXT_CSD_BOOT_WP, EXT_CSD_BOOT_WP_B_PERM_WP_DIS);
        mock.set_ext_csd_byte(EXT_CSD_BOOT_WP_STATUS, EXT_CSD_BOOT_WP_S_AREA_1_PWR);
        let status = boot_status(&mock).unwrap();
        assert!(status.power_lock_possible);
        assert!(!status.permanent_lock_possible);
        assert_eq!(status.partitions, [BootLock::Unlocked, BootLock::PowerOn]);
        assert!(status.to_string().contains("partition 1 ro lock status: locked until next power on"));
    }

    #[test]
    fn test_boot_set_writes_boot_wp() {
        let mock = MockTransport::new();
        boot_set(&mock, Some(0), false, false).unwrap();
        assert_eq!(
            mock.ext_csd_byte(EXT_CSD_BOOT_WP),
            EXT_CSD_BOOT_WP_B_SEC_WP_SEL | EXT_CSD_BOOT_WP_B_PWR_WP_EN
        );
        assert!(boot_set(&mock, Some(2), false, false).is_err());
    }

    proptest! {
        #[test]
        fn prop_aligned_ranges_issue_one_command_per_group(
            start_group in 0u32..64,
            groups in 0u32..64,
        ) {
            let mock = mock_with_groups(128);
            user_set(&mock, UserWpType::Temporary, start_group * GROUP, groups * GROUP, false).unwrap();
            let per_group = mock
                .command_log()
                .iter()
                .filter(|c| c.opcode == MMC_SET_WRITE_PROT)
                .count();
            prop_assert_eq!(per_group as u32, groups);
        }

        #[test]
        fn prop_misaligned_ranges_mutate_nothing(
            start in 0u32..(8 * GROUP),
            count in 0u32..(8 * GROUP),
        ) {
            prop_assume!(start % GROUP != 0 || count % GROUP != 0);
            let mock = mock_with_groups(16);
            let result = user_set(&mock, UserWpType::PowerOn, start, count, false);
            prop_assert!(matches!(result, Err(MmcError::Precondition(_))));
            prop_assert!(mock.mutating_commands().is_empty());
        }

        #[test]
        fn prop_ranges_past_device_end_mutate_nothing(
            start_group in 0u32..16,
            groups in 1u32..16,
        ) {
            prop_assume!(start_group + groups > 16);
            let mock = mock_with_groups(16);
            let result = user_set(&mock, UserWpType::PowerOn, start_group * GROUP, groups * GROUP, false);
            prop_assert!(matches!(result, Err(MmcError::Precondition(_))));
            prop_assert!(mock.mutating_commands().is_empty());
        }
    }
}
