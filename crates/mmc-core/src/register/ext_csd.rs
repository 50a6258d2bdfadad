//! Typed view over one EXT_CSD snapshot.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use tracing::debug;

use super::fields::*;
use crate::error::{MmcError, Result};
use crate::protocol::CommandDescriptor;
use crate::transport::MmcTransport;

/// Size of the EXT_CSD register page.
pub const EXT_CSD_SIZE: usize = 512;

/// EXT_CSD_REV value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Revision(pub u8);

impl Revision {
    pub const V4_41: Revision = Revision(EXT_CSD_REV_V4_41);
    pub const V4_5: Revision = Revision(EXT_CSD_REV_V4_5);
    pub const V5_0: Revision = Revision(EXT_CSD_REV_V5_0);
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.0 {
            0 => "4.0",
            1 => "4.1",
            2 => "4.2",
            3 => "4.3",
            5 => "4.41",
            6 => "4.5",
            7 => "5.0",
            8 => "5.1",
            _ => return write!(f, "unknown (0x{:02x})", self.0),
        };
        write!(f, "MMC {}", name)
    }
}

/// One immutable EXT_CSD snapshot.
///
/// Re-read with [`ExtCsd::read`] to observe changes made by later commands.
/// Fields introduced by a later revision read as reserved on older parts;
/// use [`ExtCsd::require_revision`] before trusting them.
#[derive(Clone, PartialEq, Eq)]
pub struct ExtCsd {
    raw: [u8; EXT_CSD_SIZE],
}

impl ExtCsd {
    /// Issue CMD8 and capture the page.
    pub fn read<T: MmcTransport + ?Sized>(transport: &T) -> Result<Self> {
        let mut cmd = CommandDescriptor::send_ext_csd();
        transport.issue(&mut cmd)?;
        let page = Self::from_slice(&cmd.data)?;
        debug!(rev = page.revision().0, "Read EXT_CSD");
        Ok(page)
    }

    pub fn from_bytes(raw: [u8; EXT_CSD_SIZE]) -> Self {
        Self { raw }
    }

    pub fn from_slice(data: &[u8]) -> Result<Self> {
        let raw: [u8; EXT_CSD_SIZE] = data.try_into().map_err(|_| {
            MmcError::rejected("SEND_EXT_CSD", format!("returned {} bytes", data.len()))
        })?;
        Ok(Self { raw })
    }

    pub fn as_bytes(&self) -> &[u8; EXT_CSD_SIZE] {
        &self.raw
    }

    /// Raw byte at `offset`.
    pub fn byte(&self, offset: usize) -> u8 {
        self.raw[offset]
    }

    fn le_u32(&self, offset: usize) -> u32 {
        LittleEndian::read_u32(&self.raw[offset..offset + 4])
    }

    /// Three consecutive bytes starting at `offset_0`, least significant first.
    fn le_u24(&self, offset_0: usize) -> u32 {
        LittleEndian::read_u24(&self.raw[offset_0..offset_0 + 3])
    }

    pub fn revision(&self) -> Revision {
        Revision(self.raw[EXT_CSD_REV])
    }

    /// Fail with [`MmcError::Unsupported`] below `min`.
    pub fn require_revision(&self, min: Revision, feature: &'static str) -> Result<()> {
        if self.revision() < min {
            return Err(MmcError::unsupported(
                feature,
                format!("needs {} or newer, device reports {}", min, self.revision()),
            ));
        }
        Ok(())
    }

    pub fn sector_count(&self) -> u32 {
        self.le_u32(EXT_CSD_SEC_COUNT_0)
    }

    /// Devices above 2 GiB are sector addressed.
    pub fn is_block_addressed(&self) -> bool {
        self.sector_count() > (2u32 * 1024 * 1024 * 1024) / 512
    }

    /// HC_ERASE_GRP_SIZE in 512 KiB units.
    pub fn hc_erase_grp_size(&self) -> u8 {
        self.raw[EXT_CSD_HC_ERASE_GRP_SIZE]
    }

    /// HC_WP_GRP_SIZE in erase groups.
    pub fn hc_wp_grp_size(&self) -> u8 {
        self.raw[EXT_CSD_HC_WP_GRP_SIZE]
    }

    pub fn erase_timeout_mult(&self) -> u8 {
        self.raw[EXT_CSD_ERASE_TIMEOUT_MULT]
    }

    /// ERASE_GROUP_DEF bit 0: high-capacity group sizes in effect.
    pub fn high_capacity_erase_groups(&self) -> bool {
        self.raw[EXT_CSD_ERASE_GROUP_DEF] & 0x01 != 0
    }

    pub fn sec_feature_support(&self) -> u8 {
        self.raw[EXT_CSD_SEC_FEATURE_SUPPORT]
    }

    pub fn partition_setting_completed(&self) -> bool {
        self.raw[EXT_CSD_PARTITION_SETTING_COMPLETED] != 0
    }

    pub fn partitioning_support(&self) -> u8 {
        self.raw[EXT_CSD_PARTITIONING_SUPPORT]
    }

    pub fn partitions_attribute(&self) -> u8 {
        self.raw[EXT_CSD_PARTITIONS_ATTRIBUTE]
    }

    /// GP_SIZE_MULT for general purpose partition `index` (1..=4).
    pub fn gp_size_mult(&self, index: u8) -> u32 {
        debug_assert!((1..=4).contains(&index));
        self.le_u24(gp_size_mult_offset(index))
    }

    pub fn enh_size_mult(&self) -> u32 {
        self.le_u24(EXT_CSD_ENH_SIZE_MULT_0)
    }

    pub fn max_enh_size_mult(&self) -> u32 {
        self.le_u24(EXT_CSD_MAX_ENH_SIZE_MULT_0)
    }

    pub fn enh_start_addr(&self) -> u32 {
        self.le_u32(EXT_CSD_ENH_START_ADDR_0)
    }

    pub fn wr_rel_param(&self) -> u8 {
        self.raw[EXT_CSD_WR_REL_PARAM]
    }

    pub fn wr_rel_set(&self) -> u8 {
        self.raw[EXT_CSD_WR_REL_SET]
    }

    pub fn user_wp(&self) -> u8 {
        self.raw[EXT_CSD_USER_WP]
    }

    pub fn boot_wp(&self) -> u8 {
        self.raw[EXT_CSD_BOOT_WP]
    }

    pub fn boot_wp_status(&self) -> u8 {
        self.raw[EXT_CSD_BOOT_WP_STATUS]
    }

    pub fn part_config(&self) -> u8 {
        self.raw[EXT_CSD_PART_CONFIG]
    }

    pub fn boot_info(&self) -> u8 {
        self.raw[EXT_CSD_BOOT_INFO]
    }

    /// Boot partition size in bytes.
    pub fn boot_partition_size(&self) -> usize {
        self.raw[EXT_CSD_BOOT_MULT] as usize * BOOT_SIZE_UNIT_BYTES
    }

    pub fn boot_bus_conditions(&self) -> u8 {
        self.raw[EXT_CSD_BOOT_BUS_CONDITIONS]
    }

    pub fn rst_n_function(&self) -> u8 {
        self.raw[EXT_CSD_RST_N_FUNCTION]
    }

    pub fn cache_size(&self) -> u32 {
        self.le_u32(EXT_CSD_CACHE_SIZE_0)
    }

    pub fn native_sector_size(&self) -> u8 {
        self.raw[EXT_CSD_NATIVE_SECTOR_SIZE]
    }

    pub fn data_sector_size(&self) -> u8 {
        self.raw[EXT_CSD_DATA_SECTOR_SIZE]
    }

    /// Active data sector size in bytes.
    pub fn data_sector_bytes(&self) -> usize {
        if self.data_sector_size() == 0 { 512 } else { 4096 }
    }

    pub fn ext_partitions_attribute(&self, index: usize) -> u8 {
        self.raw[EXT_CSD_EXT_PARTITIONS_ATTRIBUTE_0 + index]
    }

    pub fn supported_modes(&self) -> u8 {
        self.raw[EXT_CSD_SUPPORTED_MODES]
    }

    pub fn fw_config(&self) -> u8 {
        self.raw[EXT_CSD_FW_CONFIG]
    }

    pub fn ffu_features(&self) -> u8 {
        self.raw[EXT_CSD_FFU_FEATURES]
    }

    pub fn ffu_arg(&self) -> u32 {
        self.le_u32(EXT_CSD_FFU_ARG_0)
    }

    pub fn ffu_status(&self) -> u8 {
        self.raw[EXT_CSD_FFU_STATUS]
    }

    pub fn fw_sectors_programmed(&self) -> u32 {
        self.le_u32(EXT_CSD_NUM_OF_FW_SEC_PROG_0)
    }

    /// Partition size alignment in KiB: one high-capacity write protect group.
    pub fn partition_align_kib(&self) -> u64 {
        512 * self.hc_wp_grp_size() as u64 * self.hc_erase_grp_size() as u64
    }

    /// Write protect group size in 512-byte blocks.
    ///
    /// Groups are single blocks unless the part is at least 4.41 and high
    /// capacity erase groups are enabled.
    pub fn wp_group_size_blocks(&self) -> u32 {
        if self.revision() < Revision::V4_41 || !self.high_capacity_erase_groups() {
            return 1;
        }
        self.hc_erase_grp_size() as u32 * self.hc_wp_grp_size() as u32 * 1024
    }
}

impl fmt::Debug for ExtCsd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtCsd")
            .field("rev", &self.revision())
            .field("sec_count", &self.sector_count())
            .finish_non_exhaustive()
    }
}

/// Offset of GP_SIZE_MULT_n_0 for partition `index` (1..=4).
pub fn gp_size_mult_offset(index: u8) -> usize {
    EXT_CSD_GP_SIZE_MULT_1_0 + 3 * (index as usize - 1)
}
