//! EXT_CSD field offsets and bit definitions (JESD84-B51 numbering).

// ============================================================================
// Field Offsets
// ============================================================================

pub const EXT_CSD_S_CMD_SET: usize = 504;
pub const EXT_CSD_SUPPORTED_MODES: usize = 493;
pub const EXT_CSD_FFU_FEATURES: usize = 492;
pub const EXT_CSD_FFU_ARG_0: usize = 487;
pub const EXT_CSD_NUM_OF_FW_SEC_PROG_0: usize = 302;
pub const EXT_CSD_CACHE_SIZE_0: usize = 249;
pub const EXT_CSD_SEC_FEATURE_SUPPORT: usize = 231;
pub const EXT_CSD_BOOT_INFO: usize = 228;
pub const EXT_CSD_BOOT_MULT: usize = 226;
pub const EXT_CSD_HC_ERASE_GRP_SIZE: usize = 224;
pub const EXT_CSD_ERASE_TIMEOUT_MULT: usize = 223;
pub const EXT_CSD_HC_WP_GRP_SIZE: usize = 221;
pub const EXT_CSD_SEC_COUNT_0: usize = 212;
pub const EXT_CSD_REV: usize = 192;
pub const EXT_CSD_PART_CONFIG: usize = 179;
pub const EXT_CSD_BOOT_BUS_CONDITIONS: usize = 177;
pub const EXT_CSD_ERASE_GROUP_DEF: usize = 175;
pub const EXT_CSD_BOOT_WP_STATUS: usize = 174;
pub const EXT_CSD_BOOT_WP: usize = 173;
pub const EXT_CSD_USER_WP: usize = 171;
pub const EXT_CSD_FW_CONFIG: usize = 169;
pub const EXT_CSD_WR_REL_SET: usize = 167;
pub const EXT_CSD_WR_REL_PARAM: usize = 166;
pub const EXT_CSD_SANITIZE_START: usize = 165;
pub const EXT_CSD_BKOPS_EN: usize = 163;
pub const EXT_CSD_RST_N_FUNCTION: usize = 162;
pub const EXT_CSD_PARTITIONING_SUPPORT: usize = 160;
pub const EXT_CSD_MAX_ENH_SIZE_MULT_0: usize = 157;
pub const EXT_CSD_PARTITIONS_ATTRIBUTE: usize = 156;
pub const EXT_CSD_PARTITION_SETTING_COMPLETED: usize = 155;
/// GP_SIZE_MULT_1_0; partition `n` (1-based) starts at `143 + 3 * (n - 1)`.
pub const EXT_CSD_GP_SIZE_MULT_1_0: usize = 143;
pub const EXT_CSD_ENH_SIZE_MULT_0: usize = 140;
pub const EXT_CSD_ENH_START_ADDR_0: usize = 136;
pub const EXT_CSD_NATIVE_SECTOR_SIZE: usize = 63;
pub const EXT_CSD_USE_NATIVE_SECTOR: usize = 62;
pub const EXT_CSD_DATA_SECTOR_SIZE: usize = 61;
pub const EXT_CSD_EXT_PARTITIONS_ATTRIBUTE_0: usize = 52;
pub const EXT_CSD_CACHE_CTRL: usize = 33;
pub const EXT_CSD_MODE_CONFIG: usize = 30;
pub const EXT_CSD_MODE_OPERATION_CODES: usize = 29;
pub const EXT_CSD_FFU_STATUS: usize = 26;

// ============================================================================
// Revision Values (EXT_CSD_REV)
// ============================================================================

pub const EXT_CSD_REV_V4_41: u8 = 5;
pub const EXT_CSD_REV_V4_5: u8 = 6;
pub const EXT_CSD_REV_V5_0: u8 = 7;

// ============================================================================
// Bit Definitions
// ============================================================================

// SEC_FEATURE_SUPPORT
pub const EXT_CSD_SEC_ER_EN: u8 = 1 << 0;
pub const EXT_CSD_SEC_GB_CL_EN: u8 = 1 << 4;
pub const EXT_CSD_SEC_SANITIZE: u8 = 1 << 6;

// SUPPORTED_MODES / FW_CONFIG
pub const EXT_CSD_FFU: u8 = 1 << 0;
pub const EXT_CSD_UPDATE_DISABLE: u8 = 1 << 0;

// MODE_CONFIG / MODE_OPERATION_CODES
pub const EXT_CSD_NORMAL_MODE: u8 = 0x00;
pub const EXT_CSD_FFU_MODE: u8 = 0x01;
pub const EXT_CSD_FFU_INSTALL: u8 = 0x01;

// WR_REL_PARAM
pub const HS_CTRL_REL: u8 = 1 << 0;
pub const EN_REL_WR: u8 = 1 << 2;

// BKOPS_EN
pub const BKOPS_MAN_ENABLE: u8 = 1 << 0;
pub const BKOPS_AUTO_ENABLE: u8 = 1 << 1;

// RST_N_FUNCTION
pub const EXT_CSD_RST_N_EN_MASK: u8 = 0x03;
pub const EXT_CSD_HW_RESET_EN: u8 = 0x01;
pub const EXT_CSD_HW_RESET_DIS: u8 = 0x02;

// PARTITIONING_SUPPORT / PARTITIONS_ATTRIBUTE
pub const EXT_CSD_ENH_ATTRIBUTE_EN: u8 = 1 << 1;
pub const EXT_CSD_ENH_USR: u8 = 1 << 0;

// BOOT_WP
pub const EXT_CSD_BOOT_WP_B_SEC_WP_SEL: u8 = 0x80;
pub const EXT_CSD_BOOT_WP_B_PWR_WP_DIS: u8 = 0x40;
pub const EXT_CSD_BOOT_WP_B_PERM_WP_DIS: u8 = 0x10;
pub const EXT_CSD_BOOT_WP_B_PERM_WP_SEC_SEL: u8 = 0x08;
pub const EXT_CSD_BOOT_WP_B_PERM_WP_EN: u8 = 0x04;
pub const EXT_CSD_BOOT_WP_B_PWR_WP_SEC_SEL: u8 = 0x02;
pub const EXT_CSD_BOOT_WP_B_PWR_WP_EN: u8 = 0x01;

// BOOT_WP_STATUS
pub const EXT_CSD_BOOT_WP_S_AREA_1_PERM: u8 = 0x08;
pub const EXT_CSD_BOOT_WP_S_AREA_1_PWR: u8 = 0x04;
pub const EXT_CSD_BOOT_WP_S_AREA_0_PERM: u8 = 0x02;
pub const EXT_CSD_BOOT_WP_S_AREA_0_PWR: u8 = 0x01;

// USER_WP
pub const USER_WP_PERM_PSWD_DIS: u8 = 0x80;
pub const USER_WP_CD_PERM_WP_DIS: u8 = 0x40;
pub const USER_WP_US_PERM_WP_DIS: u8 = 0x10;
pub const USER_WP_US_PWR_WP_DIS: u8 = 0x08;
pub const USER_WP_US_PERM_WP_EN: u8 = 0x04;
pub const USER_WP_US_PWR_WP_EN: u8 = 0x01;
/// Bits cleared before selecting a new protection mode.
pub const USER_WP_CLEAR: u8 =
    USER_WP_US_PERM_WP_DIS | USER_WP_US_PWR_WP_DIS | USER_WP_US_PERM_WP_EN | USER_WP_US_PWR_WP_EN;

// PART_CONFIG
pub const EXT_CSD_PART_CONFIG_ACC_ACK: u8 = 0x40;
pub const EXT_CSD_PART_CONFIG_BOOT_MASK: u8 = 0x7 << 3;

// BOOT_INFO
pub const EXT_CSD_BOOT_INFO_ALT: u8 = 1 << 0;

// BOOT_BUS_CONDITIONS
pub const BOOT_MODE_SINGLE_BACKWARD: u8 = 0x00;
pub const BOOT_MODE_SINGLE_HS: u8 = 0x08;
pub const BOOT_MODE_DUAL: u8 = 0x10;
pub const BOOT_BUS_RESET_X1: u8 = 0x00;
pub const BOOT_BUS_RESET_RETAIN: u8 = 0x04;
pub const BOOT_BUS_WIDTH_X1: u8 = 0x00;
pub const BOOT_BUS_WIDTH_X4: u8 = 0x01;
pub const BOOT_BUS_WIDTH_X8: u8 = 0x02;

// ============================================================================
// Unit Sizes
// ============================================================================

/// HC_ERASE_GRP_SIZE unit in bytes.
pub const HC_ERASE_UNIT_BYTES: u64 = 512 * 1024;
/// BOOT_MULT unit in bytes.
pub const BOOT_SIZE_UNIT_BYTES: usize = 128 * 1024;
