//! MMC command-level constants.
//!
//! Opcodes, response flag encodings and fixed argument words as used on
//! the Linux `mmc_ioc_cmd` interface. EXT_CSD field offsets live in
//! [`crate::register::fields`].

// ============================================================================
// Command Opcodes
// ============================================================================

pub const MMC_GO_IDLE_STATE: u8 = 0;
pub const MMC_SWITCH: u8 = 6;
pub const MMC_SEND_EXT_CSD: u8 = 8;
pub const MMC_STOP_TRANSMISSION: u8 = 12;
pub const MMC_SEND_STATUS: u8 = 13;
pub const MMC_READ_MULTIPLE_BLOCK: u8 = 18;
pub const MMC_SET_BLOCK_COUNT: u8 = 23;
pub const MMC_WRITE_BLOCK: u8 = 24;
pub const MMC_WRITE_MULTIPLE_BLOCK: u8 = 25;
pub const MMC_SET_WRITE_PROT: u8 = 28;
pub const MMC_CLEAR_WRITE_PROT: u8 = 29;
pub const MMC_SEND_WRITE_PROT_TYPE: u8 = 31;
pub const MMC_ERASE_GROUP_START: u8 = 35;
pub const MMC_ERASE_GROUP_END: u8 = 36;
pub const MMC_ERASE: u8 = 38;
pub const MMC_GEN_CMD: u8 = 56;

// ============================================================================
// Response / Command Type Flags (linux/mmc/core.h)
// ============================================================================

pub const MMC_RSP_PRESENT: u32 = 1 << 0;
pub const MMC_RSP_136: u32 = 1 << 1;
pub const MMC_RSP_CRC: u32 = 1 << 2;
pub const MMC_RSP_BUSY: u32 = 1 << 3;
pub const MMC_RSP_OPCODE: u32 = 1 << 4;

pub const MMC_CMD_AC: u32 = 0;
pub const MMC_CMD_ADTC: u32 = 1 << 5;
pub const MMC_CMD_BC: u32 = 2 << 5;
pub const MMC_CMD_BCR: u32 = 3 << 5;

pub const MMC_RSP_SPI_S1: u32 = 1 << 7;
pub const MMC_RSP_SPI_BUSY: u32 = 1 << 10;

pub const MMC_RSP_NONE: u32 = 0;
pub const MMC_RSP_R1: u32 = MMC_RSP_PRESENT | MMC_RSP_CRC | MMC_RSP_OPCODE;
pub const MMC_RSP_R1B: u32 = MMC_RSP_R1 | MMC_RSP_BUSY;
pub const MMC_RSP_SPI_R1: u32 = MMC_RSP_SPI_S1;
pub const MMC_RSP_SPI_R1B: u32 = MMC_RSP_SPI_S1 | MMC_RSP_SPI_BUSY;

// ============================================================================
// Argument Words
// ============================================================================

/// CMD6 access mode: write byte.
pub const MMC_SWITCH_MODE_WRITE_BYTE: u32 = 0x03;
/// CMD6 command set field.
pub const EXT_CSD_CMD_SET_NORMAL: u32 = 1 << 0;

/// Relative card address used by CMD13 (the kernel assigns RCA 1).
pub const MMC_DEFAULT_RCA: u32 = 1 << 16;

pub const MMC_GO_IDLE_STATE_ARG: u32 = 0x0000_0000;
pub const MMC_GO_PRE_IDLE_STATE_ARG: u32 = 0xF0F0_F0F0;
pub const MMC_BOOT_INITIATION_ARG: u32 = 0xFFFF_FFFA;

/// `write_flag` bit requesting a reliable write (used for RPMB requests).
pub const MMC_RELIABLE_WRITE_FLAG: u32 = 1 << 31;

// ============================================================================
// Size Constants
// ============================================================================

/// Block size used by every data-bearing command issued here.
pub const MMC_BLOCK_SIZE: usize = 512;

/// Largest single transfer accepted by the kernel ioctl interface.
pub const MMC_IOC_MAX_BYTES: usize = 512 * 1024;

/// Largest number of commands accepted in one multi-command batch here.
pub const MAX_BATCH_COMMANDS: usize = 4;

/// CMD31 returns 32 groups worth of protection bits per query.
pub const WP_GROUPS_PER_QUERY: u32 = 32;

/// Command timeout for CMD38 (worst case multi-group erase).
pub const ERASE_TIMEOUT_MS: u32 = 300 * 255 * 255;

/// Boot partitions take up to a second to answer; the kernel wants ns.
pub const BOOT_DATA_TIMEOUT_NS: u32 = 2 * 1000 * 1000 * 1000;
