//! Command descriptors and atomic multi-command batches.
//!
//! A [`CommandDescriptor`] mirrors one `struct mmc_ioc_cmd`: opcode,
//! argument, direction, response format, block geometry, optional
//! timeouts and the owned data buffer. A [`CommandBatch`] is the ordered
//! group submitted through `MMC_IOC_MULTI_CMD`.

use std::fmt;

use super::constants::*;

/// Data direction of a command, as seen from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Device to host (or no data).
    Read,
    /// Host to device.
    Write,
}

/// Response format expected from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// No response (CMD0).
    None,
    /// 48-bit R1 response.
    R1,
    /// R1 followed by busy signalling on DAT0.
    R1b,
}

/// Command class field of the ioctl flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandClass {
    /// Addressed, no data transfer.
    Ac,
    /// Addressed, data transfer.
    Adtc,
    /// Broadcast, no response.
    Bc,
}

/// One raw MMC command.
#[derive(Clone, PartialEq, Eq)]
pub struct CommandDescriptor {
    pub opcode: u8,
    pub arg: u32,
    pub direction: Direction,
    /// Set bit 31 of `write_flag` (reliable write). Only meaningful for writes.
    pub reliable_write: bool,
    pub response: ResponseKind,
    pub class: CommandClass,
    /// Also request the SPI-mode response bits.
    pub spi_response: bool,
    pub blksz: u32,
    pub blocks: u32,
    /// Zero leaves the choice to the transport.
    pub cmd_timeout_ms: u32,
    /// Zero leaves the choice to the transport.
    pub data_timeout_ns: u32,
    /// Exactly `blksz * blocks` bytes for data-bearing commands, else empty.
    pub data: Vec<u8>,
}

impl CommandDescriptor {
    /// Bare command with no data, no response and transport timeouts.
    pub fn new(opcode: u8, arg: u32) -> Self {
        Self {
            opcode,
            arg,
            direction: Direction::Read,
            reliable_write: false,
            response: ResponseKind::None,
            class: CommandClass::Ac,
            spi_response: false,
            blksz: 0,
            blocks: 0,
            cmd_timeout_ms: 0,
            data_timeout_ns: 0,
            data: Vec::new(),
        }
    }

    /// Data-bearing command with 512-byte blocks and an R1 response.
    ///
    /// For reads `data` may be `None`, in which case a zeroed buffer of the
    /// right size is allocated for the transport to fill.
    pub fn single(
        opcode: u8,
        direction: Direction,
        blocks: u32,
        arg: u32,
        data: Option<Vec<u8>>,
    ) -> Self {
        let len = MMC_BLOCK_SIZE * blocks as usize;
        let data = data.unwrap_or_else(|| vec![0u8; len]);
        debug_assert_eq!(data.len(), len, "buffer does not match block geometry");
        Self {
            direction,
            response: ResponseKind::R1,
            class: CommandClass::Adtc,
            spi_response: true,
            blksz: MMC_BLOCK_SIZE as u32,
            blocks,
            data,
            ..Self::new(opcode, arg)
        }
    }

    /// CMD6 byte write of `value` into EXT_CSD[`index`].
    pub fn switch(index: u8, value: u8) -> Self {
        let arg = (MMC_SWITCH_MODE_WRITE_BYTE << 24)
            | ((index as u32) << 16)
            | ((value as u32) << 8)
            | EXT_CSD_CMD_SET_NORMAL;
        Self {
            direction: Direction::Write,
            response: ResponseKind::R1b,
            spi_response: true,
            ..Self::new(MMC_SWITCH, arg)
        }
    }

    /// CMD8: read the 512-byte EXT_CSD page.
    pub fn send_ext_csd() -> Self {
        Self::single(MMC_SEND_EXT_CSD, Direction::Read, 1, 0, None)
    }

    /// CMD13 addressed to the default RCA.
    pub fn send_status() -> Self {
        Self {
            response: ResponseKind::R1,
            ..Self::new(MMC_SEND_STATUS, MMC_DEFAULT_RCA)
        }
    }

    /// CMD23 announcing the block count of the next multi-block transfer.
    pub fn set_block_count(blocks: u32) -> Self {
        Self {
            response: ResponseKind::R1,
            spi_response: true,
            ..Self::new(MMC_SET_BLOCK_COUNT, blocks)
        }
    }

    /// CMD28 (`on`) or CMD29 for the group containing `block`.
    pub fn write_protect(block: u32, on: bool) -> Self {
        let opcode = if on {
            MMC_SET_WRITE_PROT
        } else {
            MMC_CLEAR_WRITE_PROT
        };
        Self {
            direction: Direction::Write,
            response: ResponseKind::R1b,
            spi_response: true,
            ..Self::new(opcode, block)
        }
    }

    /// CMD31: 8 bytes of protection type bits starting at `block`.
    pub fn send_write_prot_type(block: u32) -> Self {
        Self {
            response: ResponseKind::R1,
            class: CommandClass::Adtc,
            spi_response: true,
            blksz: 8,
            blocks: 1,
            data: vec![0u8; 8],
            ..Self::new(MMC_SEND_WRITE_PROT_TYPE, block)
        }
    }

    /// CMD35 / CMD36 erase range markers.
    pub fn erase_group_bound(opcode: u8, block: u32) -> Self {
        debug_assert!(opcode == MMC_ERASE_GROUP_START || opcode == MMC_ERASE_GROUP_END);
        Self {
            direction: Direction::Write,
            response: ResponseKind::R1,
            spi_response: true,
            ..Self::new(opcode, block)
        }
    }

    /// CMD38 with the erase-type argument and the long erase timeout.
    pub fn erase(arg: u32) -> Self {
        Self {
            direction: Direction::Write,
            response: ResponseKind::R1b,
            spi_response: true,
            cmd_timeout_ms: ERASE_TIMEOUT_MS,
            ..Self::new(MMC_ERASE, arg)
        }
    }

    /// CMD12 terminating an open-ended transfer.
    pub fn stop_transmission() -> Self {
        Self {
            response: ResponseKind::R1b,
            spi_response: true,
            ..Self::new(MMC_STOP_TRANSMISSION, 0)
        }
    }

    /// CMD0 with the given argument, broadcast and without response.
    pub fn go_idle(arg: u32) -> Self {
        Self {
            class: CommandClass::Bc,
            ..Self::new(MMC_GO_IDLE_STATE, arg)
        }
    }

    /// Override the command timeout.
    pub fn with_timeout_ms(mut self, timeout_ms: u32) -> Self {
        self.cmd_timeout_ms = timeout_ms;
        self
    }

    /// Override the data timeout.
    pub fn with_data_timeout_ns(mut self, timeout_ns: u32) -> Self {
        self.data_timeout_ns = timeout_ns;
        self
    }

    /// Replace the response format and command class.
    pub fn with_response(mut self, response: ResponseKind, class: CommandClass) -> Self {
        self.response = response;
        self.class = class;
        self
    }

    /// Drop the SPI response bits from the encoded flags.
    pub fn without_spi_response(mut self) -> Self {
        self.spi_response = false;
        self
    }

    /// Mark the write as reliable.
    pub fn reliable(mut self) -> Self {
        self.reliable_write = true;
        self
    }

    /// Value of the ioctl `write_flag` field.
    pub fn write_flag(&self) -> u32 {
        match self.direction {
            Direction::Read => 0,
            Direction::Write if self.reliable_write => MMC_RELIABLE_WRITE_FLAG | 1,
            Direction::Write => 1,
        }
    }

    /// Value of the ioctl `flags` field.
    pub fn flags(&self) -> u32 {
        let response = match (self.response, self.spi_response) {
            (ResponseKind::None, _) => MMC_RSP_NONE,
            (ResponseKind::R1, false) => MMC_RSP_R1,
            (ResponseKind::R1, true) => MMC_RSP_SPI_R1 | MMC_RSP_R1,
            (ResponseKind::R1b, false) => MMC_RSP_R1B,
            (ResponseKind::R1b, true) => MMC_RSP_SPI_R1B | MMC_RSP_R1B,
        };
        let class = match self.class {
            CommandClass::Ac => MMC_CMD_AC,
            CommandClass::Adtc => MMC_CMD_ADTC,
            CommandClass::Bc => MMC_CMD_BC,
        };
        response | class
    }

    /// Whether this command transfers a data buffer.
    pub fn has_data(&self) -> bool {
        !self.data.is_empty()
    }

    /// For a CMD6 descriptor, the `(index, value)` it writes.
    pub fn switch_target(&self) -> Option<(u8, u8)> {
        (self.opcode == MMC_SWITCH).then(|| (((self.arg >> 16) & 0xFF) as u8, ((self.arg >> 8) & 0xFF) as u8))
    }
}

impl fmt::Debug for CommandDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandDescriptor")
            .field("opcode", &self.opcode)
            .field("arg", &format_args!("0x{:08X}", self.arg))
            .field("write_flag", &format_args!("0x{:08X}", self.write_flag()))
            .field("flags", &format_args!("0x{:04X}", self.flags()))
            .field("blksz", &self.blksz)
            .field("blocks", &self.blocks)
            .field("cmd_timeout_ms", &self.cmd_timeout_ms)
            .field("data_len", &self.data.len())
            .finish()
    }
}

impl fmt::Display for CommandDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CMD{} arg=0x{:08X}", self.opcode, self.arg)?;
        if self.blocks > 0 {
            write!(f, " {}x{}", self.blocks, self.blksz)?;
        }
        Ok(())
    }
}

/// Ordered group of 1 to [`MAX_BATCH_COMMANDS`] commands issued without
/// interleaving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandBatch {
    commands: Vec<CommandDescriptor>,
}

impl CommandBatch {
    pub fn new(commands: Vec<CommandDescriptor>) -> Self {
        debug_assert!(
            !commands.is_empty() && commands.len() <= MAX_BATCH_COMMANDS,
            "batch of {} commands",
            commands.len()
        );
        Self { commands }
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn commands(&self) -> &[CommandDescriptor] {
        &self.commands
    }

    pub fn commands_mut(&mut self) -> &mut [CommandDescriptor] {
        &mut self.commands
    }

    /// Take back the descriptors, with any data read into their buffers.
    pub fn into_commands(self) -> Vec<CommandDescriptor> {
        self.commands
    }
}

impl From<CommandDescriptor> for CommandBatch {
    fn from(cmd: CommandDescriptor) -> Self {
        Self::new(vec![cmd])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_switch_argument_encoding() {
        let cmd = CommandDescriptor::switch(171, 0x05);
        assert_eq!(cmd.opcode, MMC_SWITCH);
        assert_eq!(cmd.arg, (3 << 24) | (171 << 16) | (0x05 << 8) | 1);
        assert_eq!(cmd.write_flag(), 1);
        assert_eq!(cmd.flags(), MMC_RSP_SPI_R1B | MMC_RSP_R1B | MMC_CMD_AC);
        assert_eq!(cmd.switch_target(), Some((171, 0x05)));
    }

    #[test]
    fn test_single_fixes_block_size() {
        let cmd = CommandDescriptor::single(MMC_WRITE_MULTIPLE_BLOCK, Direction::Write, 4, 7, Some(vec![0xAA; 2048]));
        assert_eq!(cmd.blksz, 512);
        assert_eq!(cmd.blocks, 4);
        assert_eq!(cmd.data.len(), 2048);
        assert_eq!(cmd.flags(), MMC_RSP_SPI_R1 | MMC_RSP_R1 | MMC_CMD_ADTC);
    }

    #[test]
    fn test_read_allocates_buffer() {
        let cmd = CommandDescriptor::send_ext_csd();
        assert_eq!(cmd.data.len(), 512);
        assert_eq!(cmd.write_flag(), 0);
    }

    #[test]
    fn test_reliable_write_flag() {
        let cmd = CommandDescriptor::single(MMC_WRITE_MULTIPLE_BLOCK, Direction::Write, 1, 0, Some(vec![0; 512])).reliable();
        assert_eq!(cmd.write_flag(), (1 << 31) | 1);
    }

    #[test]
    fn test_erase_uses_long_timeout() {
        let cmd = CommandDescriptor::erase(0x8000_0000);
        assert_eq!(cmd.cmd_timeout_ms, 300 * 255 * 255);
        assert_eq!(cmd.flags(), MMC_RSP_SPI_R1B | MMC_RSP_R1B | MMC_CMD_AC);
    }

    #[test]
    fn test_status_and_idle_flags() {
        assert_eq!(CommandDescriptor::send_status().flags(), MMC_RSP_R1 | MMC_CMD_AC);
        assert_eq!(CommandDescriptor::send_status().arg, 1 << 16);
        assert_eq!(CommandDescriptor::go_idle(MMC_GO_PRE_IDLE_STATE_ARG).flags(), MMC_RSP_NONE | MMC_CMD_BC);
    }
}
