//! Download strategies: how mode switches and chunk transfers are batched.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{MmcError, Result};
use crate::protocol::constants::*;
use crate::protocol::{CommandBatch, CommandClass, CommandDescriptor, Direction, ResponseKind};
use crate::register::fields::*;
use crate::transport::{MmcTransport, TransportError};

/// FFU download variant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FfuMode {
    /// [enter, CMD23, CMD25, exit] per chunk.
    #[default]
    Default,
    /// [CMD23, CMD25] per chunk, mode held for the session.
    Opt1,
    /// [CMD25 open-ended, CMD12] per chunk, mode held for the session.
    Opt2,
    /// [enter, CMD24, exit] per 512-byte chunk.
    Opt3,
    /// Bare CMD24 per 512-byte chunk, mode held for the session.
    Opt4,
}

impl FfuMode {
    pub const ALL: [FfuMode; 5] = [Self::Default, Self::Opt1, Self::Opt2, Self::Opt3, Self::Opt4];

    /// Whether MODE_CONFIG is switched once around the whole download
    /// instead of inside every chunk batch.
    pub fn session_scoped(self) -> bool {
        matches!(self, Self::Opt1 | Self::Opt2 | Self::Opt4)
    }

    /// Chunk size actually used; the single-block variants always send 512.
    pub fn effective_chunk_size(self, requested: usize) -> usize {
        match self {
            Self::Opt3 | Self::Opt4 => MMC_BLOCK_SIZE,
            _ => requested,
        }
    }

    /// Commands that carry `chunk` to the device.
    pub fn transfer(self, chunk: &[u8], arg: u32) -> Transfer {
        let blocks = (chunk.len() / MMC_BLOCK_SIZE) as u32;
        let write = |opcode: u8, blocks: u32| {
            CommandDescriptor::single(opcode, Direction::Write, blocks, arg, Some(chunk.to_vec()))
        };
        match self {
            Self::Default => Transfer::Batch(CommandBatch::new(vec![
                enter_mode(),
                CommandDescriptor::set_block_count(blocks),
                write(MMC_WRITE_MULTIPLE_BLOCK, blocks),
                exit_mode(),
            ])),
            Self::Opt1 => Transfer::Batch(CommandBatch::new(vec![
                CommandDescriptor::set_block_count(blocks),
                write(MMC_WRITE_MULTIPLE_BLOCK, blocks),
            ])),
            Self::Opt2 => Transfer::Batch(CommandBatch::new(vec![
                write(MMC_WRITE_MULTIPLE_BLOCK, blocks)
                    .with_response(ResponseKind::R1, CommandClass::Adtc)
                    .without_spi_response(),
                CommandDescriptor::stop_transmission(),
            ])),
            Self::Opt3 => Transfer::Batch(CommandBatch::new(vec![
                enter_mode(),
                write(MMC_WRITE_BLOCK, 1),
                exit_mode(),
            ])),
            Self::Opt4 => Transfer::Single(write(MMC_WRITE_BLOCK, 1)),
        }
    }

    pub fn token(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Opt1 => "opt1",
            Self::Opt2 => "opt2",
            Self::Opt3 => "opt3",
            Self::Opt4 => "opt4",
        }
    }
}

impl fmt::Display for FfuMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

impl FromStr for FfuMode {
    type Err = MmcError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|mode| mode.token() == s)
            .ok_or_else(|| MmcError::precondition(format!("Unknown FFU mode: {}", s)))
    }
}

/// CMD6 MODE_CONFIG = FFU.
pub fn enter_mode() -> CommandDescriptor {
    CommandDescriptor::switch(EXT_CSD_MODE_CONFIG as u8, EXT_CSD_FFU_MODE)
}

/// CMD6 MODE_CONFIG = normal.
pub fn exit_mode() -> CommandDescriptor {
    CommandDescriptor::switch(EXT_CSD_MODE_CONFIG as u8, EXT_CSD_NORMAL_MODE)
}

/// One chunk's worth of commands.
#[derive(Debug)]
pub enum Transfer {
    Batch(CommandBatch),
    Single(CommandDescriptor),
}

impl Transfer {
    pub fn issue<T: MmcTransport + ?Sized>(&mut self, transport: &T) -> std::result::Result<(), TransportError> {
        match self {
            Self::Batch(batch) => transport.issue_batch(batch).map(drop),
            Self::Single(cmd) => transport.issue(cmd).map(drop),
        }
    }

    pub fn commands(&self) -> &[CommandDescriptor] {
        match self {
            Self::Batch(batch) => batch.commands(),
            Self::Single(cmd) => std::slice::from_ref(cmd),
        }
    }
}
