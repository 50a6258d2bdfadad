//! Linux MMC block ioctl transport.
//!
//! Drives `MMC_IOC_CMD` and `MMC_IOC_MULTI_CMD` on `/dev/mmcblkN` (or the
//! `rpmb`/`bootN` siblings). Read buffers are filled in place.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::Path;

use tracing::{debug, info, instrument};

use super::traits::{MmcTransport, TransportError};
use crate::protocol::constants::MAX_BATCH_COMMANDS;
use crate::protocol::{CommandBatch, CommandDescriptor, CommandResponse};

/// `_IOWR(MMC_BLOCK_MAJOR, 0, struct mmc_ioc_cmd)`
const MMC_IOC_CMD: u32 = 0xC048_B300;
/// `_IOWR(MMC_BLOCK_MAJOR, 1, struct mmc_ioc_multi_cmd)`
const MMC_IOC_MULTI_CMD: u32 = 0xC008_B301;
/// `_IO(0x12, 96)`: size in 512-byte sectors as `unsigned long`.
const BLKGETSIZE: u32 = 0x1260;

/// `struct mmc_ioc_cmd` from `linux/mmc/ioctl.h`.
#[allow(dead_code)]
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct MmcIocCmd {
    write_flag: i32,
    is_acmd: i32,
    opcode: u32,
    arg: u32,
    response: [u32; 4],
    flags: u32,
    blksz: u32,
    blocks: u32,
    postsleep_min_us: u32,
    postsleep_max_us: u32,
    data_timeout_ns: u32,
    cmd_timeout_ms: u32,
    pad: u32,
    data_ptr: u64,
}

const _: () = assert!(std::mem::size_of::<MmcIocCmd>() == 72);

/// `struct mmc_ioc_multi_cmd` with room for the largest batch built here.
#[repr(C)]
struct MmcIocMultiCmd {
    num_of_cmds: u64,
    cmds: [MmcIocCmd; MAX_BATCH_COMMANDS],
}

impl MmcIocCmd {
    /// The returned value points into `cmd.data`; keep `cmd` alive and
    /// unmoved until the ioctl returns.
    fn from_descriptor(cmd: &mut CommandDescriptor) -> Self {
        Self {
            write_flag: cmd.write_flag() as i32,
            opcode: cmd.opcode as u32,
            arg: cmd.arg,
            flags: cmd.flags(),
            blksz: cmd.blksz,
            blocks: cmd.blocks,
            data_timeout_ns: cmd.data_timeout_ns,
            cmd_timeout_ms: cmd.cmd_timeout_ms,
            data_ptr: if cmd.has_data() {
                cmd.data.as_mut_ptr() as u64
            } else {
                0
            },
            ..Self::default()
        }
    }
}

/// Transport over the kernel MMC block driver.
pub struct IoctlTransport {
    file: File,
    path: String,
}

impl IoctlTransport {
    /// Open the device node read/write.
    #[instrument(level = "info", skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TransportError> {
        let path_str = path.as_ref().display().to_string();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map_err(|source| TransportError::OpenFailed {
                path: path_str.clone(),
                source,
            })?;
        info!(device = %path_str, "Device opened");
        Ok(Self { file, path: path_str })
    }
}

impl MmcTransport for IoctlTransport {
    #[instrument(skip(self, cmd), fields(opcode = cmd.opcode, arg = %format!("0x{:08X}", cmd.arg)))]
    fn issue(&self, cmd: &mut CommandDescriptor) -> Result<CommandResponse, TransportError> {
        let mut raw = MmcIocCmd::from_descriptor(cmd);
        // SAFETY: `raw` matches the kernel layout and its data pointer refers
        // to `cmd.data`, which outlives the call and is sized blksz * blocks.
        let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), MMC_IOC_CMD as _, &mut raw as *mut MmcIocCmd) };
        if ret != 0 {
            return Err(TransportError::CommandFailed {
                opcode: cmd.opcode,
                source: std::io::Error::last_os_error(),
            });
        }
        debug!(response = %format!("0x{:08X}", raw.response[0]), "Command complete");
        Ok(CommandResponse(raw.response))
    }

    #[instrument(skip(self, batch), fields(len = batch.len()))]
    fn issue_batch(&self, batch: &mut CommandBatch) -> Result<Vec<CommandResponse>, TransportError> {
        let len = batch.len();
        if len == 0 || len > MAX_BATCH_COMMANDS {
            return Err(TransportError::InvalidBatch(len));
        }

        let mut multi = MmcIocMultiCmd {
            num_of_cmds: len as u64,
            cmds: [MmcIocCmd::default(); MAX_BATCH_COMMANDS],
        };
        for (slot, cmd) in multi.cmds.iter_mut().zip(batch.commands_mut()) {
            *slot = MmcIocCmd::from_descriptor(cmd);
        }

        // SAFETY: the kernel reads `num_of_cmds` entries following the
        // header; every data pointer refers to a descriptor buffer owned by
        // `batch`, which is borrowed for the duration of the call.
        let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), MMC_IOC_MULTI_CMD as _, &mut multi as *mut MmcIocMultiCmd) };
        if ret != 0 {
            return Err(TransportError::BatchFailed {
                len,
                source: std::io::Error::last_os_error(),
            });
        }
        debug!("Batch complete");
        Ok(multi.cmds[..len].iter().map(|raw| CommandResponse(raw.response)).collect())
    }

    fn capacity_blocks(&self) -> Result<u64, TransportError> {
        let mut sectors: libc::c_ulong = 0;
        // SAFETY: BLKGETSIZE writes one unsigned long.
        let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), BLKGETSIZE as _, &mut sectors as *mut libc::c_ulong) };
        if ret != 0 {
            return Err(TransportError::SizeQuery(std::io::Error::last_os_error()));
        }
        Ok(sectors as u64)
    }

    fn device_name(&self) -> &str {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Direction;
    use crate::protocol::constants::*;

    #[test]
    fn test_ioc_cmd_mirrors_descriptor() {
        let mut cmd = CommandDescriptor::single(MMC_WRITE_MULTIPLE_BLOCK, Direction::Write, 2, 0x10, Some(vec![0; 1024]))
            .reliable();
        let raw = MmcIocCmd::from_descriptor(&mut cmd);
        assert_eq!(raw.opcode, 25);
        assert_eq!(raw.write_flag as u32, (1 << 31) | 1);
        assert_eq!(raw.blksz, 512);
        assert_eq!(raw.blocks, 2);
        assert_eq!(raw.data_ptr, cmd.data.as_ptr() as u64);
    }

    #[test]
    fn test_no_data_means_null_pointer() {
        let mut cmd = CommandDescriptor::switch(33, 1);
        assert_eq!(MmcIocCmd::from_descriptor(&mut cmd).data_ptr, 0);
    }

    #[test]
    fn test_open_missing_device() {
        let err = IoctlTransport::open("/nonexistent/mmcblk9").err().unwrap();
        assert!(matches!(err, TransportError::OpenFailed { .. }));
    }
}
