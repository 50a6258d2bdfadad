//! Simulated eMMC device for testing.
//!
//! The model is small but stateful: SWITCH writes land in an EXT_CSD page,
//! write protection is tracked per group, RPMB keeps a key, counter and
//! data with real HMACs, and FFU downloads advance the programmed-sectors
//! counter. Faults can be injected per opcode or per SWITCH target.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::sync::{Arc, Mutex};

use super::traits::{MmcTransport, TransportError};
use crate::auth::{RPMB_KEY_SIZE, RpmbKey};
use crate::ops::rpmb::{RPMB_DATA_SIZE, RPMB_FRAME_SIZE, RpmbFrame, RpmbRequest, RpmbResult};
use crate::protocol::constants::*;
use crate::protocol::{CommandBatch, CommandDescriptor, CommandResponse, DeviceStatus};
use crate::register::fields::*;
use crate::register::{EXT_CSD_SIZE, ExtCsd};

/// 4 GiB user area.
const DEFAULT_CAPACITY_BLOCKS: u64 = 8 * 1024 * 1024;
/// 128 KiB RPMB partition in 256-byte half sectors.
const RPMB_BLOCKS: u32 = 512;
/// R1 word for an idle device in TRAN state.
const READY_STATUS: u32 = DeviceStatus::READY_FOR_DATA.bits() | (4 << 9);

/// One command as the simulated device received it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedCommand {
    pub opcode: u8,
    pub arg: u32,
    pub write_flag: u32,
    pub flags: u32,
    pub blksz: u32,
    pub blocks: u32,
    pub cmd_timeout_ms: u32,
    pub data_timeout_ns: u32,
    /// Host payload for writes; empty or zeroed for reads.
    pub data: Vec<u8>,
}

impl LoggedCommand {
    fn capture(cmd: &CommandDescriptor) -> Self {
        Self {
            opcode: cmd.opcode,
            arg: cmd.arg,
            write_flag: cmd.write_flag(),
            flags: cmd.flags(),
            blksz: cmd.blksz,
            blocks: cmd.blocks,
            cmd_timeout_ms: cmd.cmd_timeout_ms,
            data_timeout_ns: cmd.data_timeout_ns,
            data: cmd.data.clone(),
        }
    }

    pub fn switch_target(&self) -> Option<(u8, u8)> {
        (self.opcode == MMC_SWITCH).then(|| (((self.arg >> 16) & 0xFF) as u8, ((self.arg >> 8) & 0xFF) as u8))
    }

    /// Anything sent host-to-device changes device state.
    pub fn is_mutating(&self) -> bool {
        self.write_flag != 0
    }
}

enum RpmbPending {
    Response(RpmbFrame),
    Read { address: u16, nonce: [u8; 16] },
}

#[derive(Default)]
struct RpmbModel {
    key: Option<[u8; RPMB_KEY_SIZE]>,
    counter: u32,
    blocks: HashMap<u16, [u8; RPMB_DATA_SIZE]>,
    pending: Option<RpmbPending>,
    corrupt_reads: bool,
}

struct DeviceModel {
    ext_csd: [u8; EXT_CSD_SIZE],
    capacity_blocks: u64,
    status: u32,
    responses: HashMap<u8, u32>,
    protection: BTreeMap<u64, u8>,
    rpmb: RpmbModel,
    fw_programmed: u32,
    zero_polls: u32,
    install_status: u8,
    failing_opcodes: HashSet<u8>,
    failing_switches: HashSet<u8>,
    log: Vec<LoggedCommand>,
    batches: Vec<usize>,
}

/// Simulated eMMC 5.0 device.
///
/// Clones share the same device.
#[derive(Clone)]
pub struct MockTransport {
    device: Arc<Mutex<DeviceModel>>,
    name: String,
}

impl MockTransport {
    /// A 4 GiB, revision 5.0 part that supports every feature driven here.
    pub fn new() -> Self {
        let mut page = [0u8; EXT_CSD_SIZE];
        page[EXT_CSD_REV] = EXT_CSD_REV_V5_0;
        page[EXT_CSD_SEC_COUNT_0..EXT_CSD_SEC_COUNT_0 + 4]
            .copy_from_slice(&(DEFAULT_CAPACITY_BLOCKS as u32).to_le_bytes());
        page[EXT_CSD_HC_ERASE_GRP_SIZE] = 1;
        page[EXT_CSD_HC_WP_GRP_SIZE] = 1;
        page[EXT_CSD_ERASE_GROUP_DEF] = 1;
        page[EXT_CSD_ERASE_TIMEOUT_MULT] = 1;
        page[EXT_CSD_SEC_FEATURE_SUPPORT] = EXT_CSD_SEC_ER_EN | EXT_CSD_SEC_GB_CL_EN | EXT_CSD_SEC_SANITIZE;
        page[EXT_CSD_PARTITIONING_SUPPORT] = 0x07;
        page[EXT_CSD_MAX_ENH_SIZE_MULT_0] = 0x00;
        page[EXT_CSD_MAX_ENH_SIZE_MULT_0 + 1] = 0x01;
        page[EXT_CSD_WR_REL_PARAM] = HS_CTRL_REL | EN_REL_WR;
        page[EXT_CSD_BOOT_MULT] = 32;
        page[EXT_CSD_BOOT_INFO] = EXT_CSD_BOOT_INFO_ALT;
        page[EXT_CSD_CACHE_SIZE_0 + 1] = 0x10;
        page[EXT_CSD_SUPPORTED_MODES] = EXT_CSD_FFU;
        page[EXT_CSD_FFU_FEATURES] = 0x01;
        page[EXT_CSD_FFU_ARG_0..EXT_CSD_FFU_ARG_0 + 4].copy_from_slice(&0xC0DE_0000u32.to_le_bytes());
        Self::with_ext_csd(page)
    }

    /// Device starting from an explicit EXT_CSD page.
    pub fn with_ext_csd(page: [u8; EXT_CSD_SIZE]) -> Self {
        let capacity_blocks = ExtCsd::from_bytes(page).sector_count() as u64;
        Self {
            device: Arc::new(Mutex::new(DeviceModel {
                ext_csd: page,
                capacity_blocks,
                status: READY_STATUS,
                responses: HashMap::new(),
                protection: BTreeMap::new(),
                rpmb: RpmbModel::default(),
                fw_programmed: 0,
                zero_polls: 0,
                install_status: 0,
                failing_opcodes: HashSet::new(),
                failing_switches: HashSet::new(),
                log: Vec::new(),
                batches: Vec::new(),
            })),
            name: "mock-mmcblk0".into(),
        }
    }

    // ------------------------------------------------------------------
    // Device setup
    // ------------------------------------------------------------------

    pub fn set_ext_csd_byte(&self, offset: usize, value: u8) {
        self.device.lock().unwrap().ext_csd[offset] = value;
    }

    pub fn ext_csd_byte(&self, offset: usize) -> u8 {
        self.device.lock().unwrap().ext_csd[offset]
    }

    pub fn ext_csd(&self) -> ExtCsd {
        ExtCsd::from_bytes(self.device.lock().unwrap().ext_csd)
    }

    /// Size reported by the block layer, independent of SEC_COUNT.
    pub fn set_capacity_blocks(&self, blocks: u64) {
        self.device.lock().unwrap().capacity_blocks = blocks;
    }

    /// R1 word returned by every command without an override.
    pub fn set_status(&self, word: u32) {
        self.device.lock().unwrap().status = word;
    }

    /// R1 word returned by `opcode`.
    pub fn set_response(&self, opcode: u8, word: u32) {
        self.device.lock().unwrap().responses.insert(opcode, word);
    }

    /// Make every command with `opcode` fail at the transport.
    pub fn fail_opcode(&self, opcode: u8) {
        self.device.lock().unwrap().failing_opcodes.insert(opcode);
    }

    /// Make SWITCH writes to EXT_CSD[`index`] fail at the transport.
    pub fn fail_switch(&self, index: u8) {
        self.device.lock().unwrap().failing_switches.insert(index);
    }

    pub fn clear_faults(&self) {
        let mut device = self.device.lock().unwrap();
        device.failing_opcodes.clear();
        device.failing_switches.clear();
    }

    /// The next `polls` EXT_CSD reads taken after firmware data was sent
    /// report zero programmed sectors and discard the download.
    pub fn zero_progress_polls(&self, polls: u32) {
        self.device.lock().unwrap().zero_polls = polls;
    }

    /// FFU_STATUS reported after an install request.
    pub fn set_install_status(&self, status: u8) {
        self.device.lock().unwrap().install_status = status;
    }

    /// Flip one data byte of every RPMB read after the MAC was computed.
    pub fn corrupt_rpmb_reads(&self, corrupt: bool) {
        self.device.lock().unwrap().rpmb.corrupt_reads = corrupt;
    }

    /// Protection type (0 none, 1 temporary, 2 power-on, 3 permanent).
    pub fn set_protection(&self, group: u64, kind: u8) {
        self.device.lock().unwrap().protection.insert(group, kind);
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub fn protection(&self, group: u64) -> u8 {
        self.device.lock().unwrap().protection.get(&group).copied().unwrap_or(0)
    }

    pub fn rpmb_counter(&self) -> u32 {
        self.device.lock().unwrap().rpmb.counter
    }

    pub fn fw_sectors_programmed(&self) -> u32 {
        self.device.lock().unwrap().fw_programmed
    }

    pub fn command_log(&self) -> Vec<LoggedCommand> {
        self.device.lock().unwrap().log.clone()
    }

    /// Commands sent host-to-device so far.
    pub fn mutating_commands(&self) -> Vec<LoggedCommand> {
        self.command_log().into_iter().filter(LoggedCommand::is_mutating).collect()
    }

    /// `(index, value)` of every SWITCH seen so far.
    pub fn switch_writes(&self) -> Vec<(u8, u8)> {
        self.command_log().iter().filter_map(LoggedCommand::switch_target).collect()
    }

    /// Length of each batch issued through `issue_batch`.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.device.lock().unwrap().batches.clone()
    }

    pub fn clear_log(&self) {
        let mut device = self.device.lock().unwrap();
        device.log.clear();
        device.batches.clear();
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceModel {
    fn execute(&mut self, cmd: &mut CommandDescriptor) -> io::Result<CommandResponse> {
        self.log.push(LoggedCommand::capture(cmd));

        if self.failing_opcodes.contains(&cmd.opcode) {
            return Err(io::Error::other(format!("injected fault on CMD{}", cmd.opcode)));
        }

        let mut status = self.responses.get(&cmd.opcode).copied().unwrap_or(self.status);
        match cmd.opcode {
            MMC_SEND_EXT_CSD => self.send_ext_csd(&mut cmd.data),
            MMC_SWITCH => {
                if let Some((index, value)) = cmd.switch_target() {
                    if self.failing_switches.contains(&index) {
                        return Err(io::Error::other(format!("injected fault on EXT_CSD[{}]", index)));
                    }
                    self.switch(index, value);
                }
            }
            MMC_SET_WRITE_PROT | MMC_CLEAR_WRITE_PROT => {
                if !self.write_protect(cmd.arg, cmd.opcode == MMC_SET_WRITE_PROT) {
                    status |= DeviceStatus::ADDRESS_OUT_OF_RANGE.bits();
                }
            }
            MMC_SEND_WRITE_PROT_TYPE => self.send_write_prot_type(cmd.arg, &mut cmd.data),
            MMC_WRITE_BLOCK | MMC_WRITE_MULTIPLE_BLOCK => {
                if self.ext_csd[EXT_CSD_MODE_CONFIG] == EXT_CSD_FFU_MODE {
                    self.fw_programmed += (cmd.data.len() / MMC_BLOCK_SIZE) as u32;
                } else if cmd.opcode == MMC_WRITE_MULTIPLE_BLOCK {
                    self.rpmb_request(&cmd.data)?;
                }
            }
            MMC_READ_MULTIPLE_BLOCK => self.rpmb_response(&mut cmd.data)?,
            MMC_GO_IDLE_STATE if cmd.arg == MMC_BOOT_INITIATION_ARG => {
                for (i, byte) in cmd.data.iter_mut().enumerate() {
                    *byte = (i % 251) as u8;
                }
            }
            MMC_GEN_CMD => {
                for (i, byte) in cmd.data.iter_mut().enumerate() {
                    *byte = i as u8;
                }
            }
            _ => {}
        }
        Ok(CommandResponse::from_r1(status))
    }

    fn send_ext_csd(&mut self, out: &mut [u8]) {
        if self.zero_polls > 0 && self.fw_programmed > 0 {
            self.zero_polls -= 1;
            self.fw_programmed = 0;
        }
        let programmed = self.fw_programmed.to_le_bytes();
        self.ext_csd[EXT_CSD_NUM_OF_FW_SEC_PROG_0..EXT_CSD_NUM_OF_FW_SEC_PROG_0 + 4].copy_from_slice(&programmed);
        let len = out.len().min(EXT_CSD_SIZE);
        out[..len].copy_from_slice(&self.ext_csd[..len]);
    }

    fn switch(&mut self, index: u8, value: u8) {
        let index = index as usize;
        match index {
            EXT_CSD_MODE_OPERATION_CODES if value == EXT_CSD_FFU_INSTALL => {
                if self.ext_csd[EXT_CSD_MODE_CONFIG] == EXT_CSD_FFU_MODE {
                    self.ext_csd[EXT_CSD_FFU_STATUS] = self.install_status;
                    self.ext_csd[EXT_CSD_MODE_CONFIG] = EXT_CSD_NORMAL_MODE;
                }
            }
            // Self-clearing trigger.
            EXT_CSD_SANITIZE_START => {}
            _ => self.ext_csd[index] = value,
        }
    }

    fn wp_group_size(&self) -> u64 {
        ExtCsd::from_bytes(self.ext_csd).wp_group_size_blocks() as u64
    }

    fn write_protect(&mut self, block: u32, set: bool) -> bool {
        let group = block as u64 / self.wp_group_size();
        if group * self.wp_group_size() >= self.capacity_blocks {
            return false;
        }
        let current = self.protection.get(&group).copied().unwrap_or(0);
        if current == 3 {
            return true;
        }
        let kind = if !set {
            0
        } else {
            let user_wp = self.ext_csd[EXT_CSD_USER_WP];
            if user_wp & USER_WP_US_PERM_WP_EN != 0 {
                3
            } else if user_wp & USER_WP_US_PWR_WP_EN != 0 {
                2
            } else {
                1
            }
        };
        self.protection.insert(group, kind);
        true
    }

    fn send_write_prot_type(&self, block: u32, out: &mut [u8]) {
        let first = block as u64 / self.wp_group_size();
        let mut bits = 0u64;
        for i in 0..WP_GROUPS_PER_QUERY as u64 {
            let kind = self.protection.get(&(first + i)).copied().unwrap_or(0) as u64;
            bits |= (kind & 0x3) << (2 * i);
        }
        let len = out.len().min(8);
        out[..len].copy_from_slice(&bits.to_be_bytes()[..len]);
    }

    fn sign(&self, frame: &mut RpmbFrame) -> io::Result<()> {
        if let Some(key) = self.rpmb.key {
            frame
                .sign(&RpmbKey::new(key))
                .map_err(|e| io::Error::other(format!("RPMB signing failed: {}", e)))?;
        }
        Ok(())
    }

    fn rpmb_request(&mut self, data: &[u8]) -> io::Result<()> {
        let Some(request) = RpmbFrame::parse_many(data).into_iter().next() else {
            return Ok(());
        };
        let Some(kind) = RpmbRequest::from_u16(request.req_resp) else {
            self.rpmb.pending = None;
            return Ok(());
        };

        let mut response = RpmbFrame::request(kind);
        response.req_resp = kind.response_tag();
        match kind {
            RpmbRequest::WriteKey => {
                response.result = if self.rpmb.key.is_some() {
                    RpmbResult::GENERAL_FAILURE
                } else {
                    self.rpmb.key = Some(request.key_mac);
                    RpmbResult::OK
                };
            }
            RpmbRequest::ReadCounter => {
                response.nonce = request.nonce;
                response.write_counter = self.rpmb.counter;
                response.result = if self.rpmb.key.is_some() {
                    RpmbResult::OK
                } else {
                    RpmbResult::KEY_NOT_PROGRAMMED
                };
                self.sign(&mut response)?;
            }
            RpmbRequest::Write => {
                response.result = self.rpmb_write(&request);
                response.write_counter = self.rpmb.counter;
                response.address = request.address;
                self.sign(&mut response)?;
            }
            RpmbRequest::Read => {
                self.rpmb.pending = Some(RpmbPending::Read {
                    address: request.address,
                    nonce: request.nonce,
                });
                return Ok(());
            }
            // Keeps the result of the preceding write pending.
            RpmbRequest::ReadResult => return Ok(()),
        }
        self.rpmb.pending = Some(RpmbPending::Response(response));
        Ok(())
    }

    fn rpmb_write(&mut self, request: &RpmbFrame) -> u16 {
        let Some(key) = self.rpmb.key else {
            return RpmbResult::KEY_NOT_PROGRAMMED;
        };
        let encoded = request.to_bytes();
        let authentic = RpmbKey::new(key)
            .mac()
            .map(|mut mac| {
                mac.update(RpmbFrame::mac_region(&encoded));
                mac.verify(&request.key_mac)
            })
            .unwrap_or(false);
        if !authentic {
            return RpmbResult::AUTH_FAILURE;
        }
        if request.write_counter != self.rpmb.counter {
            return RpmbResult::COUNTER_FAILURE;
        }
        if request.block_count != 1 || request.address as u32 >= RPMB_BLOCKS {
            return RpmbResult::ADDRESS_FAILURE;
        }
        self.rpmb.blocks.insert(request.address, request.data);
        self.rpmb.counter += 1;
        RpmbResult::OK
    }

    fn rpmb_response(&mut self, out: &mut [u8]) -> io::Result<()> {
        let frames = match self.rpmb.pending.take() {
            Some(RpmbPending::Response(frame)) => vec![frame],
            Some(RpmbPending::Read { address, nonce }) => self.rpmb_read(address, nonce, out.len() / RPMB_FRAME_SIZE)?,
            None => return Ok(()),
        };
        for (chunk, frame) in out.chunks_exact_mut(RPMB_FRAME_SIZE).zip(&frames) {
            chunk.copy_from_slice(&frame.to_bytes());
        }
        Ok(())
    }

    fn rpmb_read(&self, address: u16, nonce: [u8; 16], count: usize) -> io::Result<Vec<RpmbFrame>> {
        let result = match self.rpmb.key {
            None => RpmbResult::KEY_NOT_PROGRAMMED,
            Some(_) if address as usize + count > RPMB_BLOCKS as usize => RpmbResult::ADDRESS_FAILURE,
            Some(_) => RpmbResult::OK,
        };
        let mut frames: Vec<RpmbFrame> = (0..count)
            .map(|i| {
                let block = address.wrapping_add(i as u16);
                let mut frame = RpmbFrame::request(RpmbRequest::Read);
                frame.req_resp = RpmbRequest::Read.response_tag();
                frame.data = self.rpmb.blocks.get(&block).copied().unwrap_or([0; RPMB_DATA_SIZE]);
                frame.nonce = nonce;
                frame.address = address;
                frame.block_count = count as u16;
                frame.result = result;
                frame
            })
            .collect();

        if let Some(key) = self.rpmb.key {
            let mut mac = RpmbKey::new(key)
                .mac()
                .map_err(|e| io::Error::other(format!("RPMB signing failed: {}", e)))?;
            for frame in &frames {
                mac.update(RpmbFrame::mac_region(&frame.to_bytes()));
            }
            let tag = mac.finalize();
            if let Some(last) = frames.last_mut() {
                last.key_mac = tag;
            }
        }
        if self.rpmb.corrupt_reads {
            if let Some(first) = frames.first_mut() {
                first.data[0] ^= 0xFF;
            }
        }
        Ok(frames)
    }
}

impl MmcTransport for MockTransport {
    fn issue(&self, cmd: &mut CommandDescriptor) -> Result<CommandResponse, TransportError> {
        let opcode = cmd.opcode;
        self.device
            .lock()
            .unwrap()
            .execute(cmd)
            .map_err(|source| TransportError::CommandFailed { opcode, source })
    }

    fn issue_batch(&self, batch: &mut CommandBatch) -> Result<Vec<CommandResponse>, TransportError> {
        let len = batch.len();
        if len == 0 || len > MAX_BATCH_COMMANDS {
            return Err(TransportError::InvalidBatch(len));
        }
        let mut device = self.device.lock().unwrap();
        device.batches.push(len);
        let mut responses = Vec::with_capacity(len);
        for cmd in batch.commands_mut() {
            let response = device
                .execute(cmd)
                .map_err(|source| TransportError::BatchFailed { len, source })?;
            responses.push(response);
        }
        Ok(responses)
    }

    fn capacity_blocks(&self) -> Result<u64, TransportError> {
        Ok(self.device.lock().unwrap().capacity_blocks)
    }

    fn device_name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Direction;

    #[test]
    fn test_switch_updates_ext_csd() {
        let mock = MockTransport::new();
        let mut cmd = CommandDescriptor::switch(EXT_CSD_CACHE_CTRL as u8, 1);
        mock.issue(&mut cmd).unwrap();
        assert_eq!(mock.ext_csd_byte(EXT_CSD_CACHE_CTRL), 1);
        assert_eq!(mock.switch_writes(), vec![(EXT_CSD_CACHE_CTRL as u8, 1)]);
    }

    #[test]
    fn test_ext_csd_read_fills_buffer() {
        let mock = MockTransport::new();
        let csd = ExtCsd::read(&mock).unwrap();
        assert_eq!(csd.revision().0, EXT_CSD_REV_V5_0);
        assert_eq!(csd.sector_count() as u64, DEFAULT_CAPACITY_BLOCKS);
        assert!(!mock.command_log()[0].is_mutating());
    }

    #[test]
    fn test_fault_injection() {
        let mock = MockTransport::new();
        mock.fail_opcode(MMC_SEND_STATUS);
        let mut cmd = CommandDescriptor::send_status();
        assert!(matches!(
            mock.issue(&mut cmd),
            Err(TransportError::CommandFailed { opcode: MMC_SEND_STATUS, .. })
        ));

        mock.clear_faults();
        assert!(mock.issue(&mut cmd).is_ok());
    }

    #[test]
    fn test_batch_fails_as_unit() {
        let mock = MockTransport::new();
        mock.fail_switch(EXT_CSD_MODE_OPERATION_CODES as u8);
        let mut batch = CommandBatch::new(vec![
            CommandDescriptor::switch(EXT_CSD_MODE_CONFIG as u8, EXT_CSD_FFU_MODE),
            CommandDescriptor::switch(EXT_CSD_MODE_OPERATION_CODES as u8, EXT_CSD_FFU_INSTALL),
        ]);
        assert!(matches!(
            mock.issue_batch(&mut batch),
            Err(TransportError::BatchFailed { len: 2, .. })
        ));
        assert_eq!(mock.batch_sizes(), vec![2]);
    }

    #[test]
    fn test_write_protect_type_bits() {
        let mock = MockTransport::new();
        mock.set_protection(0, 1);
        mock.set_protection(1, 3);
        let mut cmd = CommandDescriptor::send_write_prot_type(0);
        mock.issue(&mut cmd).unwrap();
        let bits = u64::from_be_bytes(cmd.data[..8].try_into().unwrap());
        assert_eq!(bits & 0xF, 0b1101);
    }

    fn rpmb_round_trip(mock: &MockTransport, request: &RpmbFrame) -> RpmbFrame {
        let mut batch = CommandBatch::new(vec![
            CommandDescriptor::single(MMC_WRITE_MULTIPLE_BLOCK, Direction::Write, 1, 0, Some(request.to_bytes().to_vec())),
            CommandDescriptor::single(MMC_READ_MULTIPLE_BLOCK, Direction::Read, 1, 0, None),
        ]);
        mock.issue_batch(&mut batch).unwrap();
        let reply = batch.into_commands().pop().unwrap();
        RpmbFrame::parse_many(&reply.data).remove(0)
    }

    #[test]
    fn test_rpmb_counter_response_carries_device_mac() {
        let mock = MockTransport::new();
        let key = RpmbKey::new([0x42; RPMB_KEY_SIZE]);
        let mut write_key = RpmbFrame::request(RpmbRequest::WriteKey);
        write_key.key_mac = *key.as_bytes();
        let mut cmd = CommandDescriptor::single(MMC_WRITE_MULTIPLE_BLOCK, Direction::Write, 1, 0, Some(write_key.to_bytes().to_vec()));
        mock.issue(&mut cmd).unwrap();

        let mut request = RpmbFrame::request(RpmbRequest::ReadCounter);
        request.nonce = [7; 16];
        let response = rpmb_round_trip(&mock, &request);

        assert!(response.result().is_ok());
        assert_eq!(response.nonce, [7; 16]);
        let expected = key.sign(RpmbFrame::mac_region(&response.to_bytes())).unwrap();
        assert_eq!(response.key_mac, expected);
    }

    #[test]
    fn test_permanent_group_cannot_be_cleared() {
        let mock = MockTransport::new();
        mock.set_protection(2, 3);
        let mut cmd = CommandDescriptor::write_protect(2 * 1024, false);
        mock.issue(&mut cmd).unwrap();
        assert_eq!(mock.protection(2), 3);
    }
}
