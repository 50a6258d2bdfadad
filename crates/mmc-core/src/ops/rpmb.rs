//! Replay Protected Memory Block transactions.
//!
//! Every request is one 512-byte frame written with CMD25 and answered by
//! one or more frames read back with CMD18, all inside a single atomic
//! batch:
//!
//! ```text
//! write-key / write:  CMD25 (reliable, request) -> CMD25 (result request) -> CMD18 (1 frame)
//! read-counter / read: CMD25 (request) -> CMD18 (N frames)
//! ```
//!
//! Authenticated writes fold a freshly read write counter into the frame
//! and sign the data-onward region. Authenticated reads feed every
//! returned frame into one MAC context and compare against the MAC carried
//! by the last frame.

use std::fmt;

use byteorder::{BigEndian, ByteOrder};
use tracing::{debug, info, instrument, warn};

use crate::auth::{RPMB_MAC_SIZE, RpmbKey};
use crate::error::{MmcError, Result};
use crate::protocol::constants::*;
use crate::protocol::{CommandBatch, CommandDescriptor, Direction};
use crate::transport::MmcTransport;

// ============================================================================
// Frame Layout
// ============================================================================

pub const RPMB_FRAME_SIZE: usize = 512;
pub const RPMB_DATA_SIZE: usize = 256;
pub const RPMB_NONCE_SIZE: usize = 16;

const MAC_OFFSET: usize = 196;
const DATA_OFFSET: usize = MAC_OFFSET + RPMB_MAC_SIZE;
const NONCE_OFFSET: usize = DATA_OFFSET + RPMB_DATA_SIZE;
const COUNTER_OFFSET: usize = NONCE_OFFSET + RPMB_NONCE_SIZE;
const ADDR_OFFSET: usize = COUNTER_OFFSET + 4;
const BLOCK_COUNT_OFFSET: usize = ADDR_OFFSET + 2;
const RESULT_OFFSET: usize = BLOCK_COUNT_OFFSET + 2;
const REQ_RESP_OFFSET: usize = RESULT_OFFSET + 2;

/// Bytes covered by the authentication code: data field to end of frame.
pub const RPMB_MAC_REGION: usize = RPMB_FRAME_SIZE - DATA_OFFSET;

/// Request type tag of an RPMB frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum RpmbRequest {
    WriteKey = 0x0001,
    ReadCounter = 0x0002,
    Write = 0x0003,
    Read = 0x0004,
    /// Result register read, only used inside write batches.
    ReadResult = 0x0005,
}

impl RpmbRequest {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0001 => Some(Self::WriteKey),
            0x0002 => Some(Self::ReadCounter),
            0x0003 => Some(Self::Write),
            0x0004 => Some(Self::Read),
            0x0005 => Some(Self::ReadResult),
            _ => None,
        }
    }

    /// Tag the device puts on the matching response frame.
    pub fn response_tag(self) -> u16 {
        0x0100 | self as u16
    }
}

/// Decoded RPMB result field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpmbResult(pub u16);

impl RpmbResult {
    pub const OK: u16 = 0x0000;
    pub const GENERAL_FAILURE: u16 = 0x0001;
    pub const AUTH_FAILURE: u16 = 0x0002;
    pub const COUNTER_FAILURE: u16 = 0x0003;
    pub const ADDRESS_FAILURE: u16 = 0x0004;
    pub const WRITE_FAILURE: u16 = 0x0005;
    pub const READ_FAILURE: u16 = 0x0006;
    pub const KEY_NOT_PROGRAMMED: u16 = 0x0007;
    pub const COUNTER_EXPIRED: u16 = 0x0080;

    pub fn is_ok(self) -> bool {
        self.0 == Self::OK
    }

    pub fn code(self) -> u16 {
        self.0 & 0x7F
    }

    pub fn counter_expired(self) -> bool {
        self.0 & Self::COUNTER_EXPIRED != 0
    }

    pub fn description(self) -> &'static str {
        match self.code() {
            Self::OK => "operation OK",
            Self::GENERAL_FAILURE => "general failure",
            Self::AUTH_FAILURE => "authentication failure",
            Self::COUNTER_FAILURE => "counter failure",
            Self::ADDRESS_FAILURE => "address failure",
            Self::WRITE_FAILURE => "write failure",
            Self::READ_FAILURE => "read failure",
            Self::KEY_NOT_PROGRAMMED => "authentication key not yet programmed",
            _ => "unknown result",
        }
    }
}

impl fmt::Display for RpmbResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "retcode 0x{:04x} ({}", self.0, self.description())?;
        if self.counter_expired() {
            write!(f, ", write counter expired")?;
        }
        write!(f, ")")
    }
}

/// One RPMB data frame.
#[derive(Clone, PartialEq, Eq)]
pub struct RpmbFrame {
    /// Authentication key (write-key requests) or MAC.
    pub key_mac: [u8; RPMB_MAC_SIZE],
    pub data: [u8; RPMB_DATA_SIZE],
    pub nonce: [u8; RPMB_NONCE_SIZE],
    pub write_counter: u32,
    pub address: u16,
    pub block_count: u16,
    pub result: u16,
    pub req_resp: u16,
}

impl Default for RpmbFrame {
    fn default() -> Self {
        Self {
            key_mac: [0; RPMB_MAC_SIZE],
            data: [0; RPMB_DATA_SIZE],
            nonce: [0; RPMB_NONCE_SIZE],
            write_counter: 0,
            address: 0,
            block_count: 0,
            result: 0,
            req_resp: 0,
        }
    }
}

impl RpmbFrame {
    pub fn request(kind: RpmbRequest) -> Self {
        Self {
            req_resp: kind as u16,
            ..Self::default()
        }
    }

    /// Encode to the 512-byte wire form. Multi-byte fields are big-endian.
    pub fn to_bytes(&self) -> [u8; RPMB_FRAME_SIZE] {
        let mut buf = [0u8; RPMB_FRAME_SIZE];
        buf[MAC_OFFSET..DATA_OFFSET].copy_from_slice(&self.key_mac);
        buf[DATA_OFFSET..NONCE_OFFSET].copy_from_slice(&self.data);
        buf[NONCE_OFFSET..COUNTER_OFFSET].copy_from_slice(&self.nonce);
        BigEndian::write_u32(&mut buf[COUNTER_OFFSET..ADDR_OFFSET], self.write_counter);
        BigEndian::write_u16(&mut buf[ADDR_OFFSET..BLOCK_COUNT_OFFSET], self.address);
        BigEndian::write_u16(&mut buf[BLOCK_COUNT_OFFSET..RESULT_OFFSET], self.block_count);
        BigEndian::write_u16(&mut buf[RESULT_OFFSET..REQ_RESP_OFFSET], self.result);
        BigEndian::write_u16(&mut buf[REQ_RESP_OFFSET..], self.req_resp);
        buf
    }

    pub fn from_bytes(buf: &[u8; RPMB_FRAME_SIZE]) -> Self {
        let mut frame = Self::default();
        frame.key_mac.copy_from_slice(&buf[MAC_OFFSET..DATA_OFFSET]);
        frame.data.copy_from_slice(&buf[DATA_OFFSET..NONCE_OFFSET]);
        frame.nonce.copy_from_slice(&buf[NONCE_OFFSET..COUNTER_OFFSET]);
        frame.write_counter = BigEndian::read_u32(&buf[COUNTER_OFFSET..ADDR_OFFSET]);
        frame.address = BigEndian::read_u16(&buf[ADDR_OFFSET..BLOCK_COUNT_OFFSET]);
        frame.block_count = BigEndian::read_u16(&buf[BLOCK_COUNT_OFFSET..RESULT_OFFSET]);
        frame.result = BigEndian::read_u16(&buf[RESULT_OFFSET..REQ_RESP_OFFSET]);
        frame.req_resp = BigEndian::read_u16(&buf[REQ_RESP_OFFSET..]);
        frame
    }

    /// Split a buffer of whole frames.
    pub fn parse_many(buf: &[u8]) -> Vec<Self> {
        buf.chunks_exact(RPMB_FRAME_SIZE)
            .filter_map(|chunk| <&[u8; RPMB_FRAME_SIZE]>::try_from(chunk).ok())
            .map(Self::from_bytes)
            .collect()
    }

    /// The authenticated region of an encoded frame.
    pub fn mac_region(buf: &[u8; RPMB_FRAME_SIZE]) -> &[u8] {
        &buf[DATA_OFFSET..]
    }

    /// Compute and store the MAC over the data-onward region.
    pub fn sign(&mut self, key: &RpmbKey) -> Result<()> {
        let encoded = self.to_bytes();
        self.key_mac = key.sign(Self::mac_region(&encoded))?;
        Ok(())
    }

    pub fn result(&self) -> RpmbResult {
        RpmbResult(self.result)
    }
}

impl fmt::Debug for RpmbFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpmbFrame")
            .field("req_resp", &format_args!("0x{:04X}", self.req_resp))
            .field("write_counter", &self.write_counter)
            .field("address", &self.address)
            .field("block_count", &self.block_count)
            .field("result", &format_args!("0x{:04X}", self.result))
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Transactions
// ============================================================================

fn frame_command(opcode: u8, direction: Direction, blocks: u32, data: Option<Vec<u8>>) -> CommandDescriptor {
    CommandDescriptor::single(opcode, direction, blocks, 0, data)
}

/// Run one request and return the response frames.
///
/// `out_count` must be 1 for everything but [`RpmbRequest::Read`].
pub fn execute<T: MmcTransport + ?Sized>(
    transport: &T,
    request: &RpmbFrame,
    out_count: u16,
) -> Result<Vec<RpmbFrame>> {
    let kind = RpmbRequest::from_u16(request.req_resp)
        .ok_or_else(|| MmcError::precondition(format!("Unknown RPMB request 0x{:04x}", request.req_resp)))?;
    if out_count == 0 {
        return Err(MmcError::precondition("RPMB block count must be non-zero"));
    }
    if kind != RpmbRequest::Read && out_count != 1 {
        return Err(MmcError::precondition("Only RPMB reads return more than one frame"));
    }

    let request_bytes = request.to_bytes().to_vec();
    let commands = match kind {
        RpmbRequest::WriteKey | RpmbRequest::Write => {
            let status_request = RpmbFrame::request(RpmbRequest::ReadResult).to_bytes().to_vec();
            vec![
                frame_command(MMC_WRITE_MULTIPLE_BLOCK, Direction::Write, 1, Some(request_bytes)).reliable(),
                frame_command(MMC_WRITE_MULTIPLE_BLOCK, Direction::Write, 1, Some(status_request)),
                frame_command(MMC_READ_MULTIPLE_BLOCK, Direction::Read, 1, None),
            ]
        }
        RpmbRequest::ReadCounter | RpmbRequest::Read => vec![
            frame_command(MMC_WRITE_MULTIPLE_BLOCK, Direction::Write, 1, Some(request_bytes)),
            frame_command(MMC_READ_MULTIPLE_BLOCK, Direction::Read, out_count as u32, None),
        ],
        RpmbRequest::ReadResult => {
            return Err(MmcError::precondition("The result request is only sent inside a write"));
        }
    };

    debug!(request = ?kind, frames = out_count, "Issuing RPMB request");
    let mut batch = CommandBatch::new(commands);
    transport.issue_batch(&mut batch)?;

    let response = batch
        .into_commands()
        .pop()
        .map(|cmd| RpmbFrame::parse_many(&cmd.data))
        .unwrap_or_default();
    if response.len() != out_count as usize {
        return Err(MmcError::rejected(
            "RPMB request",
            format!("expected {} response frame(s), got {}", out_count, response.len()),
        ));
    }
    let tag = response.last().map(|frame| frame.req_resp).unwrap_or_default();
    if tag != kind.response_tag() {
        warn!(
            expected = %format!("0x{:04X}", kind.response_tag()),
            actual = %format!("0x{:04X}", tag),
            "Unexpected RPMB response type"
        );
    }
    Ok(response)
}

fn check_result(operation: &'static str, frame: &RpmbFrame) -> Result<()> {
    let result = frame.result();
    if !result.is_ok() {
        return Err(MmcError::rejected(operation, result.to_string()));
    }
    Ok(())
}

/// Program the one-time authentication key.
#[instrument(skip_all, fields(device = transport.device_name()))]
pub fn write_key<T: MmcTransport + ?Sized>(transport: &T, key: &RpmbKey) -> Result<()> {
    let mut request = RpmbFrame::request(RpmbRequest::WriteKey);
    request.key_mac = *key.as_bytes();
    let response = execute(transport, &request, 1)?;
    check_result("RPMB write-key", &response[0])?;
    info!("RPMB authentication key programmed");
    Ok(())
}

/// Current value of the write counter.
#[instrument(skip_all, fields(device = transport.device_name()))]
pub fn read_counter<T: MmcTransport + ?Sized>(transport: &T) -> Result<u32> {
    let request = RpmbFrame::request(RpmbRequest::ReadCounter);
    let response = execute(transport, &request, 1)?;
    check_result("RPMB read-counter", &response[0])?;
    debug!(counter = response[0].write_counter, "Read RPMB write counter");
    Ok(response[0].write_counter)
}

/// Authenticated write of one 256-byte block. Returns the counter value the
/// device reported after the write.
#[instrument(skip(transport, data, key), fields(device = transport.device_name()))]
pub fn write_block<T: MmcTransport + ?Sized>(
    transport: &T,
    address: u16,
    data: &[u8; RPMB_DATA_SIZE],
    key: &RpmbKey,
) -> Result<u32> {
    let counter = read_counter(transport)?;

    let mut request = RpmbFrame::request(RpmbRequest::Write);
    request.write_counter = counter;
    request.address = address;
    request.block_count = 1;
    request.data = *data;
    request.sign(key)?;

    let response = execute(transport, &request, 1)?;
    check_result("RPMB write-block", &response[0])?;
    info!(address, counter = response[0].write_counter, "RPMB block written");
    Ok(response[0].write_counter)
}

/// Read `count` blocks starting at `address`, returning the concatenated
/// 256-byte payloads.
///
/// With a key, the frames are authenticated as one unit. On mismatch the
/// data is still returned inside [`MmcError::IntegrityMismatch`].
#[instrument(skip(transport, key), fields(device = transport.device_name(), verify = key.is_some()))]
pub fn read_blocks<T: MmcTransport + ?Sized>(
    transport: &T,
    address: u16,
    count: u16,
    key: Option<&RpmbKey>,
) -> Result<Vec<u8>> {
    // The block count travels in CMD23/CMD18 only; the frame field stays 0.
    let mut request = RpmbFrame::request(RpmbRequest::Read);
    request.address = address;

    let frames = execute(transport, &request, count)?;
    if let Some(last) = frames.last() {
        check_result("RPMB read-block", last)?;
    }

    let data: Vec<u8> = frames.iter().flat_map(|frame| frame.data).collect();

    if let Some(key) = key {
        let mut mac = key.mac()?;
        for frame in &frames {
            mac.update(RpmbFrame::mac_region(&frame.to_bytes()));
        }
        let expected = frames.last().map(|frame| frame.key_mac).unwrap_or_default();
        if !mac.verify(&expected) {
            warn!(address, count, "RPMB MAC mismatch");
            return Err(MmcError::IntegrityMismatch { data });
        }
        debug!("RPMB read authenticated");
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    fn key() -> RpmbKey {
        RpmbKey::new([0x5A; 32])
    }

    #[test]
    fn test_frame_layout_is_big_endian() {
        let mut frame = RpmbFrame::request(RpmbRequest::Write);
        frame.write_counter = 0x0102_0304;
        frame.address = 0x0A0B;
        frame.block_count = 1;
        let buf = frame.to_bytes();
        assert_eq!(&buf[500..504], &[1, 2, 3, 4]);
        assert_eq!(&buf[504..506], &[0x0A, 0x0B]);
        assert_eq!(&buf[506..508], &[0, 1]);
        assert_eq!(&buf[510..512], &[0, 3]);
        assert!(buf[..196].iter().all(|&b| b == 0));
        assert_eq!(RpmbFrame::from_bytes(&buf), frame);
        assert_eq!(RPMB_MAC_REGION, 284);
    }

    #[test]
    fn test_result_display() {
        let result = RpmbResult(0x0083);
        assert_eq!(result.code(), 3);
        assert!(result.counter_expired());
        assert_eq!(result.to_string(), "retcode 0x0083 (counter failure, write counter expired)");
    }

    #[test]
    fn test_write_batch_shape() {
        let mock = MockTransport::new();
        write_key(&mock, &key()).unwrap();

        let log = mock.command_log();
        assert_eq!(mock.batch_sizes(), vec![3]);
        assert_eq!(log[0].opcode, MMC_WRITE_MULTIPLE_BLOCK);
        assert_eq!(log[0].write_flag, (1 << 31) | 1);
        assert_eq!(log[1].opcode, MMC_WRITE_MULTIPLE_BLOCK);
        assert_eq!(log[1].write_flag, 1);
        assert_eq!(log[2].opcode, MMC_READ_MULTIPLE_BLOCK);
        assert!(log.iter().all(|c| c.blksz == 512 && c.arg == 0));
        assert!(log.iter().all(|c| c.flags == MMC_RSP_SPI_R1 | MMC_RSP_R1 | MMC_CMD_ADTC));
    }

    #[test]
    fn test_counter_advances_after_write() {
        let mock = MockTransport::new();
        write_key(&mock, &key()).unwrap();

        let before = read_counter(&mock).unwrap();
        write_block(&mock, 3, &[0xEE; RPMB_DATA_SIZE], &key()).unwrap();
        let after = read_counter(&mock).unwrap();
        assert_eq!(after, before + 1);
    }

    #[test]
    fn test_read_counter_without_key_is_rejected() {
        let mock = MockTransport::new();
        let err = read_counter(&mock).unwrap_err();
        assert!(matches!(err, MmcError::DeviceRejected { .. }));
        assert!(err.to_string().contains("key not yet programmed"));
    }

    #[test]
    fn test_write_with_wrong_key_fails_authentication() {
        let mock = MockTransport::new();
        write_key(&mock, &key()).unwrap();
        let err = write_block(&mock, 0, &[1; RPMB_DATA_SIZE], &RpmbKey::new([0; 32])).unwrap_err();
        assert!(err.to_string().contains("authentication failure"));
        assert_eq!(read_counter(&mock).unwrap(), 0);
    }

    #[test]
    fn test_authenticated_multi_block_read() {
        let mock = MockTransport::new();
        write_key(&mock, &key()).unwrap();
        write_block(&mock, 4, &[0x11; RPMB_DATA_SIZE], &key()).unwrap();
        write_block(&mock, 5, &[0x22; RPMB_DATA_SIZE], &key()).unwrap();

        let data = read_blocks(&mock, 4, 2, Some(&key())).unwrap();
        assert_eq!(data.len(), 2 * RPMB_DATA_SIZE);
        assert!(data[..256].iter().all(|&b| b == 0x11));
        assert!(data[256..].iter().all(|&b| b == 0x22));

        // Request frame keeps block_count at zero.
        let request = mock
            .command_log()
            .iter()
            .rev()
            .find(|c| c.opcode == MMC_WRITE_MULTIPLE_BLOCK)
            .map(|c| RpmbFrame::parse_many(&c.data))
            .unwrap();
        assert_eq!(request[0].block_count, 0);
        assert_eq!(request[0].req_resp, RpmbRequest::Read as u16);
    }

    #[test]
    fn test_corrupted_read_is_integrity_mismatch() {
        let mock = MockTransport::new();
        write_key(&mock, &key()).unwrap();
        write_block(&mock, 0, &[0x33; RPMB_DATA_SIZE], &key()).unwrap();
        mock.corrupt_rpmb_reads(true);

        match read_blocks(&mock, 0, 3, Some(&key())) {
            Err(MmcError::IntegrityMismatch { data }) => assert_eq!(data.len(), 3 * RPMB_DATA_SIZE),
            other => panic!("expected integrity mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_read_without_key_skips_verification() {
        let mock = MockTransport::new();
        write_key(&mock, &key()).unwrap();
        mock.corrupt_rpmb_reads(true);
        assert!(read_blocks(&mock, 0, 1, None).is_ok());
    }

    #[test]
    fn test_zero_block_read_is_rejected_before_io() {
        let mock = MockTransport::new();
        assert!(matches!(read_blocks(&mock, 0, 0, None), Err(MmcError::Precondition(_))));
        assert!(mock.command_log().is_empty());
    }
}
