//! Wire frame serialization/deserialization.
//!
//! Every message on the wire is a 4-byte magic number, a 16-byte
//! little-endian header, `data_len` payload bytes, and a 16-bit CRC. The
//! header carries the payload length twice (once inverted) so corrupt
//! lengths can be rejected before the CRC is checked.

use deku::prelude::*;
use log::debug;
use thiserror::Error;

use crate::crc::crc16;

pub const MAGIC: [u8; 4] = [0x12, 0x34, 0x56, 0x79];
pub const MAGIC_LEN: usize = 4;
pub const HEADER_LEN: usize = 16;
pub const CHECKSUM_LEN: usize = 2;

/// Address the cloud-side master uses for itself.
pub const MASTER_ADDR: u32 = 0xffff_fffe;
/// Source address carried by encrypted envelope frames.
pub const ENVELOPE_ADDR: u32 = 0xffff_fffd;
pub const BROADCAST_ADDR: u32 = 0xffff_ffff;

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct FrameHeader {
    pub data_len: u16,
    pub data_len_inv: u16,
    pub seq: u16,
    pub from_addr: u32,
    pub to_addr: u32,
    pub function: u16,
}

/// A validated frame, stripped of magic, header, and checksum.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub seq: u16,
    pub from_addr: u32,
    pub to_addr: u32,
    pub function: u16,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum FrameError {
    #[error("frame too short to hold a header and checksum ({0} bytes)")]
    TooShort(usize),
    #[error("data length {data_len:#06x} does not match inverse length {data_len_inv:#06x}")]
    LengthMismatch { data_len: u16, data_len_inv: u16 },
    #[error("data length {data_len} overruns frame of {frame_len} bytes")]
    LengthOverrun { data_len: u16, frame_len: usize },
    #[error("invalid checksum (expected {expected:#06x}, got {actual:#06x})")]
    InvalidChecksum { expected: u16, actual: u16 },
    #[error("failed to parse frame header: {0}")]
    HeaderError(#[from] DekuError),
}

/// The byte sequence the CRC is computed over: the addressing header
/// fields serialized big-endian, followed by the payload.
pub fn checksum_input(seq: u16, from_addr: u32, to_addr: u32, function: u16, data: &[u8]) -> Vec<u8> {
    let mut input = Vec::with_capacity(12 + data.len());
    input.extend(seq.to_be_bytes());
    input.extend(from_addr.to_be_bytes());
    input.extend(to_addr.to_be_bytes());
    input.extend(function.to_be_bytes());
    input.extend(data);
    input
}

/// Parse and validate a frame (without its leading magic). Trailing bytes
/// beyond the checksum are discarded; passive-mode reads routinely pick up
/// line noise between the checksum and the next magic number.
pub fn parse_frame(msg: &[u8]) -> Result<Frame, FrameError> {
    if msg.len() < HEADER_LEN + CHECKSUM_LEN {
        return Err(FrameError::TooShort(msg.len()));
    }
    let (_, header) = FrameHeader::from_bytes((&msg[..HEADER_LEN], 0))?;
    log_header(&header);
    if header.data_len != !header.data_len_inv {
        return Err(FrameError::LengthMismatch {
            data_len: header.data_len,
            data_len_inv: header.data_len_inv,
        });
    }
    let data_len = header.data_len as usize;
    if HEADER_LEN + data_len + CHECKSUM_LEN > msg.len() {
        return Err(FrameError::LengthOverrun {
            data_len: header.data_len,
            frame_len: msg.len(),
        });
    }
    let data = &msg[HEADER_LEN..HEADER_LEN + data_len];
    let extra = msg.len() - (HEADER_LEN + data_len + CHECKSUM_LEN);
    if extra != 0 {
        debug!("discarding {extra} extra bytes");
        dump_data(&msg[msg.len() - extra..]);
    }
    let checksum = u16::from_le_bytes([
        msg[HEADER_LEN + data_len],
        msg[HEADER_LEN + data_len + 1],
    ]);
    let calculated = crc16(&checksum_input(
        header.seq,
        header.from_addr,
        header.to_addr,
        header.function,
        data,
    ));
    if calculated != checksum {
        return Err(FrameError::InvalidChecksum {
            expected: checksum,
            actual: calculated,
        });
    }
    Ok(Frame {
        seq: header.seq,
        from_addr: header.from_addr,
        to_addr: header.to_addr,
        function: header.function,
        data: data.to_vec(),
    })
}

/// Serialize a frame: header, payload, and checksum, without the magic
/// number (the sink prepends it).
pub fn format_frame(seq: u16, from_addr: u32, to_addr: u32, function: u16, data: &[u8]) -> Vec<u8> {
    let header = FrameHeader {
        data_len: data.len() as u16,
        data_len_inv: !(data.len() as u16),
        seq,
        from_addr,
        to_addr,
        function,
    };
    log_header(&header);
    let mut msg = header.to_bytes().expect("failed to serialize frame header");
    msg.extend(data);
    let checksum = crc16(&checksum_input(seq, from_addr, to_addr, function, data));
    msg.extend(checksum.to_le_bytes());
    msg
}

fn log_header(header: &FrameHeader) {
    debug!("dataLen:    {:04x}", header.data_len);
    debug!("dataLenInv: {:04x}", header.data_len_inv);
    debug!("sequence:   {:04x}", header.seq);
    debug!("source:     {:08x}", header.from_addr);
    debug!("dest:       {:08x}", header.to_addr);
    debug!("function:   {:04x}", header.function);
}

/// Hex dump a buffer to the log, 16 bytes per line.
pub fn dump_data(data: &[u8]) {
    for line in data.chunks(16) {
        debug!("data:       {}", hex::encode(line));
    }
}
