//! Frame checksum calculation.
//!
//! The inverter protocol uses CRC-16 with the reflected 0x8005 polynomial
//! and a nonstandard initial value of 0x5a5a. The checksum covers the
//! header fields serialized big-endian followed by the payload bytes (see
//! [`crate::frame::checksum_input`]).

use crc::{Algorithm, Crc};

// width=16 poly=0x8005 init=0x5a5a refin=true refout=true xorout=0x0000
pub const CRC_FRAME_ALG: Algorithm<u16> = Algorithm {
    width: 16,
    poly: 0x8005,
    init: 0x5a5a,
    refin: true,
    refout: true,
    xorout: 0x0000,
    check: 0x5b3a,
    residue: 0x0000,
};

pub const CRC_FRAME: Crc<u16> = Crc::<u16>::new(&CRC_FRAME_ALG);

pub fn crc16(data: &[u8]) -> u16 {
    CRC_FRAME.checksum(data)
}
