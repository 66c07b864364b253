//! Common Utilities
//!
//! Bit packing and CRC helpers used by the reference channel kernels

use bytes::{Bytes, BytesMut, BufMut};
use tracing::trace;

/// Calculate CRC-24A for 5G NR transport blocks
pub fn crc24(data: &[u8]) -> u32 {
    const CRC24_POLY: u32 = 0x1864CFB;
    let mut crc: u32 = 0;

    for byte in data {
        crc ^= (*byte as u32) << 16;
        for _ in 0..8 {
            if crc & 0x800000 != 0 {
                crc = (crc << 1) ^ CRC24_POLY;
            } else {
                crc <<= 1;
            }
        }
    }

    crc & 0xFFFFFF
}

/// Append a CRC-24 to a payload, most significant byte first
pub fn attach_crc24(payload: &[u8]) -> Bytes {
    let crc = crc24(payload);
    let mut out = BytesMut::with_capacity(payload.len() + 3);
    out.put_slice(payload);
    out.put_u8((crc >> 16) as u8);
    out.put_u8((crc >> 8) as u8);
    out.put_u8(crc as u8);
    out.freeze()
}

/// Check a payload produced by [`attach_crc24`].
///
/// Returns the payload without its CRC when the check passes.
pub fn check_crc24(data: &[u8]) -> Option<&[u8]> {
    if data.len() < 3 {
        return None;
    }
    let (payload, tail) = data.split_at(data.len() - 3);
    let received = ((tail[0] as u32) << 16) | ((tail[1] as u32) << 8) | tail[2] as u32;
    let computed = crc24(payload);

    trace!("CRC-24 check: received={:06x} computed={:06x}", received, computed);

    if received == computed {
        Some(payload)
    } else {
        None
    }
}

/// Pack bits into bytes (MSB first)
pub fn pack_bits(bits: &[bool]) -> Bytes {
    let mut bytes = BytesMut::with_capacity((bits.len() + 7) / 8);

    for chunk in bits.chunks(8) {
        let mut byte = 0u8;
        for (i, &bit) in chunk.iter().enumerate() {
            if bit {
                byte |= 1 << (7 - i);
            }
        }
        bytes.put_u8(byte);
    }

    bytes.freeze()
}

/// Unpack bytes into bits (MSB first)
pub fn unpack_bits(bytes: &[u8]) -> Vec<bool> {
    let mut bits = Vec::with_capacity(bytes.len() * 8);

    for &byte in bytes {
        for i in 0..8 {
            bits.push((byte & (1 << (7 - i))) != 0);
        }
    }

    bits
}

/// Time utilities for slot/frame calculations
pub mod time {
    use crate::types::SubcarrierSpacing;

    /// Slot duration in microseconds
    pub fn slot_duration_us(scs: SubcarrierSpacing) -> u32 {
        1000 >> scs.numerology()
    }
}
