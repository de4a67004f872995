//! Unsigned LEB128 varints.

use bytes::BufMut;

use crate::error::{ProtocolError, Result};

/// Longest encoding of a u64.
pub const MAX_VARINT_LEN: usize = 10;

pub fn put_varint(mut value: u64, dst: &mut impl BufMut) {
    while value >= 0x80 {
        dst.put_u8((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    dst.put_u8(value as u8);
}

/// Read a varint from the front of `src`, advancing it.
///
/// `field` names what is being read for the truncation error.
pub fn get_varint(src: &mut &[u8], field: &'static str) -> Result<u64> {
    let mut value = 0u64;
    for (i, byte) in src.iter().copied().enumerate().take(MAX_VARINT_LEN) {
        let chunk = u64::from(byte & 0x7f);
        if i == MAX_VARINT_LEN - 1 && chunk > 1 {
            return Err(ProtocolError::VarintOverflow);
        }
        value |= chunk << (7 * i);
        if byte & 0x80 == 0 {
            *src = &src[i + 1..];
            return Ok(value);
        }
    }
    if src.len() >= MAX_VARINT_LEN {
        Err(ProtocolError::VarintOverflow)
    } else {
        Err(ProtocolError::Truncated(field))
    }
}

pub fn varint_len(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.max(1).div_ceil(7)
}
