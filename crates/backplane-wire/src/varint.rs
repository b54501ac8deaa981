// Variable-length integer primitives shared by every frame kind.
use bytes::{Buf, BufMut, BytesMut};

use crate::{Result, WireError};

/// A `u32` fits in at most five 7-bit groups.
const MAX_VARINT_BYTES: u32 = 5;

/// Write a non-negative 32-bit integer as 1-5 bytes, 7 payload bits per byte,
/// little-endian groups, bit 7 set on every byte except the last.
pub fn put_varint(buf: &mut BytesMut, mut value: u32) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.put_u8(byte);
            return;
        }
        buf.put_u8(byte | 0x80);
    }
}

pub fn get_varint(buf: &mut impl Buf) -> Result<u32> {
    let mut value = 0u32;
    for index in 0..MAX_VARINT_BYTES {
        if !buf.has_remaining() {
            return Err(WireError::Malformed("truncated varint"));
        }
        let byte = buf.get_u8();
        value |= u32::from(byte & 0x7f) << (7 * index);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(WireError::Malformed("varint longer than 5 bytes"))
}

/// Write a varint byte length followed by the UTF-8 bytes, no BOM.
pub fn put_string(buf: &mut BytesMut, value: &str) {
    put_varint(buf, value.len() as u32);
    buf.put_slice(value.as_bytes());
}

pub fn get_string(buf: &mut impl Buf) -> Result<String> {
    let length = get_varint(buf)? as usize;
    if buf.remaining() < length {
        return Err(WireError::Malformed("string length past end of frame"));
    }
    let raw = buf.copy_to_bytes(length);
    String::from_utf8(raw.to_vec()).map_err(|_| WireError::Malformed("string is not valid UTF-8"))
}
