//! Low-level MQTT field encodings.
//!
//! # Remaining Length
//!
//! ```text
//! [1..=4 bytes: 7 value bits each, least significant group first]
//! bit 7 of each byte = continuation flag
//! ```
//!
//! # MQTT string
//!
//! ```text
//! [2 bytes BE: len][len bytes: UTF-8]
//! ```

use std::fmt::Write;

use crate::constants::{MAX_REMAINING_LENGTH, MAX_REMAINING_LENGTH_BYTES, MAX_STRING_LEN};
use crate::error::CodecError;

/// Encodes a Remaining Length value (1 to 4 bytes).
pub fn encode_remaining_length(len: usize) -> Result<Vec<u8>, CodecError> {
    if len > MAX_REMAINING_LENGTH {
        return Err(CodecError::InvalidInput(format!(
            "remaining length {len} exceeds {MAX_REMAINING_LENGTH}"
        )));
    }

    let mut value = len;
    let mut out = Vec::with_capacity(MAX_REMAINING_LENGTH_BYTES);
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
    Ok(out)
}

/// Decodes a Remaining Length from the start of `buf`.
///
/// Returns the value and the number of bytes consumed.
pub fn decode_remaining_length(buf: &[u8]) -> Result<(usize, usize), CodecError> {
    let mut value: usize = 0;
    let mut multiplier: usize = 1;

    for (i, &byte) in buf.iter().take(MAX_REMAINING_LENGTH_BYTES).enumerate() {
        value += usize::from(byte & 0x7F) * multiplier;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
        multiplier *= 128;
    }

    if buf.len() >= MAX_REMAINING_LENGTH_BYTES {
        Err(CodecError::Malformed(format!(
            "remaining length continues past {MAX_REMAINING_LENGTH_BYTES} bytes"
        )))
    } else {
        Err(CodecError::Incomplete)
    }
}

/// Appends a length-prefixed MQTT string to `buf`.
///
/// Nothing is written when the string is too long.
pub fn write_mqtt_string(buf: &mut Vec<u8>, s: &str) -> Result<(), CodecError> {
    let bytes = s.as_bytes();
    if bytes.len() > MAX_STRING_LEN {
        return Err(CodecError::InvalidInput(format!(
            "string too long: {} bytes (max {MAX_STRING_LEN})",
            bytes.len()
        )));
    }
    buf.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    buf.extend_from_slice(bytes);
    Ok(())
}

/// Reads a length-prefixed MQTT string from the start of `buf`.
///
/// Returns the string and the number of bytes consumed (prefix included).
pub fn read_mqtt_string(buf: &[u8]) -> Result<(String, usize), CodecError> {
    let prefix: [u8; 2] = buf
        .get(..2)
        .and_then(|p| p.try_into().ok())
        .ok_or(CodecError::Incomplete)?;
    let len = usize::from(u16::from_be_bytes(prefix));
    let raw = buf.get(2..2 + len).ok_or(CodecError::Incomplete)?;
    let s = std::str::from_utf8(raw)
        .map_err(|e| CodecError::Malformed(format!("invalid UTF-8 string: {e}")))?;
    Ok((s.to_owned(), 2 + len))
}

/// Formats bytes as upper-case, space separated hex (`10 1A 00 04`).
pub fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, byte) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{byte:02X}");
    }
    out
}
