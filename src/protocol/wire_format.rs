//! Wire format encoding and decoding.
//!
//! Every frame is an 8-byte ASCII length prefix followed by the payload:
//! ```text
//! ┌──────────────────────┬──────────────────────────┐
//! │ Length               │ Payload                  │
//! │ 8 bytes, decimal,    │ `Length` bytes of UTF-8  │
//! │ space-padded, right- │ JSON text                │
//! │ justified, no sign   │                          │
//! └──────────────────────┴──────────────────────────┘
//! ```
//!
//! Example: `"      20{\"example\":\"string\"}"`.

use crate::error::{GroundlinkError, Result};

/// Length prefix size in bytes (fixed, exactly 8).
pub const LENGTH_PREFIX_SIZE: usize = 8;

/// Largest payload representable by an 8-digit decimal prefix.
pub const MAX_PAYLOAD_LEN: usize = 99_999_999;

/// Encode a payload length as a right-justified, space-padded 8 byte prefix.
///
/// # Example
///
/// ```
/// use groundlink::protocol::encode_length_prefix;
///
/// assert_eq!(&encode_length_prefix(20).unwrap(), b"      20");
/// ```
///
/// # Errors
///
/// Returns `MessageTooLong` if `len` needs more than 8 digits. The check
/// happens before anything is built, so an oversized frame never exists.
pub fn encode_length_prefix(len: usize) -> Result<[u8; LENGTH_PREFIX_SIZE]> {
    if len > MAX_PAYLOAD_LEN {
        return Err(GroundlinkError::MessageTooLong(len));
    }

    let text = format!("{:>width$}", len, width = LENGTH_PREFIX_SIZE);
    let mut buf = [b' '; LENGTH_PREFIX_SIZE];
    buf.copy_from_slice(text.as_bytes());
    Ok(buf)
}

/// Parse an 8 byte length prefix.
///
/// Leading whitespace is skipped and the leading run of decimal digits is
/// read; anything after the digits is ignored. Zero-padded prefixes
/// (`"00000020"`) parse the same as space-padded ones.
///
/// A result of `0` means "no frame queued": the demultiplexer never emits a
/// zero-length payload.
///
/// # Errors
///
/// Returns `InvalidLengthPrefix` if the field holds no digits at all.
pub fn parse_length_prefix(prefix: &[u8]) -> Result<usize> {
    let field = &prefix[..prefix.len().min(LENGTH_PREFIX_SIZE)];

    let digits: Vec<u8> = field
        .iter()
        .copied()
        .skip_while(|b| b.is_ascii_whitespace())
        .take_while(|b| b.is_ascii_digit())
        .collect();

    if digits.is_empty() {
        return Err(GroundlinkError::InvalidLengthPrefix(
            String::from_utf8_lossy(field).into_owned(),
        ));
    }

    // At most 8 ASCII digits, always fits in usize.
    Ok(digits
        .iter()
        .fold(0usize, |acc, d| acc * 10 + usize::from(d - b'0')))
}
