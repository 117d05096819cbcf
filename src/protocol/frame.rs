//! Frame building.
//!
//! A frame is the length prefix followed by the payload bytes. Frames are
//! built once into a shared `Bytes` so that a broadcast can hand the same
//! buffer to every connection's writer.
//!
//! # Example
//!
//! ```
//! use groundlink::protocol::{build_frame, LENGTH_PREFIX_SIZE};
//!
//! let frame = build_frame(b"null").unwrap();
//! assert_eq!(&frame[..], b"       4null");
//! assert_eq!(frame.len(), LENGTH_PREFIX_SIZE + 4);
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use super::wire_format::{encode_length_prefix, LENGTH_PREFIX_SIZE};
use crate::error::Result;

/// Build a complete frame as a single contiguous buffer.
///
/// # Errors
///
/// Returns `MessageTooLong` if the payload does not fit an 8-digit prefix.
pub fn build_frame(payload: &[u8]) -> Result<Bytes> {
    let prefix = encode_length_prefix(payload.len())?;

    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_slice(&prefix);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Build frame parts for scatter/gather I/O.
///
/// Returns the encoded prefix and a reference to the payload.
pub fn build_frame_parts(payload: &[u8]) -> Result<([u8; LENGTH_PREFIX_SIZE], &[u8])> {
    Ok((encode_length_prefix(payload.len())?, payload))
}
