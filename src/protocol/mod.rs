//! Protocol module - wire format, framing, and stream demultiplexing.
//!
//! This module implements the byte-level protocol shared by every peer:
//! - 8-byte space-padded decimal length prefix
//! - Frame building for the write path
//! - Frame buffer for turning arbitrary read chunks into payloads

mod frame;
mod frame_buffer;
mod wire_format;

pub use frame::{build_frame, build_frame_parts};
pub use frame_buffer::FrameBuffer;
pub use wire_format::{
    encode_length_prefix, parse_length_prefix, LENGTH_PREFIX_SIZE, MAX_PAYLOAD_LEN,
};
