//! Stream demultiplexer: read chunks in, whole payloads out.
//!
//! Uses `bytes::BytesMut` for buffer management. Chunk boundaries need not
//! line up with frame boundaries: one push may complete zero, one or many
//! frames and leave a trailing partial frame buffered.
//!
//! The buffer tracks the length of the next payload once at least 8 bytes
//! are available. A known length of `0` is treated as "no frame queued", so
//! a zero-length payload is never emitted.
//!
//! # Example
//!
//! ```
//! use groundlink::protocol::FrameBuffer;
//!
//! let mut buffer = FrameBuffer::new();
//!
//! assert!(buffer.push(b"       4nu").unwrap().is_empty());
//! let payloads = buffer.push(b"ll").unwrap();
//! assert_eq!(&payloads[0][..], b"null");
//! ```

use bytes::{Buf, Bytes, BytesMut};

use super::wire_format::{parse_length_prefix, LENGTH_PREFIX_SIZE, MAX_PAYLOAD_LEN};
use crate::error::{GroundlinkError, Result};

/// Default initial buffer capacity (64KB).
const DEFAULT_CAPACITY: usize = 64 * 1024;

/// Buffer for accumulating incoming bytes and extracting complete payloads.
pub struct FrameBuffer {
    /// Bytes received but not yet emitted as payloads.
    buffer: BytesMut,
    /// Length of the next payload, 0 while unknown.
    next_length: usize,
    /// Largest length a prefix may announce.
    max_payload_size: usize,
}

impl FrameBuffer {
    /// Empty buffer accepting payloads up to `MAX_PAYLOAD_LEN`.
    pub fn new() -> Self {
        Self::with_capacity_and_max_payload(DEFAULT_CAPACITY, MAX_PAYLOAD_LEN)
    }

    /// Cap payloads at `max_payload_size` instead of `MAX_PAYLOAD_LEN`.
    pub fn with_max_payload(max_payload_size: usize) -> Self {
        Self::with_capacity_and_max_payload(DEFAULT_CAPACITY, max_payload_size)
    }

    /// Preallocate `capacity` bytes and cap payloads at `max_payload_size`.
    pub fn with_capacity_and_max_payload(capacity: usize, max_payload_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
            next_length: 0,
            max_payload_size,
        }
    }

    /// Push data into the buffer and extract all complete payloads.
    ///
    /// Payloads are returned in the order their frames completed.
    ///
    /// # Errors
    ///
    /// Returns `InvalidLengthPrefix` if a prefix holds no digits, or
    /// `Transport` if a prefix announces more than `max_payload_size`.
    /// Either way the stream can no longer be resynchronised. Payloads that
    /// completed earlier in the same chunk are not returned on error; use
    /// [`add_chunk`](Self::add_chunk) to keep them.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Bytes>> {
        let mut payloads = Vec::new();
        self.add_chunk(data, |payload| payloads.push(payload))?;
        Ok(payloads)
    }

    /// Append a chunk and hand each completed payload to `emit` before
    /// returning.
    ///
    /// On a bad prefix every payload ahead of it has already been emitted.
    pub fn add_chunk<F>(&mut self, data: &[u8], mut emit: F) -> Result<()>
    where
        F: FnMut(Bytes),
    {
        self.buffer.extend_from_slice(data);

        if self.buffer.len() >= LENGTH_PREFIX_SIZE {
            self.next_length = self.peek_length()?;
        }

        while self.next_length != 0 && self.buffer.len() >= self.next_length + LENGTH_PREFIX_SIZE
        {
            self.buffer.advance(LENGTH_PREFIX_SIZE);
            let payload = self.buffer.split_to(self.next_length).freeze();
            self.next_length = 0;

            emit(payload);

            if self.buffer.len() >= LENGTH_PREFIX_SIZE {
                self.next_length = self.peek_length()?;
            }
        }

        Ok(())
    }

    /// Parse the prefix at the front of the buffer without consuming it.
    fn peek_length(&self) -> Result<usize> {
        let length = parse_length_prefix(&self.buffer[..LENGTH_PREFIX_SIZE])?;

        if length > self.max_payload_size {
            return Err(GroundlinkError::Transport(format!(
                "Payload size {} exceeds maximum {}",
                length, self.max_payload_size
            )));
        }

        Ok(length)
    }

    /// Length of the next payload, if a prefix has been read.
    pub fn pending_length(&self) -> Option<usize> {
        (self.next_length != 0).then_some(self.next_length)
    }

    /// Buffered byte count, prefix included.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// True when no partial frame is held.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Drop any partial frame.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.next_length = 0;
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::build_frame;

    fn frame(payload: &str) -> Vec<u8> {
        build_frame(payload.as_bytes()).unwrap().to_vec()
    }

    #[test]
    fn test_single_complete_frame() {
        let mut buffer = FrameBuffer::new();

        let payloads = buffer.push(&frame(r#"{"type":"ping","message":{}}"#)).unwrap();

        assert_eq!(payloads.len(), 1);
        assert_eq!(&payloads[0][..], br#"{"type":"ping","message":{}}"#);
        assert!(buffer.is_empty());
        assert_eq!(buffer.pending_length(), None);
    }

    #[test]
    fn test_multiple_frames_in_one_push() {
        let mut buffer = FrameBuffer::new();

        let mut combined = frame("\"first\"");
        combined.extend(frame("\"second\""));
        combined.extend(frame("\"third\""));

        let payloads = buffer.push(&combined).unwrap();

        assert_eq!(payloads.len(), 3);
        assert_eq!(&payloads[0][..], b"\"first\"");
        assert_eq!(&payloads[1][..], b"\"second\"");
        assert_eq!(&payloads[2][..], b"\"third\"");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_partial_then_complete() {
        let mut buffer = FrameBuffer::new();
        let bytes = frame(r#"{"type":"time","message":{"type":"request"}}"#);

        assert!(buffer.push(&bytes[..5]).unwrap().is_empty());
        assert_eq!(buffer.pending_length(), None);

        let payloads = buffer.push(&bytes[5..]).unwrap();
        assert_eq!(payloads.len(), 1);
        assert_eq!(&payloads[0][..], &bytes[8..]);
    }

    #[test]
    fn test_fragmented_payload() {
        let mut buffer = FrameBuffer::new();
        let payload = "\"this is a longer payload that will be fragmented\"";
        let bytes = frame(payload);

        let partial_len = LENGTH_PREFIX_SIZE + 10;
        assert!(buffer.push(&bytes[..partial_len]).unwrap().is_empty());
        assert_eq!(buffer.pending_length(), Some(payload.len()));

        let payloads = buffer.push(&bytes[partial_len..]).unwrap();
        assert_eq!(payloads.len(), 1);
        assert_eq!(&payloads[0][..], payload.as_bytes());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_mixed_complete_and_partial() {
        let mut buffer = FrameBuffer::new();

        let second = frame("\"second\"");
        let mut data = frame("\"first\"");
        data.extend_from_slice(&second[..5]);

        let payloads = buffer.push(&data).unwrap();
        assert_eq!(payloads.len(), 1);
        assert_eq!(&payloads[0][..], b"\"first\"");
        assert_eq!(buffer.len(), 5);

        let payloads = buffer.push(&second[5..]).unwrap();
        assert_eq!(payloads.len(), 1);
        assert_eq!(&payloads[0][..], b"\"second\"");
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut buffer = FrameBuffer::new();
        let bytes = frame(r#"{"type":"ping","message":null}"#);

        let mut all = Vec::new();
        for byte in &bytes {
            all.extend(buffer.push(&[*byte]).unwrap());
        }

        assert_eq!(all.len(), 1);
        assert_eq!(&all[0][..], &bytes[8..]);
    }

    #[test]
    fn test_zero_length_prefix_never_emits() {
        let mut buffer = FrameBuffer::new();

        let payloads = buffer.push(b"00000000").unwrap();
        assert!(payloads.is_empty());
        assert_eq!(buffer.len(), 8);
        assert_eq!(buffer.pending_length(), None);
    }

    #[test]
    fn test_add_chunk_emits_in_order_before_returning() {
        let mut buffer = FrameBuffer::new();
        let mut data = frame("1");
        data.extend(frame("22"));
        data.extend(frame("333"));

        let mut seen = Vec::new();
        buffer
            .add_chunk(&data, |payload| seen.push(payload.len()))
            .unwrap();

        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[test]
    fn test_invalid_prefix_is_error() {
        let mut buffer = FrameBuffer::new();
        let result = buffer.push(br#"{"type":"ping"}"#);
        assert!(matches!(result, Err(GroundlinkError::InvalidLengthPrefix(_))));
    }

    #[test]
    fn test_add_chunk_emits_before_bad_prefix() {
        let mut buffer = FrameBuffer::new();
        let mut chunk = frame("\"good\"");
        chunk.extend_from_slice(b"garbage!");

        let mut seen = Vec::new();
        let result = buffer.add_chunk(&chunk, |payload| seen.push(payload));

        assert!(matches!(result, Err(GroundlinkError::InvalidLengthPrefix(_))));
        assert_eq!(seen, vec![&b"\"good\""[..]]);
    }

    #[test]
    fn test_max_payload_validation() {
        let mut buffer = FrameBuffer::with_max_payload(100);

        let result = buffer.push(b"    1000");

        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_clear_resets_state() {
        let mut buffer = FrameBuffer::new();
        let bytes = frame("\"pending\"");

        buffer.push(&bytes[..10]).unwrap();
        assert_eq!(buffer.pending_length(), Some(9));

        buffer.clear();

        assert!(buffer.is_empty());
        assert_eq!(buffer.pending_length(), None);
    }

    #[test]
    fn test_large_payload() {
        let mut buffer = FrameBuffer::new();
        let payload = format!("\"{}\"", "a".repeat(1024 * 1024));
        let bytes = frame(&payload);

        let mut all = Vec::new();
        for chunk in bytes.chunks(4096) {
            all.extend(buffer.push(chunk).unwrap());
        }

        assert_eq!(all.len(), 1);
        assert_eq!(all[0].len(), payload.len());
    }
}
