//! Codec module - envelope encoding/decoding, independent of transport.
//!
//! - [`JsonCodec`] - `serde_json` marker codec for payload bodies
//! - [`Envelope`] - the `{type, message}` message with one-level type flattening
//!
//! # Example
//!
//! ```
//! use groundlink::codec::{decode, encode};
//! use groundlink::protocol::LENGTH_PREFIX_SIZE;
//! use serde_json::json;
//!
//! let frame = encode("connect", &json!({"type": "request"})).unwrap();
//! let envelope = decode(&frame[LENGTH_PREFIX_SIZE..]).unwrap();
//! assert_eq!(envelope.type_path(), "connect.request");
//! ```

mod envelope;
mod json;

pub use envelope::{decode, encode, Envelope};
pub use json::JsonCodec;
