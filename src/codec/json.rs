//! JSON codec using `serde_json`.
//!
//! Payload text on the wire is always UTF-8 JSON. Inbound failures are
//! reported as `MalformedMessage` so the read loop can drop the frame and
//! keep the connection.

use crate::error::{GroundlinkError, Result};

/// JSON codec for structured data.
pub struct JsonCodec;

impl JsonCodec {
    /// Encode a value to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized.
    #[inline]
    pub fn encode<T: serde::Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    /// Decode JSON bytes to a value.
    ///
    /// # Errors
    ///
    /// Returns `MalformedMessage` if the bytes are not valid JSON for `T`.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| GroundlinkError::malformed(e.to_string()))
    }

    /// Convert an already-parsed JSON value into `T`.
    #[inline]
    pub fn from_value<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T> {
        serde_json::from_value(value).map_err(|e| GroundlinkError::malformed(e.to_string()))
    }
}
