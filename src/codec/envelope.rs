//! Message envelope: `{"type": <string>, "message": <any>}`.
//!
//! Decoding applies one level of type flattening: when `message` is an
//! object carrying its own truthy `type` (a non-empty string, a non-zero
//! number or `true`), the outer type becomes `outer + "." + inner` and the
//! inner `type` key is removed before the body reaches a handler. Only one level is flattened per decode; a handler
//! that expects deeper nesting re-decodes the body itself.
//!
//! # Example
//!
//! ```
//! use groundlink::codec::Envelope;
//!
//! let envelope = Envelope::decode(br#"{"type":"a","message":{"type":"b","x":1}}"#).unwrap();
//! assert_eq!(envelope.type_path(), "a.b");
//! assert_eq!(envelope.message(), &serde_json::json!({"x": 1}));
//! ```

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::JsonCodec;
use crate::error::{GroundlinkError, Result};
use crate::protocol::build_frame;

/// Borrowed outbound shape, keeps `type` ahead of `message` in the output.
#[derive(Serialize)]
struct Outbound<'a, T: Serialize + ?Sized> {
    #[serde(rename = "type")]
    type_path: &'a str,
    message: &'a T,
}

/// A decoded application message.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    type_path: String,
    message: Value,
}

impl Envelope {
    /// Create an envelope from an already-flattened type path and body.
    pub fn new(type_path: impl Into<String>, message: Value) -> Self {
        Self {
            type_path: type_path.into(),
            message,
        }
    }

    /// Serialize `{type, message}` to JSON text.
    pub fn to_json<T: Serialize + ?Sized>(type_path: &str, message: &T) -> Result<Vec<u8>> {
        JsonCodec::encode(&Outbound { type_path, message })
    }

    /// Serialize `{type, message}` and prepend the length prefix.
    ///
    /// # Errors
    ///
    /// Returns `MessageTooLong` if the JSON text exceeds 99,999,999 bytes.
    pub fn encode<T: Serialize + ?Sized>(type_path: &str, message: &T) -> Result<Bytes> {
        let json = Self::to_json(type_path, message)?;
        build_frame(&json)
    }

    /// Decode one payload, flattening a nested `type` one level.
    ///
    /// # Errors
    ///
    /// Returns `MalformedMessage` if the payload is not UTF-8 JSON, is not
    /// an object, or has no string `type`.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let value: Value = JsonCodec::decode(payload)?;
        Self::from_value(value)
    }

    /// Build an envelope from a parsed JSON value, flattening one level.
    pub fn from_value(value: Value) -> Result<Self> {
        let mut object = match value {
            Value::Object(object) => object,
            other => {
                return Err(GroundlinkError::malformed(format!(
                    "expected an object, got {}",
                    kind_of(&other)
                )))
            }
        };

        let mut type_path = match object.remove("type") {
            Some(Value::String(t)) => t,
            Some(other) => {
                return Err(GroundlinkError::malformed(format!(
                    "`type` must be a string, got {}",
                    kind_of(&other)
                )))
            }
            None => return Err(GroundlinkError::malformed("missing `type` field")),
        };

        let mut message = object.remove("message").unwrap_or(Value::Null);

        if let Value::Object(body) = &mut message {
            if let Some(inner) = body.get("type").and_then(nested_kind) {
                body.remove("type");
                type_path.push('.');
                type_path.push_str(&inner);
            }
        }

        Ok(Self { type_path, message })
    }

    /// The dotted dispatch key.
    pub fn type_path(&self) -> &str {
        &self.type_path
    }

    /// The handler payload.
    pub fn message(&self) -> &Value {
        &self.message
    }

    /// Deserialize the handler payload into `T`.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        JsonCodec::from_value(self.message.clone())
    }

    /// Copy of this envelope with the type path qualified as `prefix.type`.
    pub fn with_prefix(&self, prefix: &str) -> Self {
        Self {
            type_path: format!("{}.{}", prefix, self.type_path),
            message: self.message.clone(),
        }
    }

    /// Split into type path and payload.
    pub fn into_parts(self) -> (String, Value) {
        (self.type_path, self.message)
    }
}

/// The path segment a nested `type` contributes, if it flattens at all.
///
/// Non-empty strings, non-zero numbers and `true` flatten. Empty strings,
/// zero, `false`, null, arrays and objects leave the message untouched.
fn nested_kind(kind: &Value) -> Option<String> {
    match kind {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) if n.as_f64() != Some(0.0) => Some(n.to_string()),
        Value::Bool(true) => Some("true".to_string()),
        _ => None,
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Encode a frame-ready `{type, message}` message.
pub fn encode<T: Serialize + ?Sized>(type_path: &str, message: &T) -> Result<Bytes> {
    Envelope::encode(type_path, message)
}

/// Decode one payload into an [`Envelope`].
pub fn decode(payload: &[u8]) -> Result<Envelope> {
    Envelope::decode(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FrameBuffer, LENGTH_PREFIX_SIZE};
    use serde_json::json;

    #[test]
    fn test_encode_layout() {
        let frame = encode("ping", &json!({})).unwrap();
        assert_eq!(&frame[..], br#"      28{"type":"ping","message":{}}"#);
        assert_eq!(frame.len(), LENGTH_PREFIX_SIZE + 28);
    }

    #[test]
    fn test_encode_null_message() {
        let frame = encode("ping", &Value::Null).unwrap();
        assert_eq!(&frame[LENGTH_PREFIX_SIZE..], br#"{"type":"ping","message":null}"#);
    }

    #[test]
    fn test_flattening() {
        let envelope = decode(br#"{"type":"a","message":{"type":"b","x":1}}"#).unwrap();
        assert_eq!(envelope.type_path(), "a.b");
        assert_eq!(envelope.message(), &json!({"x": 1}));
    }

    #[test]
    fn test_flattening_is_one_level() {
        let envelope = decode(
            br#"{"type":"all","message":{"type":"connect","inner":{"type":"data"}}}"#,
        )
        .unwrap();
        assert_eq!(envelope.type_path(), "all.connect");
        assert_eq!(envelope.message(), &json!({"inner": {"type": "data"}}));
    }

    #[test]
    fn test_no_flattening_without_nested_type() {
        let envelope = decode(br#"{"type":"telemetry","message":{"lat":1.0}}"#).unwrap();
        assert_eq!(envelope.type_path(), "telemetry");
        assert_eq!(envelope.message(), &json!({"lat": 1.0}));
    }

    #[test]
    fn test_empty_nested_type_not_flattened() {
        let envelope = decode(br#"{"type":"a","message":{"type":"","x":1}}"#).unwrap();
        assert_eq!(envelope.type_path(), "a");
        assert_eq!(envelope.message(), &json!({"type": "", "x": 1}));
    }

    #[test]
    fn test_scalar_nested_type_flattened() {
        let envelope = decode(br#"{"type":"a","message":{"type":5,"x":1}}"#).unwrap();
        assert_eq!(envelope.type_path(), "a.5");
        assert_eq!(envelope.message(), &json!({"x": 1}));

        let envelope = decode(br#"{"type":"a","message":{"type":true}}"#).unwrap();
        assert_eq!(envelope.type_path(), "a.true");

        for falsy in [r#"0"#, r#"false"#, r#"null"#, r#"{"k":1}"#] {
            let raw = format!(r#"{{"type":"a","message":{{"type":{}}}}}"#, falsy);
            let envelope = decode(raw.as_bytes()).unwrap();
            assert_eq!(envelope.type_path(), "a", "nested type {}", falsy);
            assert!(envelope.message().get("type").is_some());
        }
    }

    #[test]
    fn test_primitive_and_missing_message() {
        let envelope = decode(br#"{"type":"count","message":5}"#).unwrap();
        assert_eq!(envelope.message(), &json!(5));

        let envelope = decode(br#"{"type":"ping"}"#).unwrap();
        assert_eq!(envelope.message(), &Value::Null);
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(decode(b"not json").unwrap_err().is_malformed());
        assert!(decode(b"[1,2]").unwrap_err().is_malformed());
        assert!(decode(br#"{"message":{}}"#).unwrap_err().is_malformed());
        assert!(decode(br#"{"type":7,"message":{}}"#).unwrap_err().is_malformed());
        assert!(decode(&[0xff, 0xfe]).unwrap_err().is_malformed());
    }

    #[test]
    fn test_with_prefix() {
        let envelope = decode(br#"{"type":"connect","message":{"type":"data"}}"#).unwrap();
        assert_eq!(envelope.with_prefix("all").type_path(), "all.connect.data");
    }

    #[test]
    fn test_payload_typed() {
        #[derive(serde::Deserialize)]
        struct Connect {
            program: String,
        }

        let envelope =
            decode(br#"{"type":"connect","message":{"type":"data","program":"flight-view"}}"#)
                .unwrap();
        let connect: Connect = envelope.payload().unwrap();
        assert_eq!(connect.program, "flight-view");
    }

    #[test]
    fn test_encode_then_demux_then_decode() {
        let frame = encode("time", &json!({"type": "data", "time": 1.5})).unwrap();

        let mut buffer = FrameBuffer::new();
        let mut payloads = Vec::new();
        for chunk in frame.chunks(3) {
            payloads.extend(buffer.push(chunk).unwrap());
        }

        assert_eq!(payloads.len(), 1);
        let envelope = decode(&payloads[0]).unwrap();
        assert_eq!(envelope.type_path(), "time.data");
        assert_eq!(envelope.message(), &json!({"time": 1.5}));
    }
}
