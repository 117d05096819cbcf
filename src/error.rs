//! Error types for groundlink.

use thiserror::Error;

use crate::connection::ConnectionId;

/// Main error type for all groundlink operations.
#[derive(Debug, Error)]
pub enum GroundlinkError {
    /// I/O error during socket/pipe operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error on the outbound path.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Payload is not valid JSON, is not an object, or lacks a `type` field.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// No handler registered for the type path (after any fallback tier).
    #[error("Unhandled message type: '{0}'")]
    UnhandledType(String),

    /// `send` attempted while the connection is not established.
    #[error("Not connected")]
    NotConnected,

    /// Remote endpoint is not listening. Only surfaced once a bounded
    /// retry budget is exhausted.
    #[error("Connection refused by {endpoint} after {attempts} attempt(s)")]
    ConnectionRefused { endpoint: String, attempts: u32 },

    /// Terminal socket/pipe failure for a connection.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Serialized message does not fit the 8-digit length prefix.
    #[error("Message too long: {0} bytes does not fit an 8-digit length prefix")]
    MessageTooLong(usize),

    /// Length prefix did not contain a decimal number.
    #[error("Invalid length prefix: {0:?}")]
    InvalidLengthPrefix(String),

    /// Unicast target is not in the server's connection set.
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    /// Connection closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Backpressure timeout - write queue full.
    #[error("Backpressure timeout")]
    BackpressureTimeout,

    /// Handler body failed or panicked.
    #[error("Handler for '{type_path}' failed: {reason}")]
    Handler { type_path: String, reason: String },

    /// Handshake declared a role the server does not accept.
    #[error("Role refused: {0}")]
    RoleRefused(String),

    /// Invalid configuration (e.g. a bad log filter).
    #[error("Configuration error: {0}")]
    Config(String),
}

impl GroundlinkError {
    /// True for the "no handler for this type" condition.
    pub fn is_unhandled(&self) -> bool {
        matches!(self, GroundlinkError::UnhandledType(_))
    }

    /// True when the frame itself could not be decoded.
    pub fn is_malformed(&self) -> bool {
        matches!(self, GroundlinkError::MalformedMessage(_))
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        GroundlinkError::MalformedMessage(reason.into())
    }
}

/// Result type alias using GroundlinkError.
pub type Result<T> = std::result::Result<T, GroundlinkError>;
