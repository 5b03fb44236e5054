//! Error types for protocol decoding.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while decoding or encoding protocol messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The message is not valid JSON or does not match the expected shape.
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    /// A payload field is missing or has the wrong type.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// The request type is not one the engine understands.
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    /// A record reference could not be parsed.
    #[error("invalid record id: {0}")]
    InvalidRecordId(String),
}

impl ProtocolError {
    /// Creates an invalid payload error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidPayload(message.into())
    }
}
