//! Error types for protocol encoding.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while encoding or decoding protocol messages.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// A message could not be serialized.
    #[error("failed to encode message: {0}")]
    Encode(String),

    /// A message body could not be parsed.
    #[error("failed to decode message: {0}")]
    Decode(String),

    /// A message parsed but violates a protocol rule.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

impl ProtocolError {
    /// Creates an invalid-message error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidMessage(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ProtocolError::invalid("revision went backwards");
        assert_eq!(err.to_string(), "invalid message: revision went backwards");

        let err = ProtocolError::Decode("expected value at line 1".into());
        assert!(err.to_string().starts_with("failed to decode"));
    }
}
