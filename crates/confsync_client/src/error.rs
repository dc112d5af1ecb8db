//! Error types for the configuration client.

use confsync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for client operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while configuring, bootstrapping or syncing.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Invalid connection options. Fatal: the client never starts.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Bootstrap fetch failed while `check_config_exist` is set.
    #[error("bootstrap failed: {0}")]
    Bootstrap(String),

    /// Required keys are absent on the server while `check_config_exist` is set.
    #[error("required configuration keys missing on server: {}", .0.join(", "))]
    MissingKeys(Vec<String>),

    /// Key is not present in the configuration.
    #[error("configuration key not found: {0}")]
    NotFound(String),

    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Malformed server response.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Value exists but cannot be parsed as the requested type.
    #[error("invalid value for {key}: {message}")]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// Parse failure.
        message: String,
    },

    /// Server rejected the request.
    #[error("server error: {0}")]
    ServerError(String),

    /// A change handler failed.
    #[error("change handler #{index} failed: {message}")]
    Handler {
        /// Registration index of the handler.
        index: usize,
        /// Failure message.
        message: String,
    },

    /// Operation was interrupted by shutdown.
    #[error("sync cancelled")]
    Cancelled,

    /// Timeout.
    #[error("operation timed out")]
    Timeout,

    /// Transport was closed.
    #[error("not connected to server")]
    NotConnected,

    /// Invalid engine state transition.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Returns true if this error must abort startup.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::Config(_) | SyncError::Bootstrap(_) | SyncError::MissingKeys(_)
        )
    }

    /// Returns true if this error can be retried.
    ///
    /// Malformed responses count as transport failures for retry purposes.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout | SyncError::ServerError(_) | SyncError::Protocol(_) => true,
            _ => false,
        }
    }
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        SyncError::Protocol(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::transport_retryable("connection reset").is_retryable());
        assert!(!SyncError::transport_fatal("invalid certificate").is_retryable());
        assert!(SyncError::Timeout.is_retryable());
        assert!(SyncError::ServerError("internal error".into()).is_retryable());
        assert!(SyncError::Protocol("truncated body".into()).is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
        assert!(!SyncError::NotFound("db.url".into()).is_retryable());
    }

    #[test]
    fn fatal_errors() {
        assert!(SyncError::config("serverUrl is empty").is_fatal());
        assert!(SyncError::Bootstrap("no node reachable".into()).is_fatal());
        assert!(SyncError::MissingKeys(vec!["db.url".into()]).is_fatal());
        assert!(!SyncError::transport_retryable("refused").is_fatal());
        assert!(!SyncError::NotFound("foo".into()).is_fatal());
    }

    #[test]
    fn error_display() {
        let err = SyncError::MissingKeys(vec!["a".into(), "b".into()]);
        assert_eq!(
            err.to_string(),
            "required configuration keys missing on server: a, b"
        );

        let err = SyncError::Handler {
            index: 2,
            message: "boom".into(),
        };
        assert_eq!(err.to_string(), "change handler #2 failed: boom");
    }

    #[test]
    fn protocol_error_converts() {
        let err: SyncError = ProtocolError::Decode("eof".into()).into();
        assert!(matches!(err, SyncError::Protocol(_)));
        assert!(err.is_retryable());
    }
}
