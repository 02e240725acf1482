//! Error types for replication.

use thiserror::Error;

/// Result type for replication operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors reported by sync engines, resolvers and the coordinator.
///
/// Errors are `Clone` because a single stream failure is both logged and
/// forwarded through state notifications.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The remote store rejected our credentials or a write.
    #[error("replication denied: {0}")]
    Denied(String),

    /// The target name or URL could not be turned into a target handle.
    #[error("invalid target: {0}")]
    InvalidTarget(String),

    /// No remote store answers at the target URL.
    #[error("unknown target: {0}")]
    UnknownTarget(String),

    /// Operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// The engine dropped the event stream without a terminal event.
    #[error("replication stream closed unexpectedly")]
    StreamClosed,
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

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout => true,
            SyncError::UnknownTarget(_) => true,
            SyncError::StreamClosed => true,
            _ => false,
        }
    }

    /// Returns true if this error is an authorization problem that an
    /// operator has to fix.
    pub fn is_authorization(&self) -> bool {
        matches!(self, SyncError::Denied(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::transport_retryable("connection lost").is_retryable());
        assert!(!SyncError::transport_fatal("invalid certificate").is_retryable());
        assert!(SyncError::Timeout.is_retryable());
        assert!(SyncError::UnknownTarget("http://nowhere:5984/db".into()).is_retryable());
        assert!(!SyncError::InvalidTarget("".into()).is_retryable());
        assert!(!SyncError::Denied("bad password".into()).is_retryable());
    }

    #[test]
    fn authorization_errors() {
        assert!(SyncError::Denied("forbidden".into()).is_authorization());
        assert!(!SyncError::Timeout.is_authorization());
    }

    #[test]
    fn error_display() {
        let err = SyncError::InvalidTarget("empty name".into());
        assert_eq!(err.to_string(), "invalid target: empty name");

        let err = SyncError::transport_retryable("reset by peer");
        assert_eq!(err.to_string(), "transport error: reset by peer");
    }
}
