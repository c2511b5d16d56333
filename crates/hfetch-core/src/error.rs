//! Error types for hfetch core

use hfetch_types::FetchFlags;
use thiserror::Error;

/// Why a transfer failed.
///
/// These never surface from [`crate::FetchEngine::fetch`] itself; they are
/// delivered to the `onerror` callback and readable through
/// [`crate::Fetch::error`].
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid request method: {0}")]
    InvalidMethod(String),

    #[error("Server error: {status} - {message}")]
    HttpStatus { status: u16, message: String },

    #[error("Conflicting attributes: APPEND, REPLACE and NO_DOWNLOAD are mutually exclusive (got {0})")]
    ConflictingAttributes(FetchFlags),

    #[error("Not found in persistent store: {0}")]
    NotPersisted(String),

    #[error("Persistent store is not configured")]
    StoreUnavailable,

    #[error("Fetch was aborted")]
    Aborted,

    #[error("Timeout")]
    Timeout,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl FetchError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Network(e) => !e.is_builder() && !e.is_redirect(),
            FetchError::Timeout => true,
            FetchError::HttpStatus { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// HTTP status carried by this error, if any
    pub fn http_status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } => Some(*status),
            FetchError::Network(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

/// Status of a wait or close call, distinct from the transfer outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum OperationError {
    /// Blocking is not allowed on the engine's own driving context
    #[error("Operation not supported on this thread")]
    NotSupported,

    /// The wait budget ran out; the transfer keeps going
    #[error("Timed out")]
    TimedOut,

    /// The handle was already closed
    #[error("Fetch handle is closed")]
    InvalidHandle,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(FetchError::Timeout.is_retryable());
        assert!(FetchError::HttpStatus {
            status: 503,
            message: "unavailable".to_string()
        }
        .is_retryable());
        assert!(!FetchError::HttpStatus {
            status: 404,
            message: "missing".to_string()
        }
        .is_retryable());
        assert!(!FetchError::Aborted.is_retryable());
        assert!(!FetchError::NotPersisted("a".to_string()).is_retryable());
    }

    #[test]
    fn conflict_message_names_flags() {
        let err = FetchError::ConflictingAttributes(FetchFlags::APPEND | FetchFlags::REPLACE);
        assert!(err.to_string().contains("APPEND | REPLACE"));
    }
}
