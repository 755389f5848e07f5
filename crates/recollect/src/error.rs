//! Error types for Recollect

use serde::Serialize;
use thiserror::Error;

/// Main error type for Recollect operations
///
/// Every variant carries owned strings only, so the error is `Clone` and a
/// single failure can be handed to every waiter of a deduplicated operation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecollectError {
    /// Malformed query or missing required field, rejected before any
    /// collaborator call
    #[error("Validation error: {0}")]
    Validation(String),

    /// A collaborator could not be reached or refused service temporarily
    #[error("{service} unavailable: {message}")]
    Unavailable { service: String, message: String },

    /// An operation raced against a timer and lost
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// The requested object does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Decrypted content did not hash to the declared content hash
    #[error("Integrity check failed for {memory_id}: expected {expected}, got {actual}")]
    Integrity {
        memory_id: String,
        expected: String,
        actual: String,
    },

    /// Requester is neither the owner nor a grantee of the content
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Batch pipeline misconfiguration or processing errors
    #[error("Pipeline error: {0}")]
    Pipeline(String),

    /// Embedding generation errors
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Vector index errors (LanceDB, in-memory index)
    #[error("Index error: {0}")]
    Index(String),

    /// Blob store and ledger errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Decryption errors that are not integrity or access failures
    #[error("Decryption error: {0}")]
    Decryption(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Coarse classification used by callers to decide between retry, fallback
/// and surfacing the error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Unavailable,
    Integrity,
    AccessDenied,
    NotFound,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Integrity => "integrity",
            ErrorKind::AccessDenied => "access_denied",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Internal => "internal",
        }
    }
}

impl RecollectError {
    /// Shorthand for an `Unavailable` error
    pub fn unavailable(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unavailable {
            service: service.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RecollectError::Validation(_) | RecollectError::Config(_) => ErrorKind::Validation,
            RecollectError::Unavailable { .. } | RecollectError::Timeout { .. } => {
                ErrorKind::Unavailable
            }
            RecollectError::Integrity { .. } => ErrorKind::Integrity,
            RecollectError::AccessDenied(_) => ErrorKind::AccessDenied,
            RecollectError::NotFound(_) => ErrorKind::NotFound,
            _ => ErrorKind::Internal,
        }
    }

    /// Only transient collaborator failures are worth retrying. A tampered
    /// ciphertext or a denied request fails the same way every time.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RecollectError::Unavailable { .. } | RecollectError::Timeout { .. }
        )
    }
}

impl From<std::io::Error> for RecollectError {
    fn from(e: std::io::Error) -> Self {
        RecollectError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for RecollectError {
    fn from(e: serde_json::Error) -> Self {
        RecollectError::Serialization(e.to_string())
    }
}

/// Result type alias for Recollect operations
pub type Result<T> = std::result::Result<T, RecollectError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(
            RecollectError::Validation("k must be positive".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            RecollectError::unavailable("key-server-1", "connection refused").kind(),
            ErrorKind::Unavailable
        );
        assert_eq!(
            RecollectError::Timeout {
                operation: "decrypt".into(),
                timeout_ms: 100
            }
            .kind(),
            ErrorKind::Unavailable
        );
        assert_eq!(
            RecollectError::AccessDenied("not owner".into()).kind(),
            ErrorKind::AccessDenied
        );
        assert_eq!(
            RecollectError::Pipeline("no processor".into()).kind(),
            ErrorKind::Internal
        );
    }

    #[test]
    fn test_only_transient_errors_are_retryable() {
        assert!(RecollectError::unavailable("embedder", "503").is_retryable());
        assert!(
            RecollectError::Timeout {
                operation: "probe".into(),
                timeout_ms: 5
            }
            .is_retryable()
        );
        assert!(
            !RecollectError::Integrity {
                memory_id: "m1".into(),
                expected: "aa".into(),
                actual: "bb".into(),
            }
            .is_retryable()
        );
        assert!(!RecollectError::AccessDenied("nope".into()).is_retryable());
        assert!(!RecollectError::NotFound("blob".into()).is_retryable());
    }

    #[test]
    fn test_display_includes_service() {
        let err = RecollectError::unavailable("blob-store", "disk offline");
        assert_eq!(err.to_string(), "blob-store unavailable: disk offline");
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: RecollectError = io.into();
        assert!(matches!(err, RecollectError::Io(_)));
    }
}
