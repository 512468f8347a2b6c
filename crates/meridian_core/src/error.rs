//! Core error types for MERIDIAN.

use crate::status::StatusTransitionError;

/// Core result type
pub type CoreResult<T> = Result<T, CoreError>;

/// Core error type
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    /// Invalid encoding
    #[error("Invalid encoding: {reason}")]
    InvalidEncoding {
        /// What failed to decode
        reason: String,
    },

    /// Unsupported record version
    #[error("Unsupported record version: expected {expected}, got {actual}")]
    VersionMismatch {
        /// Version this build writes
        expected: u32,
        /// Version found
        actual: u32,
    },

    /// Validation error
    #[error("Validation failed for {field}: {reason}")]
    Validation {
        /// Field or entity that failed
        field: String,
        /// Why
        reason: String,
    },

    /// Not found
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Entity kind
        kind: String,
        /// Entity id
        id: String,
    },

    /// Illegal state-machine transition
    #[error(transparent)]
    Transition(#[from] StatusTransitionError),

    /// Cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// Internal error (for unexpected errors)
    #[error("Internal error: {message}")]
    Internal {
        /// Error message
        message: String,
    },
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidEncoding {
            reason: err.to_string(),
        }
    }
}

impl From<postcard::Error> for CoreError {
    fn from(err: postcard::Error) -> Self {
        Self::InvalidEncoding {
            reason: err.to_string(),
        }
    }
}
