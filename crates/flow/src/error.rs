//! Error types for the flow pipeline.
//!
//! These are engine failures, not flow failures: when `process` returns one of
//! them nothing has been committed and the transport is expected to redeliver
//! the inbound event. Failures that belong to a flow are [`crate::FlowError`].

use thiserror::Error;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Pipeline error types.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// Checkpoint store operation failed.
    #[error("storage operation '{operation}' failed: {reason}")]
    StorageFailed { operation: String, reason: String },

    /// Encoding or decoding failed.
    #[error("codec error: {reason}")]
    Codec { reason: String },

    /// Envelope carries a version this build does not understand.
    #[error("unsupported envelope version {found} (expected {expected})")]
    UnsupportedVersion { found: u16, expected: u16 },

    /// Invalid engine configuration.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// The worker pool is no longer accepting events.
    #[error("worker pool is shut down")]
    PoolClosed,
}

impl Error {
    /// Create a storage failed error.
    pub fn storage_failed(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StorageFailed {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a codec error.
    pub fn codec(reason: impl Into<String>) -> Self {
        Self::Codec {
            reason: reason.into(),
        }
    }

    /// Create an invalid configuration error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Check if redelivering the same event may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageFailed { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::codec(err.to_string())
    }
}
