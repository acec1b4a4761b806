//! Error types for lineage tracking.

use thiserror::Error;

use crate::config::ConfigError;

/// Main error type for tracking operations.
#[derive(Debug, Error)]
pub enum TrackingError {
    /// A segment record is missing a required field or is otherwise unusable.
    /// Only that segment is rejected; the rest of the frame is processed.
    #[error("Malformed segment in frame {frame} (index {index:?}): {reason}")]
    MalformedInput {
        frame: u64,
        index: Option<u64>,
        reason: String,
    },

    /// Lineage integrity would be broken. Fatal for the frame being processed.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TrackingError {
    pub fn malformed(frame: u64, index: Option<u64>, reason: impl Into<String>) -> Self {
        Self::MalformedInput {
            frame,
            index,
            reason: reason.into(),
        }
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        Self::InvariantViolation(message.into())
    }
}

/// Result type alias for tracking operations.
pub type Result<T> = std::result::Result<T, TrackingError>;
