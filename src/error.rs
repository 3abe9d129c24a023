//! Error types for the Quotagate service.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Quotagate operations.
#[derive(Error, Debug)]
pub enum QuotaError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors reported by the shared state backend
    #[error("Backend error: {0}")]
    Backend(#[from] redis::RedisError),

    /// A stored quota record could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A backend call did not complete in time
    #[error("Backend call timed out after {0:?}")]
    Timeout(Duration),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for QuotaError {
    fn from(err: config::ConfigError) -> Self {
        QuotaError::Config(err.to_string())
    }
}

/// Result type alias for Quotagate operations.
pub type Result<T> = std::result::Result<T, QuotaError>;
