//! Error types for querygate.

use thiserror::Error;

/// Main error type for querygate operations.
#[derive(Error, Debug)]
pub enum QuerygateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for querygate operations.
pub type Result<T> = std::result::Result<T, QuerygateError>;
