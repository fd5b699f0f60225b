//! Core error types

use thiserror::Error;

/// Core error type for the sovereign workspace
#[derive(Debug, Error)]
pub enum CoreError {
    /// Configuration could not be used as written
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias over [`CoreError`].
pub type Result<T> = std::result::Result<T, CoreError>;
