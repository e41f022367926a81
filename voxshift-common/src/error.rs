//! Common error types for voxshift

use thiserror::Error;

/// Common result type for voxshift operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across voxshift services
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid user input or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Audio decoding, encoding or format error
    #[error("Audio error: {0}")]
    Audio(String),

    /// Blob store failure other than a missing blob
    #[error("Blob store error: {0}")]
    Blob(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True when the error means a row or blob does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}
