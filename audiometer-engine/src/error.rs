//! Error types for audiometer-engine
//!
//! Session-level taxonomy: configuration problems are detected before a
//! session starts, device errors are fatal to the running session.
//! Per-combination limits (safety ceiling, presentation cap) never appear
//! here; they are recorded as NO_RESPONSE outcomes.

use thiserror::Error;

/// Main error type for audiometer-engine
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid test configuration; the session never enters RUNNING
    #[error("Configuration error: {0}")]
    Config(String),

    /// Audio hardware failure during a tone presentation
    #[error("Audio device error: {0}")]
    Device(String),

    /// Database connection or query errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Result persistence errors
    #[error("Result storage error: {0}")]
    Storage(String),

    /// HTTP server errors
    #[error("HTTP server error: {0}")]
    Http(String),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid state for operation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Other errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for errors that end a running session as FAILED
    pub fn is_device_error(&self) -> bool {
        matches!(self, Error::Device(_))
    }
}

impl From<audiometer_common::Error> for Error {
    fn from(err: audiometer_common::Error) -> Self {
        match err {
            audiometer_common::Error::Config(msg) => Error::Config(msg),
            audiometer_common::Error::Database(e) => Error::Database(e),
            audiometer_common::Error::Io(e) => Error::Io(e),
            other => Error::Storage(other.to_string()),
        }
    }
}

/// Convenience Result type using audiometer-engine Error
pub type Result<T> = std::result::Result<T, Error>;
