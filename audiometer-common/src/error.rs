//! Common error types for the audiometer workspace

use thiserror::Error;

/// Common result type for audiometer operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across audiometer crates
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[cfg(feature = "sqlx")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation error
    ///
    /// Raised before a session starts; the session never enters RUNNING.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Result file could not be parsed
    #[error("Result file format error: {0}")]
    Format(String),

    /// Requested resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Serialization error (JSON summary)
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
