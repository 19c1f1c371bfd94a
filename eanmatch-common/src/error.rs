//! Common error types for EANMatch

use thiserror::Error;

/// Common result type for EANMatch operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across the EANMatch crates
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

    /// Input EAN failed normalization (wrong length, non-numeric, bad check digit)
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// Invalid user input or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
