//! Error types for the Windowkeeper limiter.

use thiserror::Error;

/// Main error type for Windowkeeper operations.
///
/// Denials are not errors: an over-quota request is reported through the
/// normal return value of `try_acquire`/`check`.
#[derive(Error, Debug)]
pub enum WindowkeeperError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Background task failures
    #[error("Task error: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl From<::config::ConfigError> for WindowkeeperError {
    fn from(err: ::config::ConfigError) -> Self {
        WindowkeeperError::Config(err.to_string())
    }
}

/// Result type alias for Windowkeeper operations.
pub type Result<T> = std::result::Result<T, WindowkeeperError>;
