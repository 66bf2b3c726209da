//! Error types for Turnstile.

use thiserror::Error;

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Invalid limiter or service configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Failure while loading layered configuration sources
    #[error("Configuration load error: {0}")]
    ConfigLoad(#[from] config::ConfigError),

    /// The serialized update worker is no longer running
    #[error("Quota update worker is unavailable")]
    WorkerUnavailable,

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
