//! Error types for the Turnstile service.

use thiserror::Error;

/// Main error type for Turnstile operations.
///
/// Rejecting a request is not an error: admission checks return `bool`.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Invalid configuration values
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors raised while assembling layered configuration
    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] config::ConfigError),

    /// HTTP server errors
    #[error("Server error: {0}")]
    Server(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
