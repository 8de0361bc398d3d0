//! Error types for the rate limit plugin.

use thiserror::Error;

/// Main error type for rate limiter and command operations.
#[derive(Error, Debug)]
pub enum RateLimitError {
    /// A configuration value was out of range. State is left unchanged.
    #[error("Invalid value for {field}: {reason}")]
    InvalidConfig {
        /// Name of the rejected field, e.g. `time_window_seconds`
        field: &'static str,
        /// Human readable explanation
        reason: String,
    },

    /// An admin command could not be parsed
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// Configuration loading or serialization errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RateLimitError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        RateLimitError::InvalidConfig {
            field,
            reason: reason.into(),
        }
    }
}

impl From<config::ConfigError> for RateLimitError {
    fn from(err: config::ConfigError) -> Self {
        RateLimitError::Config(err.to_string())
    }
}

/// Result type alias for rate limit operations.
pub type Result<T> = std::result::Result<T, RateLimitError>;
