//! Error types for the Inkgate service.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Inkgate operations.
#[derive(Error, Debug)]
pub enum InkgateError {
    /// Configuration file or environment could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),

    /// A rate limit policy failed validation and must not be activated
    #[error("Invalid rate limit policy '{policy}': {reason}")]
    Misconfiguration { policy: String, reason: String },

    /// Shared counter store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// HTTP server errors
    #[error("Server error: {0}")]
    Server(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for InkgateError {
    fn from(err: config::ConfigError) -> Self {
        InkgateError::Config(err.to_string())
    }
}

/// Failures talking to the shared counter store.
///
/// None of these ever reach an HTTP caller: the limiter resolves them into a
/// decision according to the policy's failure mode.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Connection refused, dropped, or the store is otherwise unreachable
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The round trip did not complete within the configured bound
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    /// The store answered with something we could not interpret
    #[error("store protocol error: {0}")]
    Protocol(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::Protocol(err.to_string())
        }
    }
}

/// Result type alias for Inkgate operations.
pub type Result<T> = std::result::Result<T, InkgateError>;
