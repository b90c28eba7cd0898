//! Error types for the Turnstile service.

use std::time::Duration;
use thiserror::Error;

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The shared counter store could not produce an answer
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Metrics registry errors
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures talking to the shared counter store.
///
/// A decision that ends in one of these is indeterminate: it is neither an
/// allow nor a deny, and callers must not treat it as either.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Network or protocol failure reported by the Redis client
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),

    /// The request-scoped deadline elapsed before the store answered
    #[error("store round trip exceeded {0:?}")]
    Timeout(Duration),

    /// The atomic transaction returned a reply of an unexpected shape
    #[error("unexpected store reply: {0}")]
    Decode(String),
}

impl StoreError {
    /// Short label used for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::Redis(_) => "redis",
            StoreError::Timeout(_) => "timeout",
            StoreError::Decode(_) => "decode",
        }
    }
}

impl From<config::ConfigError> for TurnstileError {
    fn from(err: config::ConfigError) -> Self {
        TurnstileError::Config(err.to_string())
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;

/// Result type alias for store adapters.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
