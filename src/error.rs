//! Error types for rate limiters and keyed registries.

use thiserror::Error;

/// Reasons a limiter configuration is rejected.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
    /// A bounded limiter was registered under an empty key.
    #[error("empty keys not allowed")]
    EmptyKey,

    /// A bounded limiter was configured with zero permits per interval.
    #[error("maxcount cannot be zero")]
    ZeroMaxCount,

    /// A bounded limiter was configured with a zero refill interval.
    #[error("time duration not set")]
    ZeroDuration,
}

/// Main error type for limiter and registry operations.
#[derive(Error, Debug)]
pub enum LimiterError {
    /// The supplied configuration is invalid
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// `add` was called for a key that already has a live or remembered entry
    #[error("key already exists: {0}")]
    KeyAlreadyExists(String),

    /// The key has no live limiter in a strict registry
    #[error("key does not exist: {0}")]
    KeyMissing(String),

    /// An invariant the registry relies on did not hold
    #[error("Internal error: {0}")]
    Internal(String),

    /// A windowed limiter needs a Tokio runtime to drive its refill task
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Configuration file errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for limiter operations.
pub type Result<T> = std::result::Result<T, LimiterError>;
