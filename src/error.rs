//! Error types for the Floodgate rate limiter.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Floodgate operations.
///
/// Only [`FloodgateError::UnknownPolicy`] can escape an enforcement call; store
/// failures are absorbed by the fallback path and never reach the caller.
#[derive(Error, Debug)]
pub enum FloodgateError {
    /// A policy name that was never registered. This is a programming error.
    #[error("Unknown rate limit policy: {0}")]
    UnknownPolicy(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Shared store errors surfaced outside of enforcement (e.g. startup)
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for FloodgateError {
    fn from(err: config::ConfigError) -> Self {
        FloodgateError::Config(err.to_string())
    }
}

/// The shared counter store could not answer.
///
/// Every variant means the same thing to the enforcer: the store is
/// unavailable and the local fallback must be used.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store is known to be unreachable or refused the operation
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The store did not answer within the configured timeout
    #[error("Store did not respond within {0:?}")]
    Timeout(Duration),

    /// Redis client errors
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The store answered with something we could not interpret
    #[error("Unexpected store reply: {0}")]
    UnexpectedReply(String),
}

/// Result type alias for Floodgate operations.
pub type Result<T> = std::result::Result<T, FloodgateError>;
