//! Error types for Jobgate.

use thiserror::Error;

use crate::ratelimit::{LockError, StoreError};

/// Coordination failures surfaced by the limiter.
///
/// A rate-limit rejection is never an error: it is reported through
/// [`crate::ratelimit::Admission::Rejected`] so callers can tell
/// "limit exceeded" apart from infrastructure trouble.
#[derive(Error, Debug)]
pub enum JobgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The counter store could not be read or written
    #[error("Counter store error: {0}")]
    Store(#[from] StoreError),

    /// The cross-process lock could not be acquired or released
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for JobgateError {
    fn from(err: config::ConfigError) -> Self {
        JobgateError::Config(err.to_string())
    }
}

impl From<serde_yaml::Error> for JobgateError {
    fn from(err: serde_yaml::Error) -> Self {
        JobgateError::Config(err.to_string())
    }
}

/// Result type alias for Jobgate operations.
pub type Result<T> = std::result::Result<T, JobgateError>;
