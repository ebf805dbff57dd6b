//! Error types for the controller.
//!
//! Defines custom error types with classification for retry behavior.

use std::time::Duration;
use thiserror::Error;

use crate::client::{ExecError, ParseError};

/// Base delay for retryable errors.
const BACKOFF_BASE_SECS: u64 = 5;
/// Upper bound for retryable error backoff.
const BACKOFF_MAX_SECS: u64 = 300;

/// Error type for controller operations
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Command executed inside a pod failed
    #[error("Pod exec error: {0}")]
    Exec(#[from] ExecError),

    /// Write rejected because the object changed underneath us
    #[error("Conflict updating {0}")]
    Conflict(String),

    /// Missing required field in resource
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// Validation error in resource spec
    #[error("Validation error: {0}")]
    Validation(String),

    /// Transient error that should be retried
    #[error("Transient error: {0}")]
    Transient(String),

    /// Permanent error that should not be retried
    #[error("Permanent error: {0}")]
    Permanent(String),

    /// Command output did not match the expected format
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Check if this error indicates a not-found condition
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 404)
    }

    /// Check if this error is an optimistic-concurrency conflict
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict(_) => true,
            Error::Kube(kube::Error::Api(e)) => e.code == 409,
            _ => false,
        }
    }

    /// Check if this error should be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(e) => {
                // Retry on network errors, rate limiting, conflicts and server errors
                matches!(
                    e,
                    kube::Error::Api(api_err)
                        if api_err.code >= 500 || api_err.code == 429 || api_err.code == 409
                ) || matches!(e, kube::Error::Service(_))
            }
            Error::Exec(_) | Error::Conflict(_) | Error::Transient(_) => true,
            Error::Validation(_) | Error::Permanent(_) | Error::MissingField(_) => false,
            Error::Parse(_) | Error::Serialization(_) => false,
        }
    }

    /// Get the recommended requeue duration for this error
    pub fn requeue_after(&self) -> Duration {
        self.requeue_after_with_retry_count(0)
    }

    /// Requeue duration with exponential backoff over consecutive failures.
    pub fn requeue_after_with_retry_count(&self, retry_count: u32) -> Duration {
        if self.is_retryable() {
            backoff_for_attempt(retry_count)
        } else {
            // Don't hammer the API for errors that need a spec change
            Duration::from_secs(BACKOFF_MAX_SECS)
        }
    }
}

/// Exponential backoff starting at 5s, doubling, capped at 5 minutes.
pub fn backoff_for_attempt(attempt: u32) -> Duration {
    let factor = 1u64.checked_shl(attempt.min(16)).unwrap_or(u64::MAX);
    Duration::from_secs(BACKOFF_BASE_SECS.saturating_mul(factor).min(BACKOFF_MAX_SECS))
}

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, Error>;
