//! Retry error types.

use jobretry_common::AppError;
use thiserror::Error;

use crate::exception::JobFailure;

/// Result alias for retry operations.
pub type RetryResult<T> = Result<T, RetryError>;

/// A retry policy that cannot work as written. Raised while the policy is
/// being built, before any job runs.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("retry_exceptions and fatal_exceptions are mutually exclusive")]
    AmbiguousExceptionFilter,

    #[error("retry delay multiplicand min ({min}) must not exceed max ({max})")]
    InvalidMultiplicandRange { min: f64, max: f64 },

    #[error("backoff strategy needs at least one delay")]
    EmptyBackoffStrategy,

    #[error("ignored exception {0} is not in retry_exceptions")]
    IgnoredNotRetryable(&'static str),

    #[error("ignored exception {0} is also a fatal exception")]
    IgnoredButFatal(&'static str),
}

/// Retry machinery error.
#[derive(Debug, Error)]
pub enum RetryError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("store error: {0}")]
    Store(String),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A criteria check or callback failed. Never retried.
    #[error("retry callback failed: {0}")]
    Callback(#[source] anyhow::Error),

    #[error("unknown job type: {0}")]
    UnknownJob(String),

    #[error("job type {0} has no retry policy")]
    NotRetryable(String),

    /// A job failed while running inline; no retry machinery was involved.
    #[error("job failed inline: {0}")]
    Job(#[source] JobFailure),
}

impl From<fred::error::Error> for RetryError {
    fn from(err: fred::error::Error) -> Self {
        Self::Store(err.to_string())
    }
}

impl From<RetryError> for AppError {
    fn from(err: RetryError) -> Self {
        match err {
            RetryError::Config(e) => Self::Config(e.to_string()),
            RetryError::Store(msg) => Self::Redis(msg),
            RetryError::Queue(msg) => Self::Queue(msg),
            RetryError::UnknownJob(name) => Self::NotFound(name),
            RetryError::Job(failure) => Self::Job(failure.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_message() {
        let err = ConfigError::InvalidMultiplicandRange { min: 3.0, max: 0.5 };
        assert_eq!(
            err.to_string(),
            "retry delay multiplicand min (3) must not exceed max (0.5)"
        );
    }

    #[test]
    fn test_into_app_error() {
        let err: AppError = RetryError::Store("connection refused".into()).into();
        assert!(matches!(err, AppError::Redis(_)));

        let err: AppError = RetryError::from(ConfigError::AmbiguousExceptionFilter).into();
        assert!(matches!(err, AppError::Config(_)));
    }
}
