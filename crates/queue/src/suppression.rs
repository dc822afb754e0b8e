//! Failure reporting with retry suppression.
//!
//! [`RetrySuppressionBackend`] sits in front of the real failure backends.
//! While a job's retry key exists a retry is pending, so the failure is not
//! forwarded; a short-lived [`FailureSnapshot`] is kept instead when the
//! retry is delayed.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::backoff::DelayContext;
use crate::error::RetryResult;
use crate::exception::JobFailure;
use crate::job::{JobPayload, JobRegistry};
use crate::keys;
use crate::store::{AttemptStore, read_attempt};

/// A failed job as reported by the worker.
#[derive(Debug, Clone)]
pub struct FailureReport {
    /// The job that failed.
    pub payload: JobPayload,
    /// Why it failed.
    pub failure: JobFailure,
    /// Identity of the reporting worker.
    pub worker: String,
    /// Queue the job was taken from.
    pub queue: String,
    /// Delay of the retry scheduled for this failure, when one was.
    pub retry_delay: Option<i64>,
}

impl FailureReport {
    /// Create a report.
    pub fn new(
        payload: JobPayload,
        failure: JobFailure,
        worker: impl Into<String>,
        queue: impl Into<String>,
    ) -> Self {
        Self {
            payload,
            failure,
            worker: worker.into(),
            queue: queue.into(),
            retry_delay: None,
        }
    }

    /// Record the delay the retry for this failure was scheduled with.
    #[must_use]
    pub const fn with_retry_delay(mut self, delay: i64) -> Self {
        self.retry_delay = Some(delay);
        self
    }
}

/// Last known failure of a job waiting for a delayed retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureSnapshot {
    /// When the failure was recorded.
    pub failed_at: DateTime<Utc>,
    /// The failed job.
    pub payload: JobPayload,
    /// Failure class name.
    pub exception: String,
    /// Failure message.
    pub error: String,
    /// Backtrace lines.
    pub backtrace: Vec<String>,
    /// Reporting worker.
    pub worker: String,
    /// Queue the job was taken from.
    pub queue: String,
}

impl FailureSnapshot {
    /// Snapshot `report` as of now.
    #[must_use]
    pub fn from_report(report: &FailureReport) -> Self {
        Self {
            failed_at: Utc::now(),
            payload: report.payload.clone(),
            exception: report.failure.class().name().to_string(),
            error: report.failure.message().to_string(),
            backtrace: report.failure.backtrace().to_vec(),
            worker: report.worker.clone(),
            queue: report.queue.clone(),
        }
    }
}

/// Somewhere failures are reported to.
#[async_trait]
pub trait FailureBackend: Send + Sync {
    /// Record a failure.
    async fn save(&self, report: &FailureReport) -> RetryResult<()>;
}

/// Reports failures through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingFailureBackend;

#[async_trait]
impl FailureBackend for LoggingFailureBackend {
    async fn save(&self, report: &FailureReport) -> RetryResult<()> {
        error!(
            job = %report.payload.class,
            queue = %report.queue,
            worker = %report.worker,
            exception = %report.failure.class(),
            error = %report.failure.message(),
            "Job failed"
        );
        Ok(())
    }
}

/// Forwards failures to downstream backends unless a retry is pending.
#[derive(Clone)]
pub struct RetrySuppressionBackend {
    store: Arc<dyn AttemptStore>,
    registry: JobRegistry,
    backends: Vec<Arc<dyn FailureBackend>>,
}

impl RetrySuppressionBackend {
    /// Create a backend with no downstream backends.
    #[must_use]
    pub fn new(store: Arc<dyn AttemptStore>, registry: JobRegistry) -> Self {
        Self {
            store,
            registry,
            backends: Vec::new(),
        }
    }

    /// Add a downstream backend.
    #[must_use]
    pub fn with_backend(mut self, backend: Arc<dyn FailureBackend>) -> Self {
        self.backends.push(backend);
        self
    }

    async fn forward(&self, report: &FailureReport) -> RetryResult<()> {
        for backend in &self.backends {
            backend.save(report).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl FailureBackend for RetrySuppressionBackend {
    async fn save(&self, report: &FailureReport) -> RetryResult<()> {
        let class = &report.payload.class;
        let Some(job) = self.registry.get(class) else {
            warn!(job = %class, "Failure for unknown job class");
            return self.forward(report).await;
        };
        let Some(policy) = job.retry_policy() else {
            return self.forward(report).await;
        };

        let args = &report.payload.args;
        let retry_key = keys::retry_key_for_job(job.as_ref(), args);
        let failure_key = keys::failure_key_for(&retry_key);

        if !self.store.exists(&retry_key).await? {
            self.store.delete(&failure_key).await?;
            return self.forward(report).await;
        }

        let attempt = read_attempt(self.store.as_ref(), &retry_key).await?.unwrap_or(0);
        // a jittered delay cannot be recomputed, so prefer the scheduled one
        let delay = report.retry_delay.unwrap_or_else(|| {
            policy.retry_delay(&DelayContext {
                attempt,
                exception: Some(report.failure.class()),
                args,
            })
        });
        if delay > 0 {
            let snapshot = serde_json::to_string(&FailureSnapshot::from_report(report))?;
            self.store.set_with_ttl(&failure_key, &snapshot, 2 * delay).await?;
            warn!(
                job = %class,
                retry_key = %retry_key,
                attempt,
                delay,
                exception = %report.failure.class(),
                "Suppressed failure, retry pending"
            );
        } else {
            debug!(job = %class, retry_key = %retry_key, "Suppressed failure, retrying immediately");
        }
        Ok(())
    }
}

impl std::fmt::Debug for RetrySuppressionBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetrySuppressionBackend")
            .field("registry", &self.registry)
            .field("backends", &self.backends.len())
            .finish_non_exhaustive()
    }
}
