//! Read-only views of retry state, plus cancel.

use std::sync::Arc;

use tracing::info;

use crate::error::{RetryError, RetryResult};
use crate::job::{JobPayload, JobRegistry};
use crate::keys;
use crate::queue::JobQueue;
use crate::store::{AttemptStore, read_attempt};
use crate::suppression::FailureSnapshot;

/// Inspection over the attempt store and the delayed schedule.
#[derive(Clone)]
pub struct RetryInspector {
    store: Arc<dyn AttemptStore>,
    queue: Arc<dyn JobQueue>,
    registry: JobRegistry,
}

impl RetryInspector {
    /// Create an inspector.
    #[must_use]
    pub fn new(store: Arc<dyn AttemptStore>, queue: Arc<dyn JobQueue>, registry: JobRegistry) -> Self {
        Self {
            store,
            queue,
            registry,
        }
    }

    /// Retry key of a queued job, honouring the job type's identifier.
    pub fn retry_key_for(&self, payload: &JobPayload) -> RetryResult<String> {
        let job = self
            .registry
            .get(&payload.class)
            .ok_or_else(|| RetryError::UnknownJob(payload.class.clone()))?;
        Ok(keys::retry_key_for_job(job.as_ref(), &payload.args))
    }

    /// Current attempt counter of a job, `None` when it is not retrying.
    pub async fn retry_attempts_for(&self, payload: &JobPayload) -> RetryResult<Option<i64>> {
        let retry_key = self.retry_key_for(payload)?;
        read_attempt(self.store.as_ref(), &retry_key).await
    }

    /// Failure snapshot stored for `retry_key`.
    pub async fn failure_for(&self, retry_key: &str) -> RetryResult<Option<FailureSnapshot>> {
        self.store
            .get(&keys::failure_key_for(retry_key))
            .await?
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(RetryError::from)
    }

    /// Failure snapshot of a queued job.
    pub async fn failure_for_payload(&self, payload: &JobPayload) -> RetryResult<Option<FailureSnapshot>> {
        let retry_key = self.retry_key_for(payload)?;
        self.failure_for(&retry_key).await
    }

    /// Drop a job's scheduled retries and its retry state. Returns how many
    /// scheduled entries were removed.
    pub async fn cancel(&self, payload: &JobPayload) -> RetryResult<usize> {
        let retry_key = self.retry_key_for(payload)?;
        let removed = self.queue.remove_delayed(&payload.class, &payload.args).await?;
        self.store.delete(&retry_key).await?;
        self.store.delete(&keys::failure_key_for(&retry_key)).await?;
        info!(job = %payload.class, retry_key = %retry_key, removed, "Cancelled retry");
        Ok(removed)
    }
}

impl std::fmt::Debug for RetryInspector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryInspector")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}
