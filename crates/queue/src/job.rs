//! Job definitions and the job-type registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::exception::JobFailure;
use crate::keys;
use crate::policy::RetryPolicy;

/// A queued job: class name, ordered arguments and the queue it sits in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    /// Job type name.
    pub class: String,
    /// Job arguments.
    pub args: Vec<Value>,
    /// Queue the job was pushed to.
    pub queue: String,
}

impl JobPayload {
    /// Create a new payload.
    pub fn new(class: impl Into<String>, args: Vec<Value>, queue: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            args,
            queue: queue.into(),
        }
    }
}

/// A job type.
///
/// Only [`name`](Job::name), [`queue`](Job::queue) and
/// [`perform`](Job::perform) are required. A job takes part in retries by
/// returning a policy from [`retry_policy`](Job::retry_policy); the remaining
/// methods are extension points with sensible defaults.
#[async_trait]
pub trait Job: Send + Sync {
    /// Job type name, used in retry keys and payloads.
    fn name(&self) -> &str;

    /// Default queue for this job type.
    fn queue(&self) -> &str;

    /// Run the job. `attempt` is the current attempt number (0 on the first run).
    async fn perform(&self, args: &[Value], attempt: i64) -> Result<(), JobFailure>;

    /// Retry policy, or `None` for job types that never retry.
    fn retry_policy(&self) -> Option<&RetryPolicy> {
        None
    }

    /// Identifier segment of the retry key.
    fn retry_identifier(&self, args: &[Value]) -> Option<String> {
        keys::default_identifier(args)
    }

    /// Arguments to enqueue the retry with.
    fn retry_args(&self, _failure: &JobFailure, args: &[Value]) -> Vec<Value> {
        args.to_vec()
    }

    /// Queue to enqueue the retry into. `None` uses the retried job type's default queue.
    fn retry_queue(&self, _failure: &JobFailure, _args: &[Value]) -> Option<String> {
        None
    }
}

/// Lookup of job types by name.
#[derive(Clone, Default)]
pub struct JobRegistry {
    jobs: HashMap<String, Arc<dyn Job>>,
}

impl JobRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job type under its own name, replacing any previous one.
    pub fn register(&mut self, job: Arc<dyn Job>) {
        self.jobs.insert(job.name().to_string(), job);
    }

    /// Builder-style [`register`](Self::register).
    #[must_use]
    pub fn with(mut self, job: Arc<dyn Job>) -> Self {
        self.register(job);
        self
    }

    /// Find a job type by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Job>> {
        self.jobs.get(name).cloned()
    }

    /// Find a job type that takes part in retries.
    #[must_use]
    pub fn get_retryable(&self, name: &str) -> Option<Arc<dyn Job>> {
        self.get(name).filter(|job| job.retry_policy().is_some())
    }

    /// Default queue of a registered job type.
    #[must_use]
    pub fn queue_for(&self, name: &str) -> Option<String> {
        self.jobs.get(name).map(|job| job.queue().to_string())
    }

    /// Number of registered job types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Returns true when nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.jobs.keys().collect();
        names.sort();
        f.debug_struct("JobRegistry").field("jobs", &names).finish()
    }
}
