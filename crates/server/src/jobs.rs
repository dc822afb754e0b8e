//! Demo job types.

use std::sync::Arc;

use async_trait::async_trait;
use jobretry_queue::exception::classes::RUNTIME_ERROR;
use jobretry_queue::{
    BackoffStrategy, ConfigError, Job, JobFailure, JobQueue, JobRegistry, RetryPolicy, RetryResult,
};
use serde_json::{Value, json};
use tracing::info;

const SUCCESSFUL_QUEUE: &str = "testing_successful";
const FAILURE_QUEUE: &str = "testing_failure";

/// Does nothing.
pub struct SuccessfulJob;

#[async_trait]
impl Job for SuccessfulJob {
    fn name(&self) -> &str {
        "SuccessfulJob"
    }

    fn queue(&self) -> &str {
        SUCCESSFUL_QUEUE
    }

    async fn perform(&self, args: &[Value], _attempt: i64) -> Result<(), JobFailure> {
        info!(?args, "SuccessfulJob done");
        Ok(())
    }
}

/// Always fails and never retries.
pub struct FailingJob;

#[async_trait]
impl Job for FailingJob {
    fn name(&self) -> &str {
        "FailingJob"
    }

    fn queue(&self) -> &str {
        FAILURE_QUEUE
    }

    async fn perform(&self, _args: &[Value], _attempt: i64) -> Result<(), JobFailure> {
        Err(JobFailure::new(&RUNTIME_ERROR, "this job is expected to fail!"))
    }
}

/// Always fails, retried four times three seconds apart.
pub struct FailingWithRetryJob {
    policy: RetryPolicy,
}

impl FailingWithRetryJob {
    /// Build the job with its retry policy.
    pub fn new() -> Result<Self, ConfigError> {
        let policy = RetryPolicy::builder()
            .retry_limit(4)
            .retry_delay_seconds(3)
            .on_give_up(|failure, args| {
                info!(exception = %failure.class(), ?args, "FailingWithRetryJob gave up");
                Ok(())
            })
            .build()?;
        Ok(Self { policy })
    }
}

#[async_trait]
impl Job for FailingWithRetryJob {
    fn name(&self) -> &str {
        "FailingWithRetryJob"
    }

    fn queue(&self) -> &str {
        FAILURE_QUEUE
    }

    async fn perform(&self, _args: &[Value], attempt: i64) -> Result<(), JobFailure> {
        Err(JobFailure::new(
            &RUNTIME_ERROR,
            format!("this job is expected to fail! but it will retry =) (attempt {attempt})"),
        ))
    }

    fn retry_policy(&self) -> Option<&RetryPolicy> {
        Some(&self.policy)
    }
}

/// Succeeds on its third run, with jittered exponential backoff in between.
pub struct BackoffJob {
    policy: RetryPolicy,
}

impl BackoffJob {
    /// Build the job with its retry policy.
    pub fn new() -> Result<Self, ConfigError> {
        let strategy = BackoffStrategy::new(vec![0, 2, 5])?.with_multiplicands(0.5, 1.5)?;
        Ok(Self {
            policy: RetryPolicy::builder().backoff(strategy).build()?,
        })
    }
}

#[async_trait]
impl Job for BackoffJob {
    fn name(&self) -> &str {
        "BackoffJob"
    }

    fn queue(&self) -> &str {
        FAILURE_QUEUE
    }

    async fn perform(&self, _args: &[Value], attempt: i64) -> Result<(), JobFailure> {
        if attempt < 2 {
            return Err(JobFailure::new(&RUNTIME_ERROR, format!("not yet (attempt {attempt})")));
        }
        info!(attempt, "BackoffJob finally succeeded");
        Ok(())
    }

    fn retry_policy(&self) -> Option<&RetryPolicy> {
        Some(&self.policy)
    }
}

/// Every demo job type.
pub fn registry() -> Result<JobRegistry, ConfigError> {
    Ok(JobRegistry::new()
        .with(Arc::new(SuccessfulJob))
        .with(Arc::new(FailingJob))
        .with(Arc::new(FailingWithRetryJob::new()?))
        .with(Arc::new(BackoffJob::new()?)))
}

/// Enqueue one of each demo job.
pub async fn seed(queue: &dyn JobQueue) -> RetryResult<()> {
    queue.enqueue("SuccessfulJob", vec![json!("hello")]).await?;
    queue.enqueue("FailingJob", vec![json!(1)]).await?;
    queue.enqueue("FailingWithRetryJob", vec![json!("retry"), json!(2)]).await?;
    queue.enqueue("BackoffJob", vec![]).await?;
    Ok(())
}
