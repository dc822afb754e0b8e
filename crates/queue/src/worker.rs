//! A minimal host worker.
//!
//! Pops payloads, runs them, and calls the retry hooks around each run.
//! Failures are handed to the failure backend after the retry decision, so
//! a suppression backend sees the retry key of a pending retry and the delay
//! it was scheduled with. A failure is reported even when the retry decision
//! itself errors.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::engine::{RetryEngine, RetryOutcome};
use crate::error::{RetryError, RetryResult};
use crate::exception::{JobFailure, classes};
use crate::job::{JobPayload, JobRegistry};
use crate::queue::JobSource;
use crate::suppression::{FailureBackend, FailureReport};

/// Result of processing one payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobRun {
    /// Nothing was ready.
    Idle,
    /// The job finished.
    Succeeded,
    /// The job failed. Carries the retry decision for job types with a policy.
    Failed(Option<RetryOutcome>),
    /// No job type is registered under the payload's class.
    UnknownJob,
}

/// Runs jobs from a [`JobSource`] with retry bookkeeping.
#[derive(Clone)]
pub struct RetryWorker {
    identity: String,
    queues: Vec<String>,
    registry: JobRegistry,
    engine: RetryEngine,
    source: Arc<dyn JobSource>,
    failures: Arc<dyn FailureBackend>,
}

impl RetryWorker {
    /// Create a worker polling `queues` in order.
    #[must_use]
    pub fn new(
        identity: impl Into<String>,
        queues: Vec<String>,
        registry: JobRegistry,
        engine: RetryEngine,
        source: Arc<dyn JobSource>,
        failures: Arc<dyn FailureBackend>,
    ) -> Self {
        Self {
            identity: identity.into(),
            queues,
            registry,
            engine,
            source,
            failures,
        }
    }

    /// Worker identity, as recorded in failure reports.
    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Process the next ready payload, if any.
    pub async fn perform_next(&self) -> RetryResult<JobRun> {
        match self.source.reserve(&self.queues).await? {
            Some(payload) => self.perform(&payload).await,
            None => Ok(JobRun::Idle),
        }
    }

    /// Run one payload.
    ///
    /// When the queue runs jobs inline, a job failure is returned as
    /// [`RetryError::Job`] instead of going through the retry machinery.
    pub async fn perform(&self, payload: &JobPayload) -> RetryResult<JobRun> {
        let Some(job) = self.registry.get(&payload.class) else {
            warn!(job = %payload.class, queue = %payload.queue, "Unknown job class");
            let failure = JobFailure::new(
                &classes::UNKNOWN_JOB,
                format!("no job type registered as {}", payload.class),
            );
            self.report(payload, failure, None).await?;
            return Ok(JobRun::UnknownJob);
        };

        let args = payload.args.as_slice();
        let mut ctx = match job.retry_policy() {
            Some(_) => Some(self.engine.before_attempt(job.as_ref(), args).await?),
            None => None,
        };
        let attempt = ctx.as_ref().map_or(0, |ctx| ctx.attempt());

        debug!(job = %payload.class, queue = %payload.queue, attempt, "Performing job");
        match job.perform(args, attempt).await {
            Ok(()) => {
                if let Some(ctx) = &ctx {
                    self.engine.after_success(ctx).await?;
                }
                Ok(JobRun::Succeeded)
            }
            Err(failure) => {
                if self.engine.queue().is_inline() {
                    return Err(RetryError::Job(failure));
                }
                let outcome = match ctx.as_mut() {
                    Some(ctx) => match self.engine.on_failure(job.as_ref(), ctx, &failure, args).await {
                        Ok(outcome) => Some(outcome),
                        Err(err) => {
                            // the job's own failure still goes to the backends
                            self.report(payload, failure, None).await?;
                            return Err(err);
                        }
                    },
                    None => None,
                };
                let delay = match &outcome {
                    Some(RetryOutcome::Retrying { delay, .. }) => Some(*delay),
                    _ => None,
                };
                self.report(payload, failure, delay).await?;
                Ok(JobRun::Failed(outcome))
            }
        }
    }

    async fn report(
        &self,
        payload: &JobPayload,
        failure: JobFailure,
        retry_delay: Option<i64>,
    ) -> RetryResult<()> {
        let mut report =
            FailureReport::new(payload.clone(), failure, self.identity.clone(), payload.queue.clone());
        if let Some(delay) = retry_delay {
            report = report.with_retry_delay(delay);
        }
        self.failures.save(&report).await
    }
}

impl std::fmt::Debug for RetryWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryWorker")
            .field("identity", &self.identity)
            .field("queues", &self.queues)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}
