//! Retry state machine.
//!
//! The host worker calls [`RetryEngine::before_attempt`] before running a
//! job, then either [`RetryEngine::after_success`] or
//! [`RetryEngine::on_failure`]. The attempt counter lives in the store under
//! the job's retry key:
//!
//! ```text
//! absent -> -1 (setnx) -> 0, 1, 2 ... (incr per run) -> deleted (success / give up)
//! ```
//!
//! The attempt number read at the start of a run travels with the
//! [`AttemptContext`] rather than living on the job type.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::backoff::DelayContext;
use crate::criteria;
use crate::error::{RetryError, RetryResult};
use crate::exception::JobFailure;
use crate::job::Job;
use crate::keys;
use crate::policy::RetryPolicy;
use crate::queue::JobQueue;
use crate::store::{AttemptStore, read_attempt};

/// State of one job execution, from `before_attempt` to its outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptContext {
    retry_key: String,
    attempt: i64,
    inline: bool,
    failure_handled: bool,
}

impl AttemptContext {
    /// Retry key of the job being run.
    #[must_use]
    pub fn retry_key(&self) -> &str {
        &self.retry_key
    }

    /// Attempt number: 0 on the first run, 1 on the first retry.
    #[must_use]
    pub const fn attempt(&self) -> i64 {
        self.attempt
    }

    /// Jobs run inline never touch the store.
    #[must_use]
    pub const fn is_inline(&self) -> bool {
        self.inline
    }

    /// Returns true once a failure of this execution has been handled.
    #[must_use]
    pub const fn failure_handled(&self) -> bool {
        self.failure_handled
    }
}

/// What `on_failure` decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Inline execution; the failure belongs to the caller.
    Inline,
    /// This execution's failure was already handled.
    AlreadyHandled,
    /// A retry was enqueued.
    Retrying {
        /// Job type that was enqueued.
        job_type: String,
        /// Queue it went to.
        queue: String,
        /// Delay in seconds; `<= 0` means enqueued immediately.
        delay: i64,
        /// Attempt that failed.
        attempt: i64,
    },
    /// No further retries.
    GaveUp {
        /// Attempt that failed.
        attempt: i64,
    },
}

/// Drives retry bookkeeping around job executions.
#[derive(Clone)]
pub struct RetryEngine {
    store: Arc<dyn AttemptStore>,
    queue: Arc<dyn JobQueue>,
}

impl RetryEngine {
    /// Create an engine over a store and a queue.
    #[must_use]
    pub fn new(store: Arc<dyn AttemptStore>, queue: Arc<dyn JobQueue>) -> Self {
        Self { store, queue }
    }

    /// The attempt store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn AttemptStore> {
        &self.store
    }

    /// The queue collaborator.
    #[must_use]
    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    /// A context for a job whose `before_attempt` ran elsewhere, such as a
    /// job whose process died. Touches nothing.
    #[must_use]
    pub fn context_for(&self, job: &dyn Job, args: &[Value]) -> AttemptContext {
        AttemptContext {
            retry_key: keys::retry_key_for_job(job, args),
            attempt: 0,
            inline: self.queue.is_inline(),
            failure_handled: false,
        }
    }

    /// Record the start of an attempt and return its context.
    pub async fn before_attempt(&self, job: &dyn Job, args: &[Value]) -> RetryResult<AttemptContext> {
        let policy = policy_for(job)?;
        let mut ctx = self.context_for(job, args);
        if ctx.inline {
            return Ok(ctx);
        }

        self.store.set_if_absent(&ctx.retry_key, "-1").await?;
        ctx.attempt = self.store.increment(&ctx.retry_key).await?;

        if let Some(ttl) = policy.retry_key_ttl(ctx.attempt, args) {
            self.store.expire(&ctx.retry_key, ttl).await?;
        }

        debug!(job = job.name(), retry_key = %ctx.retry_key, attempt = ctx.attempt, "Starting attempt");
        Ok(ctx)
    }

    /// Clear retry state after a successful run.
    pub async fn after_success(&self, ctx: &AttemptContext) -> RetryResult<()> {
        if ctx.inline {
            return Ok(());
        }
        self.clean_retry_key(&ctx.retry_key).await
    }

    /// Decide between retrying and giving up after a failed run.
    ///
    /// Calling this again for the same execution is a no-op. When a criteria
    /// check or callback errors, nothing is enqueued, the retry state is
    /// cleared and the error is returned.
    pub async fn on_failure(
        &self,
        job: &dyn Job,
        ctx: &mut AttemptContext,
        failure: &JobFailure,
        args: &[Value],
    ) -> RetryResult<RetryOutcome> {
        if ctx.inline {
            return Ok(RetryOutcome::Inline);
        }
        if ctx.failure_handled {
            return Ok(RetryOutcome::AlreadyHandled);
        }
        let policy = policy_for(job)?;

        if failure.is_dirty_exit() {
            ctx.attempt = read_attempt(self.store.as_ref(), &ctx.retry_key).await?.unwrap_or(0);
            debug!(job = job.name(), attempt = ctx.attempt, "Recovered attempt after dirty exit");
        }

        if policy.is_ignored(failure) {
            ctx.attempt = self.store.decrement(&ctx.retry_key).await?;
            debug!(job = job.name(), exception = %failure.class(), attempt = ctx.attempt, "Ignored exception, attempt not counted");
        }

        let decision = match criteria::retry_criteria_valid(job, policy, failure, args, ctx.attempt) {
            Ok(true) => self.try_again(job, policy, ctx, failure, args).await,
            Ok(false) => self.give_up(job, policy, ctx, failure, args).await,
            Err(err) => Err(err),
        };

        match decision {
            Ok(outcome) => {
                ctx.failure_handled = true;
                Ok(outcome)
            }
            // a failing check or callback ends the retry chain
            Err(err @ RetryError::Callback(_)) => {
                ctx.failure_handled = true;
                self.clean_retry_key(&ctx.retry_key).await?;
                warn!(
                    job = job.name(),
                    retry_key = %ctx.retry_key,
                    attempt = ctx.attempt,
                    error = %err,
                    "Retry callback failed, giving up"
                );
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    async fn try_again(
        &self,
        job: &dyn Job,
        policy: &RetryPolicy,
        ctx: &AttemptContext,
        failure: &JobFailure,
        args: &[Value],
    ) -> RetryResult<RetryOutcome> {
        policy.callbacks().run_try_again(failure, args)?;

        let delay = policy.retry_delay(&DelayContext {
            attempt: ctx.attempt,
            exception: Some(failure.class()),
            args,
        });
        let target = policy.retry_job_delegate().unwrap_or_else(|| job.name());
        let queue = match job.retry_queue(failure, args) {
            Some(queue) => queue,
            None => self.queue.resolve_queue(target)?,
        };

        // marks the retry as pending for failure suppression
        self.store.set_if_absent(&ctx.retry_key, "-1").await?;

        let retry_args = job.retry_args(failure, args);
        if delay <= 0 {
            self.queue.enqueue_to(&queue, target, retry_args).await?;
        } else {
            self.queue
                .enqueue_delayed_to_queue(&queue, Duration::from_secs(delay as u64), target, retry_args)
                .await?;
        }

        if target != job.name() {
            self.store.delete(&ctx.retry_key).await?;
        }

        info!(
            job = job.name(),
            retry_key = %ctx.retry_key,
            attempt = ctx.attempt,
            delay,
            target = %target,
            queue = %queue,
            exception = %failure.class(),
            "Retrying job"
        );

        let pause = policy.sleep_after_requeue();
        if !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }

        Ok(RetryOutcome::Retrying {
            job_type: target.to_string(),
            queue,
            delay,
            attempt: ctx.attempt,
        })
    }

    async fn give_up(
        &self,
        job: &dyn Job,
        policy: &RetryPolicy,
        ctx: &AttemptContext,
        failure: &JobFailure,
        args: &[Value],
    ) -> RetryResult<RetryOutcome> {
        policy.callbacks().run_give_up(failure, args)?;
        self.clean_retry_key(&ctx.retry_key).await?;
        info!(
            job = job.name(),
            retry_key = %ctx.retry_key,
            attempt = ctx.attempt,
            exception = %failure.class(),
            "Giving up on job"
        );
        Ok(RetryOutcome::GaveUp { attempt: ctx.attempt })
    }

    async fn clean_retry_key(&self, retry_key: &str) -> RetryResult<()> {
        self.store.delete(retry_key).await?;
        self.store.delete(&keys::failure_key_for(retry_key)).await?;
        debug!(retry_key = %retry_key, "Cleared retry state");
        Ok(())
    }
}

fn policy_for(job: &dyn Job) -> RetryResult<&RetryPolicy> {
    job.retry_policy()
        .ok_or_else(|| RetryError::NotRetryable(job.name().to_string()))
}

impl std::fmt::Debug for RetryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryEngine")
            .field("inline", &self.queue.is_inline())
            .finish_non_exhaustive()
    }
}
