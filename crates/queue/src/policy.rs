//! Per-job-type retry policy.
//!
//! Policies are immutable once built. [`RetryPolicyBuilder::build`] is where
//! configuration mistakes surface, before any job runs. A job type that
//! specialises another one starts from [`RetryPolicy::extend`], which copies
//! the parent's settings, checks and callbacks.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::backoff::{AttemptDelayFn, BackoffStrategy, DelayContext, ExceptionDelays, RetryDelay};
use crate::error::ConfigError;
use crate::exception::{ExceptionClass, JobFailure};
use crate::hooks::{RetryCallback, RetryCallbacks};
use crate::job::Job;

/// Which failure classes a policy retries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ExceptionFilter {
    /// Every failure is retryable.
    #[default]
    Any,
    /// Only failures of these classes (or subclasses).
    RetryOnly(Vec<&'static ExceptionClass>),
    /// Every failure except these classes (or subclasses).
    FatalOnly(Vec<&'static ExceptionClass>),
}

impl ExceptionFilter {
    /// Returns true when a failure of `class` may be retried.
    #[must_use]
    pub fn admits(&self, class: &ExceptionClass) -> bool {
        match self {
            Self::Any => true,
            Self::RetryOnly(classes) => class.is_any_of(classes),
            Self::FatalOnly(classes) => !class.is_any_of(classes),
        }
    }
}

/// How long the retry key outlives the retry delay.
#[derive(Clone)]
pub enum KeyExpiry {
    /// Same extension for every attempt.
    Fixed(i64),
    /// Extension computed from the attempt number.
    PerAttempt(AttemptDelayFn),
}

impl KeyExpiry {
    /// Extension in seconds for `attempt`.
    #[must_use]
    pub fn seconds(&self, attempt: i64) -> i64 {
        match self {
            Self::Fixed(seconds) => *seconds,
            Self::PerAttempt(f) => f(attempt),
        }
    }
}

impl fmt::Debug for KeyExpiry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(seconds) => f.debug_tuple("Fixed").field(seconds).finish(),
            Self::PerAttempt(_) => f.write_str("PerAttempt(..)"),
        }
    }
}

/// What a criteria check gets to look at.
pub struct CheckContext<'a> {
    /// The job type being evaluated.
    pub job: &'a dyn Job,
    /// The failure that triggered evaluation.
    pub failure: &'a JobFailure,
    /// Job arguments.
    pub args: &'a [Value],
    /// Current attempt number.
    pub attempt: i64,
}

/// User predicate that can force a retry for a failure the exception filter rejects.
pub type CriteriaCheck = Arc<dyn Fn(&CheckContext<'_>) -> anyhow::Result<bool> + Send + Sync>;

/// Retry behaviour of one job type.
#[derive(Clone)]
pub struct RetryPolicy {
    retry_limit: i64,
    delay: RetryDelay,
    exception_filter: ExceptionFilter,
    // retry exceptions taken from the delay table rather than configured
    filter_from_table: bool,
    ignore_exceptions: Vec<&'static ExceptionClass>,
    criteria_checks: Vec<CriteriaCheck>,
    callbacks: RetryCallbacks,
    retry_job_delegate: Option<String>,
    expire_retry_key_after: Option<KeyExpiry>,
    sleep_after_requeue: Duration,
}

impl RetryPolicy {
    /// Start a new policy.
    #[must_use]
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::default()
    }

    /// Start a policy from a copy of `parent`.
    ///
    /// Checks and callbacks are copied, so the child is unaffected by
    /// whatever is built from the parent afterwards. Retry exceptions the
    /// parent took from its delay table are re-derived from the child's table.
    #[must_use]
    pub fn extend(parent: &Self) -> RetryPolicyBuilder {
        let (retry_exceptions, fatal_exceptions) = match &parent.exception_filter {
            _ if parent.filter_from_table => (None, None),
            ExceptionFilter::Any => (None, None),
            ExceptionFilter::RetryOnly(classes) => (Some(classes.clone()), None),
            ExceptionFilter::FatalOnly(classes) => (None, Some(classes.clone())),
        };
        RetryPolicyBuilder {
            retry_limit: Some(parent.retry_limit),
            delay: Some(parent.delay.clone()),
            retry_exceptions,
            fatal_exceptions,
            ignore_exceptions: parent.ignore_exceptions.clone(),
            criteria_checks: parent.criteria_checks.clone(),
            callbacks: parent.callbacks.clone(),
            retry_job_delegate: parent.retry_job_delegate.clone(),
            expire_retry_key_after: parent.expire_retry_key_after.clone(),
            sleep_after_requeue: parent.sleep_after_requeue,
        }
    }

    /// 0 never retries, N > 0 retries up to N times, negative retries forever.
    #[must_use]
    pub const fn retry_limit(&self) -> i64 {
        self.retry_limit
    }

    /// Configured delay calculation.
    #[must_use]
    pub const fn delay(&self) -> &RetryDelay {
        &self.delay
    }

    /// Which failure classes are retryable.
    #[must_use]
    pub const fn exception_filter(&self) -> &ExceptionFilter {
        &self.exception_filter
    }

    /// Classes whose failures do not count as an attempt.
    #[must_use]
    pub fn ignore_exceptions(&self) -> &[&'static ExceptionClass] {
        &self.ignore_exceptions
    }

    /// Criteria checks, in registration order.
    #[must_use]
    pub fn criteria_checks(&self) -> &[CriteriaCheck] {
        &self.criteria_checks
    }

    /// Try-again and give-up callbacks.
    #[must_use]
    pub const fn callbacks(&self) -> &RetryCallbacks {
        &self.callbacks
    }

    /// Job type enqueued in place of this one on retry.
    #[must_use]
    pub fn retry_job_delegate(&self) -> Option<&str> {
        self.retry_job_delegate.as_deref()
    }

    /// Retry key lifetime beyond the retry delay.
    #[must_use]
    pub const fn expire_retry_key_after(&self) -> Option<&KeyExpiry> {
        self.expire_retry_key_after.as_ref()
    }

    /// Pause after enqueueing a retry.
    #[must_use]
    pub const fn sleep_after_requeue(&self) -> Duration {
        self.sleep_after_requeue
    }

    /// Retry delay in seconds.
    #[must_use]
    pub fn retry_delay(&self, ctx: &DelayContext<'_>) -> i64 {
        self.delay.resolve(ctx)
    }

    /// TTL to put on the retry key before `attempt` runs, if key expiry is configured.
    #[must_use]
    pub fn retry_key_ttl(&self, attempt: i64, args: &[Value]) -> Option<i64> {
        self.expire_retry_key_after.as_ref().map(|expiry| {
            let delay = self.retry_delay(&DelayContext::before_attempt(attempt, args));
            delay.max(0) + expiry.seconds(attempt)
        })
    }

    /// Returns true when `failure` or anything in its cause chain is ignored.
    #[must_use]
    pub fn is_ignored(&self, failure: &JobFailure) -> bool {
        !self.ignore_exceptions.is_empty()
            && failure
                .raised_classes()
                .any(|class| class.is_any_of(&self.ignore_exceptions))
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("retry_limit", &self.retry_limit)
            .field("delay", &self.delay)
            .field("exception_filter", &self.exception_filter)
            .field("filter_from_table", &self.filter_from_table)
            .field("ignore_exceptions", &self.ignore_exceptions)
            .field("criteria_checks", &self.criteria_checks.len())
            .field("callbacks", &self.callbacks)
            .field("retry_job_delegate", &self.retry_job_delegate)
            .field("expire_retry_key_after", &self.expire_retry_key_after)
            .field("sleep_after_requeue", &self.sleep_after_requeue)
            .finish()
    }
}

/// Builder for [`RetryPolicy`].
///
/// Cloning a builder snapshots everything registered so far.
#[derive(Clone, Default)]
pub struct RetryPolicyBuilder {
    retry_limit: Option<i64>,
    delay: Option<RetryDelay>,
    retry_exceptions: Option<Vec<&'static ExceptionClass>>,
    fatal_exceptions: Option<Vec<&'static ExceptionClass>>,
    ignore_exceptions: Vec<&'static ExceptionClass>,
    criteria_checks: Vec<CriteriaCheck>,
    callbacks: RetryCallbacks,
    retry_job_delegate: Option<String>,
    expire_retry_key_after: Option<KeyExpiry>,
    sleep_after_requeue: Duration,
}

impl RetryPolicyBuilder {
    /// Maximum number of retries. See [`RetryPolicy::retry_limit`].
    #[must_use]
    pub const fn retry_limit(mut self, limit: i64) -> Self {
        self.retry_limit = Some(limit);
        self
    }

    /// Delay calculation.
    #[must_use]
    pub fn retry_delay(mut self, delay: RetryDelay) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Constant delay in seconds.
    #[must_use]
    pub fn retry_delay_seconds(self, seconds: i64) -> Self {
        self.retry_delay(RetryDelay::Constant(seconds))
    }

    /// Exponential backoff. Without an explicit limit, the limit becomes the
    /// number of delays in the strategy.
    #[must_use]
    pub fn backoff(self, strategy: BackoffStrategy) -> Self {
        self.retry_delay(RetryDelay::Backoff(strategy))
    }

    /// Per-exception delays. Without explicit retry or fatal exceptions, the
    /// table's classes become the retry exceptions.
    #[must_use]
    pub fn exception_delays(self, table: ExceptionDelays) -> Self {
        self.retry_delay(RetryDelay::PerException(table))
    }

    /// Only retry failures of these classes.
    #[must_use]
    pub fn retry_exceptions(mut self, classes: &[&'static ExceptionClass]) -> Self {
        self.retry_exceptions = Some(classes.to_vec());
        self
    }

    /// Never retry failures of these classes.
    #[must_use]
    pub fn fatal_exceptions(mut self, classes: &[&'static ExceptionClass]) -> Self {
        self.fatal_exceptions = Some(classes.to_vec());
        self
    }

    /// Failures of these classes are retried without counting as an attempt.
    #[must_use]
    pub fn ignore_exceptions(mut self, classes: &[&'static ExceptionClass]) -> Self {
        self.ignore_exceptions = classes.to_vec();
        self
    }

    /// Add a criteria check.
    #[must_use]
    pub fn criteria_check<F>(mut self, check: F) -> Self
    where
        F: Fn(&CheckContext<'_>) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        self.criteria_checks.push(Arc::new(check));
        self
    }

    /// Add a try-again callback.
    #[must_use]
    pub fn on_try_again<F>(mut self, callback: F) -> Self
    where
        F: Fn(&JobFailure, &[Value]) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.callbacks.add_try_again(Arc::new(callback) as RetryCallback);
        self
    }

    /// Add a give-up callback.
    #[must_use]
    pub fn on_give_up<F>(mut self, callback: F) -> Self
    where
        F: Fn(&JobFailure, &[Value]) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.callbacks.add_give_up(Arc::new(callback) as RetryCallback);
        self
    }

    /// Enqueue this job type instead of the failed one when retrying.
    #[must_use]
    pub fn retry_job_delegate(mut self, job_type: impl Into<String>) -> Self {
        self.retry_job_delegate = Some(job_type.into());
        self
    }

    /// Keep the retry key alive this long beyond the retry delay.
    #[must_use]
    pub fn expire_retry_key_after(mut self, expiry: KeyExpiry) -> Self {
        self.expire_retry_key_after = Some(expiry);
        self
    }

    /// Pause the worker after enqueueing a retry.
    #[must_use]
    pub const fn sleep_after_requeue(mut self, pause: Duration) -> Self {
        self.sleep_after_requeue = pause;
        self
    }

    /// Validate and build the policy.
    pub fn build(self) -> Result<RetryPolicy, ConfigError> {
        let delay = self.delay.unwrap_or_default();

        let filter_from_table = self.retry_exceptions.is_none()
            && self.fatal_exceptions.is_none()
            && matches!(delay, RetryDelay::PerException(_));
        let exception_filter = match (self.retry_exceptions, self.fatal_exceptions) {
            (Some(_), Some(_)) => return Err(ConfigError::AmbiguousExceptionFilter),
            (Some(classes), None) => ExceptionFilter::RetryOnly(classes),
            (None, Some(classes)) => ExceptionFilter::FatalOnly(classes),
            (None, None) => match &delay {
                RetryDelay::PerException(table) => {
                    ExceptionFilter::RetryOnly(table.classes().collect())
                }
                _ => ExceptionFilter::Any,
            },
        };

        for ignored in &self.ignore_exceptions {
            match &exception_filter {
                ExceptionFilter::RetryOnly(classes) if !ignored.is_any_of(classes) => {
                    return Err(ConfigError::IgnoredNotRetryable(ignored.name()));
                }
                ExceptionFilter::FatalOnly(classes) if ignored.is_any_of(classes) => {
                    return Err(ConfigError::IgnoredButFatal(ignored.name()));
                }
                _ => {}
            }
        }

        let retry_limit = self.retry_limit.unwrap_or_else(|| match &delay {
            RetryDelay::Backoff(strategy) => strategy.len() as i64,
            RetryDelay::PerException(table) => table.longest_sequence().map_or(1, |len| len as i64),
            _ => 1,
        });

        Ok(RetryPolicy {
            retry_limit,
            delay,
            exception_filter,
            filter_from_table,
            ignore_exceptions: self.ignore_exceptions,
            criteria_checks: self.criteria_checks,
            callbacks: self.callbacks,
            retry_job_delegate: self.retry_job_delegate,
            expire_retry_key_after: self.expire_retry_key_after,
            sleep_after_requeue: self.sleep_after_requeue,
        })
    }
}

impl fmt::Debug for RetryPolicyBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicyBuilder")
            .field("retry_limit", &self.retry_limit)
            .field("delay", &self.delay)
            .field("retry_exceptions", &self.retry_exceptions)
            .field("fatal_exceptions", &self.fatal_exceptions)
            .field("criteria_checks", &self.criteria_checks.len())
            .field("callbacks", &self.callbacks)
            .finish_non_exhaustive()
    }
}
