//! Retry-or-give-up decision.

use serde_json::Value;
use tracing::debug;

use crate::error::{RetryError, RetryResult};
use crate::exception::{ExceptionClass, JobFailure};
use crate::job::Job;
use crate::policy::{CheckContext, RetryPolicy};

/// Returns true when no more retries are allowed after `attempt`.
///
/// A limit of 0 never retries and a negative limit retries forever.
#[must_use]
pub const fn retry_limit_reached(attempt: i64, retry_limit: i64) -> bool {
    if retry_limit == 0 {
        true
    } else if retry_limit > 0 {
        attempt >= retry_limit
    } else {
        false
    }
}

/// Returns true when the policy's exception filter admits `class`.
#[must_use]
pub fn retry_exception(policy: &RetryPolicy, class: &ExceptionClass) -> bool {
    policy.exception_filter().admits(class)
}

/// Decide whether `failure` at `attempt` should be retried.
///
/// Criteria checks only run when the exception filter rejects the failure,
/// and stop at the first check that returns true. A check that errors aborts
/// the decision.
pub fn retry_criteria_valid(
    job: &dyn Job,
    policy: &RetryPolicy,
    failure: &JobFailure,
    args: &[Value],
    attempt: i64,
) -> RetryResult<bool> {
    if retry_limit_reached(attempt, policy.retry_limit()) {
        debug!(job = job.name(), attempt, limit = policy.retry_limit(), "Retry limit reached");
        return Ok(false);
    }

    if retry_exception(policy, failure.class()) {
        return Ok(true);
    }

    let ctx = CheckContext {
        job,
        failure,
        args,
        attempt,
    };
    for (index, check) in policy.criteria_checks().iter().enumerate() {
        if check(&ctx).map_err(RetryError::Callback)? {
            debug!(job = job.name(), check = index, exception = %failure.class(), "Criteria check allowed retry");
            return Ok(true);
        }
    }
    Ok(false)
}
