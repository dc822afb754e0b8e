//! Try-again and give-up callback registries.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::error::{RetryError, RetryResult};
use crate::exception::JobFailure;

/// A callback run when a failed job is retried or given up on.
pub type RetryCallback = Arc<dyn Fn(&JobFailure, &[Value]) -> anyhow::Result<()> + Send + Sync>;

/// Ordered try-again and give-up callbacks.
///
/// Cloning copies the lists, so a policy extended from another one gets a
/// snapshot of the parent's callbacks.
#[derive(Clone, Default)]
pub struct RetryCallbacks {
    try_again: Vec<RetryCallback>,
    give_up: Vec<RetryCallback>,
}

impl RetryCallbacks {
    /// Create empty registries.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback run before a retry is enqueued.
    pub fn add_try_again(&mut self, callback: RetryCallback) {
        self.try_again.push(callback);
    }

    /// Register a callback run when retrying is abandoned.
    pub fn add_give_up(&mut self, callback: RetryCallback) {
        self.give_up.push(callback);
    }

    /// Number of try-again callbacks.
    #[must_use]
    pub fn try_again_len(&self) -> usize {
        self.try_again.len()
    }

    /// Number of give-up callbacks.
    #[must_use]
    pub fn give_up_len(&self) -> usize {
        self.give_up.len()
    }

    /// Run the try-again callbacks in registration order.
    ///
    /// Stops at the first callback error.
    pub fn run_try_again(&self, failure: &JobFailure, args: &[Value]) -> RetryResult<()> {
        run_all("try_again", &self.try_again, failure, args)
    }

    /// Run the give-up callbacks in registration order.
    ///
    /// Stops at the first callback error.
    pub fn run_give_up(&self, failure: &JobFailure, args: &[Value]) -> RetryResult<()> {
        run_all("give_up", &self.give_up, failure, args)
    }
}

fn run_all(
    kind: &'static str,
    callbacks: &[RetryCallback],
    failure: &JobFailure,
    args: &[Value],
) -> RetryResult<()> {
    for (index, callback) in callbacks.iter().enumerate() {
        debug!(callback = kind, index, exception = %failure.class(), "Running retry callback");
        callback(failure, args).map_err(RetryError::Callback)?;
    }
    Ok(())
}

impl fmt::Debug for RetryCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryCallbacks")
            .field("try_again", &self.try_again.len())
            .field("give_up", &self.give_up.len())
            .finish()
    }
}
