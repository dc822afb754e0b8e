//! Retry policies for background jobs.
//!
//! This crate decides, for a job that just failed, whether to run it again,
//! when, and where, and keeps the attempt bookkeeping in a shared store:
//!
//! - **Policies**: retry limits, exception filters, delays, criteria checks
//!   and callbacks, validated when built
//! - **Backoff**: constant, per-exception and exponential delays with jitter
//! - **Engine**: `before_attempt` / `after_success` / `on_failure` hooks
//!   around each job execution
//! - **Suppression**: keeps failures of jobs with a pending retry out of the
//!   downstream failure backends
//! - **Inspection**: attempt counts, failure snapshots and cancel
//!
//! The queue transport and the store are collaborators behind the
//! [`JobQueue`] and [`AttemptStore`] traits.

pub mod backoff;
pub mod criteria;
pub mod engine;
pub mod error;
pub mod exception;
pub mod hooks;
pub mod inspect;
pub mod job;
pub mod keys;
pub mod policy;
pub mod queue;
pub mod redis_store;
pub mod store;
pub mod suppression;
pub mod worker;

pub use backoff::{BackoffStrategy, DEFAULT_BACKOFF_STRATEGY, DelayContext, ExceptionDelay, ExceptionDelays, RetryDelay};
pub use engine::{AttemptContext, RetryEngine, RetryOutcome};
pub use error::{ConfigError, RetryError, RetryResult};
pub use exception::{ExceptionClass, JobFailure};
pub use hooks::{RetryCallback, RetryCallbacks};
pub use inspect::RetryInspector;
pub use job::{Job, JobPayload, JobRegistry};
pub use keys::{failure_key_for, redis_retry_key};
pub use policy::{CheckContext, ExceptionFilter, KeyExpiry, RetryPolicy, RetryPolicyBuilder};
pub use queue::{DelayedJob, JobQueue, JobSource, MemoryQueue};
pub use redis_store::RedisAttemptStore;
pub use store::{AttemptStore, MemoryStore};
pub use suppression::{FailureBackend, FailureReport, FailureSnapshot, LoggingFailureBackend, RetrySuppressionBackend};
pub use worker::{JobRun, RetryWorker};
