//! Exception classes and job failures.
//!
//! Retry decisions are made against the *class* of a failure. Classes form a
//! single-parent hierarchy declared as statics, so "is this failure a kind of
//! that one" is a walk up the parent chain:
//!
//! ```
//! use jobretry_queue::exception::{ExceptionClass, JobFailure, classes};
//!
//! static TIMEOUT: ExceptionClass = ExceptionClass::new("Timeout", &classes::STANDARD_ERROR);
//! static READ_TIMEOUT: ExceptionClass = ExceptionClass::new("ReadTimeout", &TIMEOUT);
//!
//! let failure = JobFailure::new(&READ_TIMEOUT, "socket stalled");
//! assert!(failure.is_a(&TIMEOUT));
//! assert!(!TIMEOUT.is_a(&READ_TIMEOUT));
//! ```

use std::fmt;

/// A named failure class with an optional parent class.
#[derive(Debug)]
pub struct ExceptionClass {
    name: &'static str,
    parent: Option<&'static ExceptionClass>,
}

impl ExceptionClass {
    /// Declare a class without a parent.
    #[must_use]
    pub const fn root(name: &'static str) -> Self {
        Self { name, parent: None }
    }

    /// Declare a class deriving from `parent`.
    #[must_use]
    pub const fn new(name: &'static str, parent: &'static Self) -> Self {
        Self {
            name,
            parent: Some(parent),
        }
    }

    /// Class name. Names identify classes, so they must be unique.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Direct parent class.
    #[must_use]
    pub const fn parent(&self) -> Option<&'static Self> {
        self.parent
    }

    /// Returns true when `self` equals `other` or descends from it.
    #[must_use]
    pub fn is_a(&self, other: &Self) -> bool {
        self.distance_to(other).is_some()
    }

    /// Number of parent hops from `self` up to `ancestor`, or `None` when
    /// `ancestor` is not in the chain.
    #[must_use]
    pub fn distance_to(&self, ancestor: &Self) -> Option<usize> {
        let mut current: Option<&Self> = Some(self);
        let mut hops = 0;
        while let Some(class) = current {
            if class == ancestor {
                return Some(hops);
            }
            current = class.parent;
            hops += 1;
        }
        None
    }

    /// Returns true when `self` is a kind of any class in `classes`.
    #[must_use]
    pub fn is_any_of(&self, classes: &[&'static Self]) -> bool {
        classes.iter().any(|class| self.is_a(class))
    }
}

impl PartialEq for ExceptionClass {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for ExceptionClass {}

impl fmt::Display for ExceptionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Built-in classes.
pub mod classes {
    use super::ExceptionClass;

    /// Root of everything a job is expected to raise.
    pub static STANDARD_ERROR: ExceptionClass = ExceptionClass::root("StandardError");

    /// Generic runtime failure.
    pub static RUNTIME_ERROR: ExceptionClass = ExceptionClass::new("RuntimeError", &STANDARD_ERROR);

    /// The process executing the job died before finishing. Reported by the
    /// host worker after the fact, from a different process.
    pub static DIRTY_EXIT: ExceptionClass = ExceptionClass::new("DirtyExit", &RUNTIME_ERROR);

    /// The payload named a job class nobody registered.
    pub static UNKNOWN_JOB: ExceptionClass = ExceptionClass::new("UnknownJob", &STANDARD_ERROR);
}

/// A failed job execution.
#[derive(Debug, Clone)]
pub struct JobFailure {
    class: &'static ExceptionClass,
    message: String,
    backtrace: Vec<String>,
    cause: Option<Box<JobFailure>>,
}

impl JobFailure {
    /// Create a failure of the given class.
    pub fn new(class: &'static ExceptionClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
            backtrace: Vec::new(),
            cause: None,
        }
    }

    /// Failure reported for a process that exited before finishing the job.
    pub fn dirty_exit(message: impl Into<String>) -> Self {
        Self::new(&classes::DIRTY_EXIT, message)
    }

    /// Attach backtrace lines.
    #[must_use]
    pub fn with_backtrace(mut self, backtrace: Vec<String>) -> Self {
        self.backtrace = backtrace;
        self
    }

    /// Attach the failure that was being handled when this one was raised.
    #[must_use]
    pub fn caused_by(mut self, cause: Self) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// The failure class.
    #[must_use]
    pub const fn class(&self) -> &'static ExceptionClass {
        self.class
    }

    /// The failure message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Backtrace lines, possibly empty.
    #[must_use]
    pub fn backtrace(&self) -> &[String] {
        &self.backtrace
    }

    /// The underlying cause, if any.
    #[must_use]
    pub fn cause(&self) -> Option<&Self> {
        self.cause.as_deref()
    }

    /// Returns true when this failure's class is `class` or descends from it.
    #[must_use]
    pub fn is_a(&self, class: &ExceptionClass) -> bool {
        self.class.is_a(class)
    }

    /// Returns true when the executing process died mid-job.
    #[must_use]
    pub fn is_dirty_exit(&self) -> bool {
        self.is_a(&classes::DIRTY_EXIT)
    }

    /// Classes of this failure and of every failure in its cause chain.
    pub fn raised_classes(&self) -> impl Iterator<Item = &'static ExceptionClass> + '_ {
        std::iter::successors(Some(self), |failure| failure.cause()).map(|failure| failure.class)
    }
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class.name, self.message)
    }
}

impl std::error::Error for JobFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}
