//! Retry delay calculation.
//!
//! A policy picks exactly one [`RetryDelay`] variant. Delays are whole
//! seconds; anything `<= 0` means "retry immediately".

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use rand::Rng;
use serde_json::Value;

use crate::error::ConfigError;
use crate::exception::ExceptionClass;

/// Delays used when a backoff strategy is not given explicitly.
pub const DEFAULT_BACKOFF_STRATEGY: [i64; 6] = [0, 60, 600, 3600, 10_800, 21_600];

/// Inputs available to a delay calculation.
#[derive(Debug, Clone, Copy)]
pub struct DelayContext<'a> {
    /// Current attempt number.
    pub attempt: i64,
    /// Class of the failure being retried, if known.
    pub exception: Option<&'static ExceptionClass>,
    /// Job arguments.
    pub args: &'a [Value],
}

impl<'a> DelayContext<'a> {
    /// Context without a failure, used when refreshing key expiry before a run.
    #[must_use]
    pub const fn before_attempt(attempt: i64, args: &'a [Value]) -> Self {
        Self {
            attempt,
            exception: None,
            args,
        }
    }
}

/// Index `delays` by attempt, clamping to the last entry.
fn pick(delays: &[i64], attempt: i64) -> i64 {
    let index = usize::try_from(attempt.max(0)).unwrap_or(usize::MAX);
    delays
        .get(index)
        .or_else(|| delays.last())
        .copied()
        .unwrap_or(0)
}

/// Exponential backoff: a delay per attempt, optionally scaled by a random
/// multiplicand to spread out retries of jobs that failed together.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffStrategy {
    delays: Vec<i64>,
    multiplicand_min: f64,
    multiplicand_max: f64,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self {
            delays: DEFAULT_BACKOFF_STRATEGY.to_vec(),
            multiplicand_min: 1.0,
            multiplicand_max: 1.0,
        }
    }
}

impl BackoffStrategy {
    /// Strategy with the given per-attempt delays and no jitter.
    pub fn new(delays: Vec<i64>) -> Result<Self, ConfigError> {
        if delays.is_empty() {
            return Err(ConfigError::EmptyBackoffStrategy);
        }
        Ok(Self {
            delays,
            ..Self::default()
        })
    }

    /// Multiply each delay by a random value drawn from `[min, max]`.
    pub fn with_multiplicands(mut self, min: f64, max: f64) -> Result<Self, ConfigError> {
        if min.is_nan() || max.is_nan() || min > max {
            return Err(ConfigError::InvalidMultiplicandRange { min, max });
        }
        self.multiplicand_min = min;
        self.multiplicand_max = max;
        Ok(self)
    }

    /// Per-attempt delays.
    #[must_use]
    pub fn delays(&self) -> &[i64] {
        &self.delays
    }

    /// Jitter range.
    #[must_use]
    pub const fn multiplicands(&self) -> (f64, f64) {
        (self.multiplicand_min, self.multiplicand_max)
    }

    /// Number of configured delays.
    #[must_use]
    pub fn len(&self) -> usize {
        self.delays.len()
    }

    /// Always false: construction rejects empty strategies.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.delays.is_empty()
    }

    /// Delay for `attempt` before jitter.
    #[must_use]
    pub fn base_delay(&self, attempt: i64) -> i64 {
        pick(&self.delays, attempt)
    }

    /// Delay for `attempt`, with jitter from the thread-local RNG.
    #[must_use]
    pub fn delay(&self, attempt: i64) -> i64 {
        self.delay_with_rng(attempt, &mut rand::thread_rng())
    }

    /// Delay for `attempt`, with jitter from `rng`.
    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: i64, rng: &mut R) -> i64 {
        let base = self.base_delay(attempt);
        // an empty range trips some RNGs, so skip the draw entirely
        let multiplicand = if self.multiplicand_min == self.multiplicand_max {
            self.multiplicand_min
        } else {
            rng.gen_range(self.multiplicand_min..=self.multiplicand_max)
        };
        (base as f64 * multiplicand) as i64
    }
}

/// Delay for one configured exception class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExceptionDelay {
    /// Same delay for every attempt.
    Fixed(i64),
    /// Delay indexed by attempt, clamped to the last entry.
    PerAttempt(Vec<i64>),
}

impl ExceptionDelay {
    fn for_attempt(&self, attempt: i64) -> i64 {
        match self {
            Self::Fixed(delay) => *delay,
            Self::PerAttempt(delays) => pick(delays, attempt),
        }
    }
}

/// Exception class to delay table.
///
/// A class without its own entry uses the entry of its nearest configured
/// ancestor. Resolutions are cached per class.
pub struct ExceptionDelays {
    entries: Vec<(&'static ExceptionClass, ExceptionDelay)>,
    resolved: RwLock<HashMap<&'static str, Option<usize>>>,
}

impl ExceptionDelays {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            resolved: RwLock::new(HashMap::new()),
        }
    }

    /// Builder-style insert of a fixed delay.
    #[must_use]
    pub fn fixed(self, class: &'static ExceptionClass, delay: i64) -> Self {
        self.with(class, ExceptionDelay::Fixed(delay))
    }

    /// Builder-style insert of a per-attempt delay sequence.
    #[must_use]
    pub fn per_attempt(self, class: &'static ExceptionClass, delays: Vec<i64>) -> Self {
        self.with(class, ExceptionDelay::PerAttempt(delays))
    }

    /// Builder-style insert, replacing an existing entry for `class`.
    #[must_use]
    pub fn with(mut self, class: &'static ExceptionClass, delay: ExceptionDelay) -> Self {
        self.entries.retain(|(existing, _)| *existing != class);
        self.entries.push((class, delay));
        self
    }

    /// Configured classes, in insertion order.
    pub fn classes(&self) -> impl Iterator<Item = &'static ExceptionClass> + '_ {
        self.entries.iter().map(|(class, _)| *class)
    }

    /// Length of the longest per-attempt sequence, if any entry has one.
    #[must_use]
    pub fn longest_sequence(&self) -> Option<usize> {
        self.entries
            .iter()
            .filter_map(|(_, delay)| match delay {
                ExceptionDelay::PerAttempt(delays) => Some(delays.len()),
                ExceptionDelay::Fixed(_) => None,
            })
            .max()
    }

    /// The entry governing `class`: its own, else the nearest ancestor's.
    #[must_use]
    pub fn resolve(&self, class: &'static ExceptionClass) -> Option<&ExceptionDelay> {
        let cached = self
            .resolved
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(class.name())
            .copied();
        let index = match cached {
            Some(index) => index,
            None => {
                let index = self.nearest_entry(class);
                self.resolved
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(class.name(), index);
                index
            }
        };
        index.map(|i| &self.entries[i].1)
    }

    /// Delay for a failure class at `attempt`; 0 when nothing matches.
    #[must_use]
    pub fn delay_for(&self, class: Option<&'static ExceptionClass>, attempt: i64) -> i64 {
        class
            .and_then(|class| self.resolve(class))
            .map_or(0, |delay| delay.for_attempt(attempt))
    }

    fn nearest_entry(&self, class: &ExceptionClass) -> Option<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, (configured, _))| class.distance_to(configured).map(|d| (d, i)))
            .min()
            .map(|(_, i)| i)
    }
}

impl Default for ExceptionDelays {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for ExceptionDelays {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
            resolved: RwLock::new(HashMap::new()),
        }
    }
}

impl fmt::Debug for ExceptionDelays {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(class, delay)| (class.name(), delay)))
            .finish()
    }
}

/// Delay as a function of the attempt number.
pub type AttemptDelayFn = Arc<dyn Fn(i64) -> i64 + Send + Sync>;

/// Delay as a function of the failure class.
pub type ExceptionDelayFn = Arc<dyn Fn(&ExceptionClass) -> i64 + Send + Sync>;

/// Delay as a function of the failure class and job arguments.
pub type ExceptionArgsDelayFn = Arc<dyn Fn(&ExceptionClass, &[Value]) -> i64 + Send + Sync>;

/// How a policy computes its retry delay.
#[derive(Clone)]
pub enum RetryDelay {
    /// The same delay every time.
    Constant(i64),
    /// Looked up by failure class.
    PerException(ExceptionDelays),
    /// Indexed by attempt, optionally jittered.
    Backoff(BackoffStrategy),
    /// Custom function of the attempt number.
    PerAttempt(AttemptDelayFn),
    /// Custom function of the failure class.
    PerExceptionClass(ExceptionDelayFn),
    /// Custom function of the failure class and arguments.
    PerExceptionAndArgs(ExceptionArgsDelayFn),
}

impl Default for RetryDelay {
    fn default() -> Self {
        Self::Constant(0)
    }
}

impl RetryDelay {
    /// Delay in seconds for `ctx`.
    ///
    /// Exception-based variants yield 0 when the context carries no failure.
    #[must_use]
    pub fn resolve(&self, ctx: &DelayContext<'_>) -> i64 {
        match self {
            Self::Constant(delay) => *delay,
            Self::PerException(table) => table.delay_for(ctx.exception, ctx.attempt),
            Self::Backoff(strategy) => strategy.delay(ctx.attempt),
            Self::PerAttempt(f) => f(ctx.attempt),
            Self::PerExceptionClass(f) => ctx.exception.map_or(0, |class| f(class)),
            Self::PerExceptionAndArgs(f) => ctx.exception.map_or(0, |class| f(class, ctx.args)),
        }
    }
}

impl fmt::Debug for RetryDelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Constant(delay) => f.debug_tuple("Constant").field(delay).finish(),
            Self::PerException(table) => f.debug_tuple("PerException").field(table).finish(),
            Self::Backoff(strategy) => f.debug_tuple("Backoff").field(strategy).finish(),
            Self::PerAttempt(_) => f.write_str("PerAttempt(..)"),
            Self::PerExceptionClass(_) => f.write_str("PerExceptionClass(..)"),
            Self::PerExceptionAndArgs(_) => f.write_str("PerExceptionAndArgs(..)"),
        }
    }
}
