//! Attempt store: the shared key-value primitives the retry core needs.
//!
//! Every operation touches a single key. Production uses
//! [`RedisAttemptStore`](crate::redis_store::RedisAttemptStore); tests and
//! single-process setups use [`MemoryStore`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

use crate::error::{RetryError, RetryResult};

/// Key-value operations backing attempt counters and failure snapshots.
#[async_trait]
pub trait AttemptStore: Send + Sync {
    /// Read a value.
    async fn get(&self, key: &str) -> RetryResult<Option<String>>;

    /// Set a value only if the key is absent. Returns true when it was set.
    async fn set_if_absent(&self, key: &str, value: &str) -> RetryResult<bool>;

    /// Atomically increment an integer value, treating a missing key as 0.
    async fn increment(&self, key: &str) -> RetryResult<i64>;

    /// Atomically decrement an integer value, treating a missing key as 0.
    async fn decrement(&self, key: &str) -> RetryResult<i64>;

    /// Delete a key. Returns true when something was deleted.
    async fn delete(&self, key: &str) -> RetryResult<bool>;

    /// Set a key's time to live. Returns false when the key does not exist.
    async fn expire(&self, key: &str, seconds: i64) -> RetryResult<bool>;

    /// Returns true when the key exists.
    async fn exists(&self, key: &str) -> RetryResult<bool>;

    /// Set a value with a time to live.
    async fn set_with_ttl(&self, key: &str, value: &str, seconds: i64) -> RetryResult<()>;

    /// Remaining time to live in seconds; `None` when the key is missing or never expires.
    async fn ttl(&self, key: &str) -> RetryResult<Option<i64>>;
}

/// Read an attempt counter. `None` when the key is absent.
pub async fn read_attempt(store: &dyn AttemptStore, key: &str) -> RetryResult<Option<i64>> {
    store
        .get(key)
        .await?
        .map(|raw| {
            raw.parse()
                .map_err(|_| RetryError::Store(format!("attempt at {key} is not an integer: {raw}")))
        })
        .transpose()
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

/// Drops expired entries. Runs on every write so the map stays bounded.
fn sweep(entries: &mut HashMap<String, Entry>, now: Instant) {
    entries.retain(|_, entry| entry.is_live(now));
}

/// In-process [`AttemptStore`] with Redis-like semantics, including expiry.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .await
            .values()
            .filter(|entry| entry.is_live(now))
            .count()
    }

    /// Returns true when no live keys remain.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn add(&self, key: &str, delta: i64) -> RetryResult<i64> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        sweep(&mut entries, now);
        let current = match entries.get(key) {
            Some(entry) if entry.is_live(now) => entry.value.parse::<i64>().map_err(|_| {
                RetryError::Store(format!("value at {key} is not an integer"))
            })?,
            _ => 0,
        };
        let next = current + delta;
        let expires_at = entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .and_then(|entry| entry.expires_at);
        entries.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at,
            },
        );
        Ok(next)
    }
}

#[async_trait]
impl AttemptStore for MemoryStore {
    async fn get(&self, key: &str) -> RetryResult<Option<String>> {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        Ok(entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone()))
    }

    async fn set_if_absent(&self, key: &str, value: &str) -> RetryResult<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        sweep(&mut entries, now);
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: None,
            },
        );
        Ok(true)
    }

    async fn increment(&self, key: &str) -> RetryResult<i64> {
        self.add(key, 1).await
    }

    async fn decrement(&self, key: &str) -> RetryResult<i64> {
        self.add(key, -1).await
    }

    async fn delete(&self, key: &str) -> RetryResult<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        Ok(entries.remove(key).is_some_and(|entry| entry.is_live(now)))
    }

    async fn expire(&self, key: &str, seconds: i64) -> RetryResult<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        if !entries.get(key).is_some_and(|entry| entry.is_live(now)) {
            return Ok(false);
        }
        if seconds <= 0 {
            entries.remove(key);
        } else if let Some(entry) = entries.get_mut(key) {
            entry.expires_at = Some(now + Duration::from_secs(seconds as u64));
        }
        Ok(true)
    }

    async fn exists(&self, key: &str) -> RetryResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn set_with_ttl(&self, key: &str, value: &str, seconds: i64) -> RetryResult<()> {
        if seconds <= 0 {
            return Err(RetryError::Store(format!(
                "invalid expire time {seconds} for {key}"
            )));
        }
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        sweep(&mut entries, now);
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(now + Duration::from_secs(seconds as u64)),
            },
        );
        Ok(())
    }

    async fn ttl(&self, key: &str) -> RetryResult<Option<i64>> {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        Ok(entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(now).as_secs_f64().ceil() as i64))
    }
}
