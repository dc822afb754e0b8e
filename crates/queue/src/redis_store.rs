//! Redis-backed attempt store.

use std::sync::Arc;

use async_trait::async_trait;
use fred::clients::Client as RedisClient;
use fred::interfaces::{ClientLike, KeysInterface};
use fred::types::config::Config as RedisConfig;
use fred::types::{Expiration, SetOptions};
use tracing::{debug, info};

use crate::error::RetryResult;
use crate::store::AttemptStore;

/// [`AttemptStore`] on top of a shared Redis connection.
#[derive(Clone)]
pub struct RedisAttemptStore {
    redis: Arc<RedisClient>,
}

impl RedisAttemptStore {
    /// Create a new store over an already connected client.
    #[must_use]
    pub const fn new(redis: Arc<RedisClient>) -> Self {
        Self { redis }
    }

    /// Connect to Redis at `redis_url`.
    pub async fn connect(redis_url: &str) -> RetryResult<Self> {
        let config = RedisConfig::from_url(redis_url)?;
        let client = RedisClient::new(config, None, None, None);
        client.init().await?;
        info!("Redis attempt store connected");
        Ok(Self::new(Arc::new(client)))
    }
}

#[async_trait]
impl AttemptStore for RedisAttemptStore {
    async fn get(&self, key: &str) -> RetryResult<Option<String>> {
        Ok(self.redis.get(key).await?)
    }

    async fn set_if_absent(&self, key: &str, value: &str) -> RetryResult<bool> {
        // NX replies nil when the key already exists
        let reply: Option<String> = self
            .redis
            .set(key, value, None, Some(SetOptions::NX), false)
            .await?;
        Ok(reply.is_some())
    }

    async fn increment(&self, key: &str) -> RetryResult<i64> {
        Ok(self.redis.incr(key).await?)
    }

    async fn decrement(&self, key: &str) -> RetryResult<i64> {
        Ok(self.redis.decr(key).await?)
    }

    async fn delete(&self, key: &str) -> RetryResult<bool> {
        let removed: i64 = self.redis.del(key).await?;
        Ok(removed > 0)
    }

    async fn expire(&self, key: &str, seconds: i64) -> RetryResult<bool> {
        let applied: bool = self.redis.expire(key, seconds, None).await?;
        debug!(key = %key, seconds, applied, "Set retry key expiry");
        Ok(applied)
    }

    async fn exists(&self, key: &str) -> RetryResult<bool> {
        let count: i64 = self.redis.exists(key).await?;
        Ok(count > 0)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, seconds: i64) -> RetryResult<()> {
        self.redis
            .set::<(), _, _>(key, value, Some(Expiration::EX(seconds)), None, false)
            .await?;
        Ok(())
    }

    async fn ttl(&self, key: &str) -> RetryResult<Option<i64>> {
        // -2: missing key, -1: no expiry
        let ttl: i64 = self.redis.ttl(key).await?;
        Ok((ttl >= 0).then_some(ttl))
    }
}
