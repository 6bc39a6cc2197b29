use async_trait::async_trait;
use bb8_redis::bb8;
use bb8_redis::redis::{self, AsyncCommands, RedisError};
use serde::{de::DeserializeOwned, Serialize};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::service::redis::RedisPool;

use super::{metrics::CacheMetrics, types::CacheEntry, CacheBackend, CacheError, CounterBackend};

#[derive(Debug, Error)]
pub enum RedisCacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),
    #[error("Codec error: {0}")]
    Codec(#[from] CacheError),
    #[error("Pool error: {0}")]
    Pool(#[from] bb8::RunError<RedisError>),
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CacheError> {
    Ok(bincode::serde::encode_to_vec(value, bincode::config::standard())?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CacheError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
    Ok(value)
}

/// Redis cache backend
#[derive(Clone)]
pub struct RedisCacheBackend<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static + Clone,
{
    pool: RedisPool,
    metrics: Arc<CacheMetrics>,
    key_prefix: String,
    _phantom: PhantomData<T>,
}

impl<T> RedisCacheBackend<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static + Clone,
{
    pub fn new(pool: RedisPool, key_prefix: String) -> Self {
        Self {
            pool,
            metrics: Arc::new(CacheMetrics::new()),
            key_prefix,
            _phantom: PhantomData,
        }
    }

    fn get_full_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

#[async_trait]
impl<T> CacheBackend<T> for RedisCacheBackend<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static + Clone,
{
    type Error = RedisCacheError;

    async fn get(&self, key: &str) -> Result<Option<Arc<CacheEntry<T>>>, Self::Error> {
        let mut conn = self.pool.get().await?;
        let raw: Option<Vec<u8>> = conn.get(self.get_full_key(key)).await?;

        let entry = match raw {
            Some(bytes) => Some(Arc::new(
                decode::<CacheEntry<T>>(&bytes).inspect_err(|_| self.metrics.record_error())?,
            )),
            None => None,
        };
        self.metrics.record_lookup(entry.as_deref());
        Ok(entry)
    }

    async fn set(&self, key: &str, value: Arc<CacheEntry<T>>, ttl: Option<Duration>) -> Result<(), Self::Error> {
        let payload = encode(&*value)?;
        let mut conn = self.pool.get().await?;
        let full_key = self.get_full_key(key);

        match ttl {
            Some(ttl) => {
                let millis = ttl.as_millis().max(1) as u64;
                let _: () = redis::cmd("SET")
                    .arg(&full_key)
                    .arg(payload)
                    .arg("PX")
                    .arg(millis)
                    .query_async(&mut *conn)
                    .await?;
            }
            None => {
                let _: () = conn.set(full_key, payload).await?;
            }
        }
        self.metrics.record_write();
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), Self::Error> {
        let mut conn = self.pool.get().await?;
        let _: () = conn.del(self.get_full_key(key)).await?;
        self.metrics.record_invalidation();
        Ok(())
    }

    async fn clear(&self) -> Result<(), Self::Error> {
        let mut conn = self.pool.get().await?;
        let pattern = format!("{}*", self.key_prefix);

        let mut keys_to_delete: Vec<String> = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut *conn)
                .await?;
            keys_to_delete.extend(keys);
            if next_cursor == 0 {
                break;
            }
            cursor = next_cursor;
        }

        if !keys_to_delete.is_empty() {
            let mut pipe = redis::pipe();
            for key in &keys_to_delete {
                pipe.del(key);
            }
            let _: () = pipe.query_async(&mut *conn).await?;
            cyder_tools::log::info!(
                "Cleared {} keys from Redis cache with prefix '{}'",
                keys_to_delete.len(),
                self.key_prefix
            );
        }
        Ok(())
    }

    fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }
}

// INCR then start the window on the first hit, in one round trip.
const INCR_WINDOW_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return count
"#;

/// Fixed-window counters stored in Redis, shared across gateway instances.
#[derive(Clone)]
pub struct RedisCounterBackend {
    pool: RedisPool,
    key_prefix: String,
    script: Arc<redis::Script>,
}

impl RedisCounterBackend {
    pub fn new(pool: RedisPool, key_prefix: String) -> Self {
        Self {
            pool,
            key_prefix,
            script: Arc::new(redis::Script::new(INCR_WINDOW_SCRIPT)),
        }
    }
}

#[async_trait]
impl CounterBackend for RedisCounterBackend {
    async fn incr_window(&self, key: &str, window: Duration) -> Result<u64, CacheError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| CacheError::BackendError(e.to_string()))?;
        let count: u64 = self
            .script
            .key(format!("{}{}", self.key_prefix, key))
            .arg(window.as_millis().max(1) as u64)
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| CacheError::BackendError(e.to_string()))?;
        Ok(count)
    }
}
