use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use self::metrics::CacheMetrics;
use self::types::CacheEntry;

pub mod memory;
pub mod metrics;
pub mod redis;
pub mod repository;
pub mod types;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Backend error: {0}")]
    BackendError(String),
}

impl From<bincode::error::EncodeError> for CacheError {
    fn from(e: bincode::error::EncodeError) -> Self {
        CacheError::SerializationError(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for CacheError {
    fn from(e: bincode::error::DecodeError) -> Self {
        CacheError::DeserializationError(e.to_string())
    }
}

/// Basic KV operations over a cache store.
#[async_trait]
pub trait CacheBackend<T>: Send + Sync + Clone + 'static
where
    T: Serialize + DeserializeOwned + Send + Sync + Clone + 'static,
{
    type Error: std::error::Error + Send + Sync + 'static;

    async fn get(&self, key: &str) -> Result<Option<Arc<CacheEntry<T>>>, Self::Error>;
    async fn set(&self, key: &str, value: Arc<CacheEntry<T>>, ttl: Option<Duration>) -> Result<(), Self::Error>;
    async fn delete(&self, key: &str) -> Result<(), Self::Error>;
    async fn clear(&self) -> Result<(), Self::Error>;
    fn metrics(&self) -> &CacheMetrics;
}

/// Fixed-window counters shared by every gateway instance using the same store.
#[async_trait]
pub trait CounterBackend: Send + Sync + 'static {
    /// Increments the counter for `key` and returns the count within the
    /// current window. The window opens on the first hit and lasts `window`.
    async fn incr_window(&self, key: &str, window: Duration) -> Result<u64, CacheError>;
}
