use async_trait::async_trait;
use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use super::{metrics::CacheMetrics, types::CacheEntry, CacheBackend, CacheError, CounterBackend};

#[derive(Debug, Error)]
#[error("Memory cache error: {0}")]
pub struct MemoryCacheError(String);

#[derive(Clone)]
pub struct MemoryCacheBackend<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + Clone + 'static,
{
    data: Arc<DashMap<String, (Arc<CacheEntry<T>>, Option<Instant>)>>, // value + expiration
    metrics: Arc<CacheMetrics>,
}

impl<T> MemoryCacheBackend<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + Clone + 'static,
{
    pub fn new() -> Self {
        let backend = Self {
            data: Arc::new(DashMap::new()),
            metrics: Arc::new(CacheMetrics::new()),
        };
        let weak = Arc::downgrade(&backend.data);
        spawn_sweeper(move || match weak.upgrade() {
            Some(data) => {
                let now = Instant::now();
                data.retain(|_, (_, expiration)| expiration.is_none_or(|exp| now < exp));
                true
            }
            None => false,
        });
        backend
    }
}

/// Runs `sweep` every minute on the current runtime until it returns false.
/// Outside a runtime (plain unit tests) expired entries are dropped lazily only.
fn spawn_sweeper<F>(mut sweep: F)
where
    F: FnMut() -> bool + Send + 'static,
{
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            interval.tick().await;
            loop {
                interval.tick().await;
                if !sweep() {
                    break;
                }
            }
        });
    }
}

#[async_trait]
impl<T> CacheBackend<T> for MemoryCacheBackend<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + Clone + 'static,
{
    type Error = MemoryCacheError;

    async fn get(&self, key: &str) -> Result<Option<Arc<CacheEntry<T>>>, Self::Error> {
        let found = match self.data.get(key) {
            Some(slot) => {
                let (value, expiration) = slot.value();
                if expiration.is_some_and(|exp| Instant::now() >= exp) {
                    drop(slot);
                    self.data.remove(key);
                    None
                } else {
                    Some(value.clone())
                }
            }
            None => None,
        };
        self.metrics.record_lookup(found.as_deref());
        Ok(found)
    }

    async fn set(&self, key: &str, value: Arc<CacheEntry<T>>, ttl: Option<Duration>) -> Result<(), Self::Error> {
        let expiration = ttl.map(|d| Instant::now() + d);
        self.data.insert(key.to_string(), (value, expiration));
        self.metrics.record_write();
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), Self::Error> {
        self.data.remove(key);
        self.metrics.record_invalidation();
        Ok(())
    }

    async fn clear(&self) -> Result<(), Self::Error> {
        self.data.clear();
        cyder_tools::log::info!("In-memory cache cleared.");
        Ok(())
    }

    fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }
}

impl<T> Default for MemoryCacheBackend<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + Clone + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Single-process fixed-window counters. The dashmap entry lock makes the
/// read-increment step atomic per key.
#[derive(Clone, Default)]
pub struct MemoryCounterBackend {
    windows: Arc<DashMap<String, (u64, Instant)>>,
}

impl MemoryCounterBackend {
    pub fn new() -> Self {
        let backend = Self::default();
        let weak = Arc::downgrade(&backend.windows);
        spawn_sweeper(move || match weak.upgrade() {
            Some(windows) => {
                let now = Instant::now();
                windows.retain(|_, (_, resets_at)| now < *resets_at);
                true
            }
            None => false,
        });
        backend
    }

    pub(crate) fn incr_at(&self, key: &str, window: Duration, now: Instant) -> u64 {
        let mut slot = self
            .windows
            .entry(key.to_string())
            .or_insert((0, now + window));
        let (count, resets_at) = slot.value_mut();
        if now >= *resets_at {
            *count = 0;
            *resets_at = now + window;
        }
        *count += 1;
        *count
    }
}

#[async_trait]
impl CounterBackend for MemoryCounterBackend {
    async fn incr_window(&self, key: &str, window: Duration) -> Result<u64, CacheError> {
        Ok(self.incr_at(key, window, Instant::now()))
    }
}
