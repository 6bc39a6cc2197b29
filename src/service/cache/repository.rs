use serde::{de::DeserializeOwned, Serialize};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use super::{metrics::CacheMetricsSnapshot, types::CacheEntry, CacheBackend, CacheError};

/// Typed KV view over a backend. Cache keys are built by the caller.
pub struct CacheRepository<T, B>
where
    T: Serialize + DeserializeOwned + Send + Sync + Clone + 'static,
    B: CacheBackend<T>,
{
    backend: B,
    default_ttl: Option<Duration>,
    _phantom: PhantomData<T>,
}

impl<T, B> CacheRepository<T, B>
where
    T: Serialize + DeserializeOwned + Send + Sync + Clone + 'static,
    B: CacheBackend<T>,
{
    pub fn new(backend: B, default_ttl: Option<Duration>) -> Self {
        Self {
            backend,
            default_ttl,
            _phantom: PhantomData,
        }
    }

    /// Raw entry, so callers can tell a negative hit from a miss.
    pub async fn get_entry(&self, cache_key: &str) -> Result<Option<Arc<CacheEntry<T>>>, CacheError> {
        self.backend
            .get(cache_key)
            .await
            .map_err(|e| CacheError::BackendError(e.to_string()))
    }

    pub async fn get(&self, cache_key: &str) -> Result<Option<Arc<T>>, CacheError> {
        match self.get_entry(cache_key).await? {
            Some(entry) => match &*entry {
                CacheEntry::Positive(value) => Ok(Some(value.clone())),
                CacheEntry::Negative => Ok(None),
            },
            None => Ok(None),
        }
    }

    pub async fn set_positive(&self, cache_key: &str, value: &T) -> Result<(), CacheError> {
        let entry = Arc::new(CacheEntry::Positive(Arc::new(value.clone())));
        self.backend
            .set(cache_key, entry, self.default_ttl)
            .await
            .map_err(|e| CacheError::BackendError(e.to_string()))
    }

    pub async fn set_negative(&self, cache_key: &str, ttl: Duration) -> Result<(), CacheError> {
        self.backend
            .set(cache_key, Arc::new(CacheEntry::Negative), Some(ttl))
            .await
            .map_err(|e| CacheError::BackendError(e.to_string()))
    }

    pub async fn delete(&self, cache_key: &str) -> Result<(), CacheError> {
        self.backend
            .delete(cache_key)
            .await
            .map_err(|e| CacheError::BackendError(e.to_string()))
    }

    pub async fn clear(&self) -> Result<(), CacheError> {
        self.backend
            .clear()
            .await
            .map_err(|e| CacheError::BackendError(e.to_string()))
    }

    pub fn stats(&self) -> CacheMetricsSnapshot {
        self.backend.metrics().snapshot()
    }
}

impl<T, B> Clone for CacheRepository<T, B>
where
    T: Serialize + DeserializeOwned + Send + Sync + Clone + 'static,
    B: CacheBackend<T>,
{
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            default_ttl: self.default_ttl,
            _phantom: PhantomData,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::cache::memory::MemoryCacheBackend;

    #[tokio::test]
    async fn test_positive_negative_and_delete() {
        let repo: CacheRepository<Vec<String>, _> =
            CacheRepository::new(MemoryCacheBackend::new(), Some(Duration::from_secs(30)));

        repo.set_positive("whitelist:1", &vec!["gpt-4o".to_string()]).await.unwrap();
        repo.set_negative("whitelist:2", Duration::from_secs(60)).await.unwrap();

        assert_eq!(repo.get("whitelist:1").await.unwrap().unwrap().len(), 1);
        assert!(repo.get("whitelist:2").await.unwrap().is_none());
        assert!(matches!(
            &*repo.get_entry("whitelist:2").await.unwrap().unwrap(),
            CacheEntry::Negative
        ));

        repo.delete("whitelist:1").await.unwrap();
        assert!(repo.get_entry("whitelist:1").await.unwrap().is_none());

        let stats = repo.stats();
        assert_eq!((stats.writes, stats.invalidations), (2, 1));
        assert_eq!((stats.hits, stats.negative_hits, stats.misses), (1, 2, 1));
    }
}
