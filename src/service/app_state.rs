use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use chrono::Utc;
use cyder_tools::log::{debug, error, info, warn};
use serde::{de::DeserializeOwned, Serialize};

use crate::config::{CacheBackendType, FinalConfig, CONFIG};
use crate::database::account::Account;
use crate::database::api_key::ApiKey;
use crate::database::model::Model;
use crate::database::{Database, DbResult};
use crate::error::{BaseError, GatewayError};
use crate::proxy::upstream::{Dispatcher, HttpDispatcher};
use crate::service::redis::{self, RedisPool};
use crate::utils::crypto::{hash_api_key, SecretCipher};
use crate::utils::limit::RateLimiter;

use super::cache::memory::{MemoryCacheBackend, MemoryCounterBackend};
use super::cache::metrics::CacheMetricsSnapshot;
use super::cache::redis::{RedisCacheBackend, RedisCounterBackend};
use super::cache::repository::CacheRepository;
use super::cache::types::{CacheApiKey, CacheEntry, CacheModel};
use super::cache::{CacheError, CounterBackend};

enum CacheKey<'a> {
    ApiKeyHash(&'a str),
    Whitelist(i64),
    ModelByName(&'a str),
}

impl std::fmt::Display for CacheKey<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheKey::ApiKeyHash(hash) => write!(f, "api_key:hash:{}", hash),
            CacheKey::Whitelist(id) => write!(f, "whitelist:key:{}", id),
            CacheKey::ModelByName(name) => write!(f, "model:name:{}", name),
        }
    }
}

#[derive(Clone)]
enum AnyCacheRepo<T: Serialize + DeserializeOwned + Send + Sync + Clone + 'static> {
    Memory(CacheRepository<T, MemoryCacheBackend<T>>),
    Redis(CacheRepository<T, RedisCacheBackend<T>>),
}

impl<T> AnyCacheRepo<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + Clone + 'static,
{
    async fn get_entry(&self, key: &str) -> Result<Option<Arc<CacheEntry<T>>>, CacheError> {
        match self {
            AnyCacheRepo::Memory(repo) => repo.get_entry(key).await,
            AnyCacheRepo::Redis(repo) => repo.get_entry(key).await,
        }
    }

    async fn set_positive(&self, key: &str, value: &T) -> Result<(), CacheError> {
        match self {
            AnyCacheRepo::Memory(repo) => repo.set_positive(key, value).await,
            AnyCacheRepo::Redis(repo) => repo.set_positive(key, value).await,
        }
    }

    async fn set_negative(&self, key: &str, ttl: Duration) -> Result<(), CacheError> {
        match self {
            AnyCacheRepo::Memory(repo) => repo.set_negative(key, ttl).await,
            AnyCacheRepo::Redis(repo) => repo.set_negative(key, ttl).await,
        }
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        match self {
            AnyCacheRepo::Memory(repo) => repo.delete(key).await,
            AnyCacheRepo::Redis(repo) => repo.delete(key).await,
        }
    }

    async fn clear(&self) -> Result<(), CacheError> {
        match self {
            AnyCacheRepo::Memory(repo) => repo.clear().await,
            AnyCacheRepo::Redis(repo) => repo.clear().await,
        }
    }

    fn stats(&self) -> CacheMetricsSnapshot {
        match self {
            AnyCacheRepo::Memory(repo) => repo.stats(),
            AnyCacheRepo::Redis(repo) => repo.stats(),
        }
    }
}

type CacheRepo<T> = AnyCacheRepo<T>;

// Cache reads never fail a request; an unreachable cache is a miss.
async fn cached<T>(repo: &CacheRepo<T>, key: &str) -> Option<Arc<CacheEntry<T>>>
where
    T: Serialize + DeserializeOwned + Send + Sync + Clone + 'static,
{
    match repo.get_entry(key).await {
        Ok(Some(entry)) => {
            debug!("cache hit: {}", key);
            Some(entry)
        }
        Ok(None) => {
            debug!("cache miss: {}", key);
            None
        }
        Err(e) => {
            warn!("cache read for {} failed, using the store: {}", key, e);
            None
        }
    }
}

async fn remember<T>(repo: &CacheRepo<T>, key: &str, value: Option<&T>, negative_ttl: Duration)
where
    T: Serialize + DeserializeOwned + Send + Sync + Clone + 'static,
{
    let result = match value {
        Some(value) => repo.set_positive(key, value).await,
        None => repo.set_negative(key, negative_ttl).await,
    };
    if let Err(e) = result {
        warn!("cache write for {} failed: {}", key, e);
    }
}

fn redis_base_prefix(config: &FinalConfig) -> &str {
    config.redis.as_ref().map(|r| r.key_prefix.as_str()).unwrap_or_default()
}

// Each cache clears only `{prefix}*` of its own namespace, so rate-limit
// windows shared by other instances survive a restart.
fn cache_key_prefix(config: &FinalConfig, namespace: &str) -> String {
    format!(
        "{}{}{}:",
        redis_base_prefix(config),
        config.cache.redis.key_prefix,
        namespace
    )
}

fn counter_key_prefix(config: &FinalConfig) -> String {
    format!("{}counter:", redis_base_prefix(config))
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<FinalConfig>,
    pub db: Database,
    pub limiter: RateLimiter,
    pub dispatcher: Arc<dyn Dispatcher>,
    pub cipher: SecretCipher,

    // key hash -> CacheApiKey
    api_key_cache: CacheRepo<CacheApiKey>,
    // key id -> allowed model names
    whitelist_cache: CacheRepo<Vec<String>>,
    // public model name -> CacheModel
    model_cache: CacheRepo<CacheModel>,

    negative_cache_ttl: Duration,
}

impl AppState {
    pub async fn new(config: FinalConfig, db: Database, dispatcher: Arc<dyn Dispatcher>) -> Self {
        let wants_redis = config.cache.backend == CacheBackendType::Redis;
        let redis_pool = if wants_redis {
            redis::create_pool(config.redis.as_ref()).await
        } else {
            None
        };

        if redis_pool.is_some() {
            info!("Using Redis cache backend.");
        } else if wants_redis {
            info!("Redis is configured, but connection failed. Falling back to in-memory cache.");
        } else {
            info!("Using in-memory cache backend.");
        }

        let pool = redis_pool.as_ref();
        let auth_ttl = Some(config.cache.auth_ttl());
        let ttl = Some(config.cache.ttl());

        let counter: Arc<dyn CounterBackend> = match pool {
            Some(pool) => Arc::new(RedisCounterBackend::new(pool.clone(), counter_key_prefix(&config))),
            None => Arc::new(MemoryCounterBackend::new()),
        };

        Self {
            api_key_cache: Self::create_repo(&config, "auth", auth_ttl, pool),
            whitelist_cache: Self::create_repo(&config, "whitelist", auth_ttl, pool),
            model_cache: Self::create_repo(&config, "model", ttl, pool),
            negative_cache_ttl: config.cache.negative_ttl(),
            limiter: RateLimiter::new(counter, config.rate_limit.clone()),
            cipher: SecretCipher::new(&config.secret_key),
            config: Arc::new(config),
            db,
            dispatcher,
        }
    }

    fn create_repo<T>(
        config: &FinalConfig,
        namespace: &str,
        ttl: Option<Duration>,
        pool: Option<&RedisPool>,
    ) -> CacheRepo<T>
    where
        T: Serialize + DeserializeOwned + Send + Sync + Clone + 'static,
    {
        match pool {
            Some(pool) => {
                let backend = RedisCacheBackend::new(pool.clone(), cache_key_prefix(config, namespace));
                AnyCacheRepo::Redis(CacheRepository::new(backend, ttl))
            }
            None => AnyCacheRepo::Memory(CacheRepository::new(MemoryCacheBackend::new(), ttl)),
        }
    }

    pub async fn clear_cache(&self) {
        info!("Clearing app cache...");
        if let Err(e) = self.api_key_cache.clear().await {
            error!("Failed to clear api_key_cache: {}", e);
        }
        if let Err(e) = self.whitelist_cache.clear().await {
            error!("Failed to clear whitelist_cache: {}", e);
        }
        if let Err(e) = self.model_cache.clear().await {
            error!("Failed to clear model_cache: {}", e);
        }
    }

    pub fn cache_stats(&self) -> [(&'static str, CacheMetricsSnapshot); 3] {
        [
            ("api_key", self.api_key_cache.stats()),
            ("whitelist", self.whitelist_cache.stats()),
            ("model", self.model_cache.stats()),
        ]
    }

    // ============================================================================================
    // Credential store
    // ============================================================================================

    /// Resolves a raw bearer token to its key record. Unknown, disabled and
    /// expired keys all fail with an authentication error.
    pub async fn authenticate(&self, token: &str) -> Result<Arc<CacheApiKey>, GatewayError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(GatewayError::Authentication("You didn't provide an API key.".to_string()));
        }
        let key_hash = hash_api_key(token);
        let cache_key = CacheKey::ApiKeyHash(&key_hash).to_string();

        let key = match cached(&self.api_key_cache, &cache_key).await {
            Some(entry) => match &*entry {
                CacheEntry::Positive(key) => Some(key.clone()),
                CacheEntry::Negative => None,
            },
            None => {
                let hash = key_hash.clone();
                let db_key = self.db.run(move |conn| ApiKey::get_by_hash(conn, &hash)).await?;
                let cache_item = db_key.map(CacheApiKey::from);
                remember(&self.api_key_cache, &cache_key, cache_item.as_ref(), self.negative_cache_ttl).await;
                cache_item.map(Arc::new)
            }
        };

        let key = key.ok_or_else(|| GatewayError::Authentication("Incorrect API key provided.".to_string()))?;
        if !key.is_active {
            return Err(GatewayError::Authentication("This API key has been disabled.".to_string()));
        }
        if key.expires_at.is_some_and(|exp| exp <= Utc::now().timestamp_millis()) {
            return Err(GatewayError::Authentication("This API key has expired.".to_string()));
        }
        Ok(key)
    }

    /// Models the key may use. Empty means unrestricted.
    pub async fn model_whitelist(&self, api_key_id: i64) -> Result<Arc<Vec<String>>, GatewayError> {
        let cache_key = CacheKey::Whitelist(api_key_id).to_string();
        if let Some(entry) = cached(&self.whitelist_cache, &cache_key).await {
            if let CacheEntry::Positive(list) = &*entry {
                return Ok(list.clone());
            }
        }
        let whitelist = self
            .db
            .run(move |conn| ApiKey::get_by_id(conn, api_key_id).map(|key| key.whitelist()))
            .await?;
        remember(&self.whitelist_cache, &cache_key, Some(&whitelist), self.negative_cache_ttl).await;
        Ok(Arc::new(whitelist))
    }

    /// Drops every cached view of a key. Called by the owning CRUD layer
    /// before an edit or delete returns.
    pub async fn invalidate_api_key(&self, key_hash: &str, api_key_id: i64) -> Result<(), BaseError> {
        let hash_key = CacheKey::ApiKeyHash(key_hash).to_string();
        let whitelist_key = CacheKey::Whitelist(api_key_id).to_string();
        debug!("invalidate: {}, {}", hash_key, whitelist_key);
        self.api_key_cache.delete(&hash_key).await?;
        self.whitelist_cache.delete(&whitelist_key).await?;
        Ok(())
    }

    /// Rejects keys that cannot pay for another request: a quota already
    /// used up, or an account balance at or below zero. Reads the store,
    /// not the cache.
    pub async fn check_funds(&self, key: &CacheApiKey) -> Result<(), GatewayError> {
        let key_id = key.id;
        let account_id = key.account_id;
        let quota_bound = key.total_quota.is_some();
        let exhausted = self
            .db
            .run(move |conn| -> DbResult<bool> {
                if quota_bound {
                    let fresh = ApiKey::get_by_id(conn, key_id)?;
                    Ok(fresh.total_quota.is_some_and(|total| fresh.used_quota >= total))
                } else {
                    Ok(Account::balance(conn, account_id)? <= 0)
                }
            })
            .await?;
        if exhausted {
            let message = if quota_bound {
                "You exceeded the quota of this API key."
            } else {
                "You exceeded your current quota, please check your balance."
            };
            return Err(GatewayError::InsufficientQuota(message.to_string()));
        }
        Ok(())
    }

    // ============================================================================================
    // Model registry
    // ============================================================================================

    pub async fn get_model(&self, model_name: &str) -> Result<Option<Arc<CacheModel>>, GatewayError> {
        let cache_key = CacheKey::ModelByName(model_name).to_string();
        if let Some(entry) = cached(&self.model_cache, &cache_key).await {
            return Ok(match &*entry {
                CacheEntry::Positive(model) => Some(model.clone()),
                CacheEntry::Negative => None,
            });
        }
        let name = model_name.to_string();
        let model = self
            .db
            .run(move |conn| Model::get_active_by_name(conn, &name))
            .await?
            .map(CacheModel::from);
        remember(&self.model_cache, &cache_key, model.as_ref(), self.negative_cache_ttl).await;
        Ok(model.map(Arc::new))
    }

    pub async fn list_models(&self) -> Result<Vec<CacheModel>, GatewayError> {
        let models = self.db.run(Model::list_active).await?;
        Ok(models.into_iter().map(CacheModel::from).collect())
    }

    pub async fn invalidate_model(&self, model_name: &str) -> Result<(), BaseError> {
        let cache_key = CacheKey::ModelByName(model_name).to_string();
        debug!("invalidate: {}", cache_key);
        Ok(self.model_cache.delete(&cache_key).await?)
    }
}

pub async fn create_app_state() -> Result<Arc<AppState>, BaseError> {
    let config = CONFIG.clone();
    let db = Database::connect(&config.db_url, config.db_pool_size)?;
    let dispatcher = HttpDispatcher::new(
        &config.upstream,
        config.proxy.as_deref(),
        SecretCipher::new(&config.secret_key),
    )?;
    let app_state = Arc::new(AppState::new(config, db, Arc::new(dispatcher)).await);
    app_state.clear_cache().await;
    Ok(app_state)
}

/// Logs lookup stats of every cache at a fixed interval for the life of the process.
pub fn spawn_cache_reporter(app_state: Arc<AppState>, every: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        loop {
            interval.tick().await;
            for (name, stats) in app_state.cache_stats() {
                info!("cache {}: {}", name, stats);
            }
        }
    });
}

pub type StateRouter = Router<Arc<AppState>>;

pub fn create_state_router() -> StateRouter {
    Router::<Arc<AppState>>::new()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::database::test_support::TestDb;
    use crate::proxy::upstream::{UpstreamError, UpstreamErrorKind, UpstreamReply};
    use crate::service::transform::ChatRequest;
    use crate::database::channel::RoutableChannel;
    use async_trait::async_trait;

    pub struct UnreachableDispatcher;

    #[async_trait]
    impl Dispatcher for UnreachableDispatcher {
        async fn dispatch(&self, _: &RoutableChannel, _: &ChatRequest) -> Result<UpstreamReply, UpstreamError> {
            Err(UpstreamError::new(UpstreamErrorKind::Network, "no upstream in unit tests"))
        }
    }

    pub fn test_config() -> FinalConfig {
        FinalConfig {
            secret_key: "unit-test-secret".to_string(),
            ..Default::default()
        }
    }

    pub async fn test_state(t: &TestDb) -> AppState {
        AppState::new(test_config(), t.db.clone(), Arc::new(UnreachableDispatcher)).await
    }
}
