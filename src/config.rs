use std::{fs, path::Path, time::Duration};

use once_cell::sync::Lazy;
use rand::{distr::Alphanumeric, rng, Rng};
use serde::{Deserialize, Serialize};

// --- START REDIS CONFIG ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            pool_size: default_pool_size(),
            key_prefix: default_key_prefix(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct PartialRedisConfig {
    pub url: Option<String>,
    pub pool_size: Option<usize>,
    pub key_prefix: Option<String>,
}

impl PartialRedisConfig {
    fn merge_into(self, final_config: &mut RedisConfig) {
        if let Some(url) = self.url {
            final_config.url = url;
        }
        if let Some(pool_size) = self.pool_size {
            final_config.pool_size = pool_size;
        }
        if let Some(key_prefix) = self.key_prefix {
            final_config.key_prefix = key_prefix;
        }
    }
}

// --- START CACHE CONFIG ---

/// Cache backend type
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendType {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheRedisConfig {
    #[serde(default = "default_cache_redis_key_prefix")]
    pub key_prefix: String,
}

impl Default for CacheRedisConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_cache_redis_key_prefix(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub backend: CacheBackendType,
    #[serde(default = "default_ttl_seconds")]
    pub ttl: u64,
    #[serde(default = "default_negative_ttl_seconds")]
    pub negative_ttl: u64,
    /// TTL for authentication results and model whitelists.
    #[serde(default = "default_auth_ttl_seconds")]
    pub auth_ttl: u64,
    #[serde(default)]
    pub redis: CacheRedisConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackendType::default(),
            ttl: default_ttl_seconds(),
            negative_ttl: default_negative_ttl_seconds(),
            auth_ttl: default_auth_ttl_seconds(),
            redis: CacheRedisConfig::default(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl)
    }

    pub fn negative_ttl(&self) -> Duration {
        Duration::from_secs(self.negative_ttl)
    }

    pub fn auth_ttl(&self) -> Duration {
        Duration::from_secs(self.auth_ttl)
    }
}

#[derive(Debug, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct PartialCacheRedisConfig {
    pub key_prefix: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct PartialCacheConfig {
    pub backend: Option<CacheBackendType>,
    pub ttl: Option<u64>,
    pub negative_ttl: Option<u64>,
    pub auth_ttl: Option<u64>,
    pub redis: Option<PartialCacheRedisConfig>,
}

impl PartialCacheConfig {
    fn merge_into(self, final_config: &mut CacheConfig) {
        if let Some(backend) = self.backend {
            final_config.backend = backend;
        }
        if let Some(ttl) = self.ttl {
            final_config.ttl = ttl;
        }
        if let Some(negative_ttl) = self.negative_ttl {
            final_config.negative_ttl = negative_ttl;
        }
        if let Some(auth_ttl) = self.auth_ttl {
            final_config.auth_ttl = auth_ttl;
        }
        if let Some(redis) = self.redis {
            if let Some(key_prefix) = redis.key_prefix {
                final_config.redis.key_prefix = key_prefix;
            }
        }
    }
}

// --- START RATE LIMIT CONFIG ---

/// Fixed-window ceilings. IP ceilings are per route family, key ceilings are per API key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_completions_per_ip")]
    pub completions_per_ip: u64,
    #[serde(default = "default_models_per_ip")]
    pub models_per_ip: u64,
    #[serde(default = "default_password_reset_per_ip")]
    pub password_reset_per_ip: u64,
    #[serde(default = "default_key_rpm")]
    pub default_key_rpm: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            completions_per_ip: default_completions_per_ip(),
            models_per_ip: default_models_per_ip(),
            password_reset_per_ip: default_password_reset_per_ip(),
            default_key_rpm: default_key_rpm(),
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

#[derive(Debug, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct PartialRateLimitConfig {
    pub window_secs: Option<u64>,
    pub completions_per_ip: Option<u64>,
    pub models_per_ip: Option<u64>,
    pub password_reset_per_ip: Option<u64>,
    pub default_key_rpm: Option<u64>,
}

impl PartialRateLimitConfig {
    fn merge_into(self, final_config: &mut RateLimitConfig) {
        if let Some(window_secs) = self.window_secs { final_config.window_secs = window_secs; }
        if let Some(v) = self.completions_per_ip { final_config.completions_per_ip = v; }
        if let Some(v) = self.models_per_ip { final_config.models_per_ip = v; }
        if let Some(v) = self.password_reset_per_ip { final_config.password_reset_per_ip = v; }
        if let Some(v) = self.default_key_rpm { final_config.default_key_rpm = v; }
    }
}

// --- START UPSTREAM CONFIG ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Upper bound on channels tried for a single request.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl UpstreamConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct PartialUpstreamConfig {
    pub max_attempts: Option<usize>,
    pub connect_timeout_secs: Option<u64>,
    pub request_timeout_secs: Option<u64>,
}

impl PartialUpstreamConfig {
    fn merge_into(self, final_config: &mut UpstreamConfig) {
        if let Some(v) = self.max_attempts { final_config.max_attempts = v; }
        if let Some(v) = self.connect_timeout_secs { final_config.connect_timeout_secs = v; }
        if let Some(v) = self.request_timeout_secs { final_config.request_timeout_secs = v; }
    }
}

// Default values
fn default_ttl_seconds() -> u64 {
    3600
}

fn default_negative_ttl_seconds() -> u64 {
    60
}

fn default_auth_ttl_seconds() -> u64 {
    30
}

fn default_pool_size() -> usize {
    10
}

fn default_key_prefix() -> String {
    "gateway:".to_string()
}

fn default_cache_redis_key_prefix() -> String {
    "cache:".to_string()
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

fn default_window_secs() -> u64 {
    60
}

fn default_completions_per_ip() -> u64 {
    600
}

fn default_models_per_ip() -> u64 {
    120
}

fn default_password_reset_per_ip() -> u64 {
    5
}

fn default_key_rpm() -> u64 {
    60
}

fn default_max_attempts() -> usize {
    3
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    600
}

// Used for deserializing user-provided config files where all fields are optional.
#[derive(Debug, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct PartialConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub base_path: Option<String>,
    pub trust_forwarded_for: Option<bool>,
    pub secret_key: Option<String>,
    pub db_url: Option<String>,
    pub db_pool_size: Option<u32>,
    pub proxy: Option<String>,
    pub log_level: Option<String>,
    pub redis: Option<PartialRedisConfig>,
    pub cache: Option<PartialCacheConfig>,
    pub rate_limit: Option<PartialRateLimitConfig>,
    pub upstream: Option<PartialUpstreamConfig>,
}

impl PartialConfig {
    /// Merges the fields of this partial config into a final config, overwriting existing values.
    fn merge_into(self, final_config: &mut FinalConfig) {
        if let Some(host) = self.host { final_config.host = host; }
        if let Some(port) = self.port { final_config.port = port; }
        if let Some(base_path) = self.base_path { final_config.base_path = base_path; }
        if let Some(trust) = self.trust_forwarded_for { final_config.trust_forwarded_for = trust; }
        if let Some(secret_key) = self.secret_key { final_config.secret_key = secret_key; }
        if let Some(db_url) = self.db_url { final_config.db_url = db_url; }
        if let Some(db_pool_size) = self.db_pool_size { final_config.db_pool_size = db_pool_size; }
        if let Some(proxy) = self.proxy { final_config.proxy = Some(proxy); }
        if let Some(log_level) = self.log_level { final_config.log_level = log_level; }
        if let Some(redis) = self.redis {
            redis.merge_into(final_config.redis.get_or_insert_with(Default::default));
        }
        if let Some(cache) = self.cache {
            cache.merge_into(&mut final_config.cache)
        }
        if let Some(rate_limit) = self.rate_limit {
            rate_limit.merge_into(&mut final_config.rate_limit)
        }
        if let Some(upstream) = self.upstream {
            upstream.merge_into(&mut final_config.upstream)
        }
    }
}

// The fully resolved configuration used by the application.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FinalConfig {
    pub host: String,
    pub port: u16,
    pub base_path: String,
    pub trust_forwarded_for: bool,
    pub secret_key: String,
    pub db_url: String,
    pub db_pool_size: u32,
    pub proxy: Option<String>,
    pub log_level: String,
    pub redis: Option<RedisConfig>,
    pub cache: CacheConfig,
    pub rate_limit: RateLimitConfig,
    pub upstream: UpstreamConfig,
}

impl Default for FinalConfig {
    fn default() -> Self {
        FinalConfig {
            host: "0.0.0.0".to_string(),
            port: 8000,
            base_path: String::new(),
            trust_forwarded_for: false,
            secret_key: generate_random_string(48),
            db_url: "./storage/sqlite.db".to_string(),
            db_pool_size: 5,
            proxy: None,
            log_level: "info".to_string(),
            redis: None,
            cache: CacheConfig::default(),
            rate_limit: RateLimitConfig::default(),
            upstream: UpstreamConfig::default(),
        }
    }
}

fn generate_random_string(len: usize) -> String {
    rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn get_env_var<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn get_config_from_env() -> PartialConfig {
    let redis = get_env_var::<String>("REDIS_URL").map(|url| PartialRedisConfig {
        url: Some(url),
        ..Default::default()
    });
    PartialConfig {
        host: get_env_var("HOST"),
        port: get_env_var("PORT"),
        base_path: get_env_var("BASE_PATH"),
        trust_forwarded_for: get_env_var("TRUST_FORWARDED_FOR"),
        secret_key: get_env_var("SECRET_KEY"),
        db_url: get_env_var("DB_URL"),
        db_pool_size: get_env_var("DB_POOL_SIZE"),
        proxy: get_env_var("PROXY"),
        log_level: get_env_var("LOG_LEVEL"),
        redis,
        cache: None,
        rate_limit: None,
        upstream: None,
    }
}

fn load_partial(path: &Path) -> Option<PartialConfig> {
    if !path.exists() {
        return None;
    }
    let config_str = fs::read_to_string(path).ok()?;
    let partial: PartialConfig = serde_yaml::from_str(&config_str)
        .unwrap_or_else(|e| panic!("Failed to parse configuration file at {:?}: {}", path, e));
    Some(partial)
}

impl FinalConfig {
    /// Resolves the configuration: programmatic defaults, then `config.default.yaml`,
    /// then the user file, then environment variables.
    pub fn load() -> Self {
        let default_config_path = Path::new("config.default.yaml");
        let user_config_path = if cfg!(debug_assertions) && Path::new("config.local.yaml").exists() {
            Path::new("config.local.yaml")
        } else {
            Path::new("config.yaml")
        };

        let mut final_config = FinalConfig::default();

        if let Some(file_defaults) = load_partial(default_config_path) {
            file_defaults.merge_into(&mut final_config);
        }
        if let Some(user_config) = load_partial(user_config_path) {
            user_config.merge_into(&mut final_config);
        }
        get_config_from_env().merge_into(&mut final_config);

        final_config.normalize();
        final_config
    }

    fn normalize(&mut self) {
        if self.redis.is_none() && self.cache.backend == CacheBackendType::Redis {
            self.cache.backend = CacheBackendType::Memory;
        }
        if self.upstream.max_attempts == 0 {
            self.upstream.max_attempts = 1;
        }
        if self.rate_limit.window_secs == 0 {
            self.rate_limit.window_secs = default_window_secs();
        }
        let trimmed = self.base_path.trim_end_matches('/');
        self.base_path = trimmed.to_string();
    }
}

pub static CONFIG: Lazy<FinalConfig> = Lazy::new(FinalConfig::load);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_merge_overrides_only_given_fields() {
        let mut config = FinalConfig::default();
        let partial: PartialConfig = serde_yaml::from_str(
            "port: 9000\nrate_limit:\n  default_key_rpm: 10\ncache:\n  auth_ttl: 5\n",
        )
        .unwrap();
        partial.merge_into(&mut config);

        assert_eq!(config.port, 9000);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.rate_limit.default_key_rpm, 10);
        assert_eq!(config.rate_limit.window_secs, 60);
        assert_eq!(config.cache.auth_ttl, 5);
        assert_eq!(config.cache.ttl, 3600);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let parsed: Result<PartialConfig, _> = serde_yaml::from_str("jwt_secret: abc\n");
        assert!(parsed.is_err());
    }

    #[test]
    fn test_redis_backend_without_redis_falls_back() {
        let mut config = FinalConfig::default();
        config.cache.backend = CacheBackendType::Redis;
        config.base_path = "/ai/".to_string();
        config.normalize();

        assert_eq!(config.cache.backend, CacheBackendType::Memory);
        assert_eq!(config.base_path, "/ai");
    }
}
