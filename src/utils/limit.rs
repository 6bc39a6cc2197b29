use std::sync::Arc;

use cyder_tools::log::{debug, warn};

use crate::config::RateLimitConfig;
use crate::service::cache::types::CacheApiKey;
use crate::service::cache::CounterBackend;

/// Endpoint groups that carry their own per-IP ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteFamily {
    Completions,
    Models,
    /// No route here; the account layer calls `check_ip` with this family.
    PasswordReset,
}

impl RouteFamily {
    pub fn as_str(self) -> &'static str {
        match self {
            RouteFamily::Completions => "completions",
            RouteFamily::Models => "models",
            RouteFamily::PasswordReset => "password_reset",
        }
    }
}

/// Fixed-window admission control on top of a shared counter store.
#[derive(Clone)]
pub struct RateLimiter {
    counter: Arc<dyn CounterBackend>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(counter: Arc<dyn CounterBackend>, config: RateLimitConfig) -> Self {
        Self { counter, config }
    }

    /// Counts one hit for `identity` in `scope` and reports whether it stays
    /// within `ceiling`. A ceiling of 0 disables the check. Counter store
    /// failures admit the request.
    pub async fn check_limit(&self, scope: &str, identity: &str, ceiling: u64) -> bool {
        if ceiling == 0 {
            return true;
        }
        let key = format!("rl:{}:{}", scope, identity);
        match self.counter.incr_window(&key, self.config.window()).await {
            Ok(count) => {
                let allowed = count <= ceiling;
                if !allowed {
                    debug!("rate limit hit: {} ({} > {})", key, count, ceiling);
                }
                allowed
            }
            Err(e) => {
                warn!("rate limit counter unavailable, admitting request: {}", e);
                true
            }
        }
    }

    pub fn ip_ceiling(&self, family: RouteFamily) -> u64 {
        match family {
            RouteFamily::Completions => self.config.completions_per_ip,
            RouteFamily::Models => self.config.models_per_ip,
            RouteFamily::PasswordReset => self.config.password_reset_per_ip,
        }
    }

    pub fn key_ceiling(&self, key: &CacheApiKey) -> u64 {
        match key.rate_limit {
            Some(rpm) if rpm > 0 => rpm as u64,
            _ => self.config.default_key_rpm,
        }
    }

    pub async fn check_ip(&self, family: RouteFamily, ip: &str) -> bool {
        let scope = format!("ip:{}", family.as_str());
        self.check_limit(&scope, ip, self.ip_ceiling(family)).await
    }

    pub async fn check_key(&self, key: &CacheApiKey) -> bool {
        self.check_limit("key", &key.id.to_string(), self.key_ceiling(key)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::cache::memory::MemoryCounterBackend;
    use crate::service::cache::CacheError;
    use async_trait::async_trait;
    use std::time::Duration;

    struct BrokenCounter;

    #[async_trait]
    impl CounterBackend for BrokenCounter {
        async fn incr_window(&self, _key: &str, _window: Duration) -> Result<u64, CacheError> {
            Err(CacheError::BackendError("connection refused".to_string()))
        }
    }

    fn key_with_limit(rate_limit: Option<i32>) -> CacheApiKey {
        CacheApiKey {
            id: 7,
            account_id: 1,
            key_hash: "ffff".to_string(),
            is_active: true,
            expires_at: None,
            total_quota: None,
            rate_limit,
        }
    }

    #[tokio::test]
    async fn test_sixty_first_request_rejected() {
        let limiter = RateLimiter::new(Arc::new(MemoryCounterBackend::new()), RateLimitConfig::default());
        let key = key_with_limit(Some(60));

        for i in 0..60 {
            assert!(limiter.check_key(&key).await, "request {} should pass", i + 1);
        }
        assert!(!limiter.check_key(&key).await);
    }

    #[tokio::test]
    async fn test_ip_families_are_independent() {
        let config = RateLimitConfig {
            completions_per_ip: 2,
            models_per_ip: 1,
            password_reset_per_ip: 1,
            ..Default::default()
        };
        let limiter = RateLimiter::new(Arc::new(MemoryCounterBackend::new()), config);

        assert!(limiter.check_ip(RouteFamily::Models, "10.0.0.1").await);
        assert!(!limiter.check_ip(RouteFamily::Models, "10.0.0.1").await);
        assert!(limiter.check_ip(RouteFamily::Completions, "10.0.0.1").await);
        assert!(limiter.check_ip(RouteFamily::Models, "10.0.0.2").await);
        assert!(limiter.check_ip(RouteFamily::PasswordReset, "10.0.0.1").await);
        assert!(!limiter.check_ip(RouteFamily::PasswordReset, "10.0.0.1").await);
    }

    #[tokio::test]
    async fn test_default_key_ceiling_and_fail_open() {
        let config = RateLimitConfig {
            default_key_rpm: 1,
            ..Default::default()
        };
        let limiter = RateLimiter::new(Arc::new(BrokenCounter), config.clone());
        assert!(limiter.check_key(&key_with_limit(None)).await);
        assert!(limiter.check_key(&key_with_limit(None)).await);

        let limiter = RateLimiter::new(Arc::new(MemoryCounterBackend::new()), config);
        assert_eq!(limiter.key_ceiling(&key_with_limit(Some(0))), 1);
        assert!(limiter.check_key(&key_with_limit(None)).await);
        assert!(!limiter.check_key(&key_with_limit(None)).await);
    }
}
