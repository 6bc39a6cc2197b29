use bb8::Pool;
use bb8_redis::{redis, RedisConnectionManager};
use cyder_tools::log::{error, info};

use crate::config::RedisConfig;

pub type RedisPool = Pool<RedisConnectionManager>;

/// Builds and pings a pool. `None` means Redis is unusable and callers fall
/// back to in-process state.
pub async fn create_pool(redis_config: Option<&RedisConfig>) -> Option<RedisPool> {
    let redis_config = redis_config?;
    let manager = match RedisConnectionManager::new(redis_config.url.as_str()) {
        Ok(manager) => manager,
        Err(e) => {
            error!("Failed to create redis manager: {}", e);
            return None;
        }
    };
    let pool = match Pool::builder()
        .max_size(redis_config.pool_size as u32)
        .build(manager)
        .await
    {
        Ok(pool) => pool,
        Err(e) => {
            error!("Failed to create redis pool: {}", e);
            return None;
        }
    };

    {
        let mut conn = match pool.get().await {
            Ok(conn) => conn,
            Err(e) => {
                error!("Failed to get redis connection from pool for test: {}", e);
                return None;
            }
        };
        if let Err(e) = redis::cmd("PING").query_async::<()>(&mut *conn).await {
            error!("Failed to ping redis: {}", e);
            return None;
        }
    }
    info!("Redis connection pool initialized and tested successfully");
    Some(pool)
}
