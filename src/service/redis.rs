use bb8::Pool;
use bb8_redis::{redis, RedisConnectionManager};
use cyder_tools::log::{error, info};

use crate::config::RedisConfig;

pub type RedisPool = Pool<RedisConnectionManager>;

/// Builds and pings a pool. `None` means redis is unusable and callers fall back to memory.
pub async fn connect(config: &RedisConfig) -> Option<RedisPool> {
    let manager = match RedisConnectionManager::new(config.url.as_str()) {
        Ok(manager) => manager,
        Err(e) => {
            error!("Failed to create redis manager: {}", e);
            return None;
        }
    };
    let pool = match Pool::builder()
        .max_size(config.pool_size.max(1) as u32)
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
        let pong: Result<String, _> = redis::cmd("PING").query_async(&mut *conn).await;
        if let Err(e) = pong {
            error!("Failed to ping redis: {}", e);
            return None;
        }
    }
    info!("Redis connection pool initialized and tested successfully");
    Some(pool)
}
