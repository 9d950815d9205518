//! Redis cache on a deadpool connection pool

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::redis::AsyncCommands;
use deadpool_redis::{Config as DeadpoolConfig, Connection, Pool, Runtime};

use super::CacheBackend;
use crate::config::RedisConfig;
use crate::error::{Error, Result};
use crate::store::sanitize_url;

/// [`CacheBackend`] over a bounded Redis pool
///
/// Each call checks a connection out for its own duration; checkout waits at
/// most `acquire_timeout_secs` before failing.
#[derive(Clone)]
pub struct RedisCache {
    pool: Pool,
}

impl RedisCache {
    /// Build the pool, retrying the first connection with exponential backoff
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let pool = create_pool_with_retries(config, config.max_retries).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: Pool) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> Result<Connection> {
        self.pool.get().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to get Redis connection");
            Error::Internal("cache connection unavailable".to_string())
        })
    }
}

async fn create_pool_with_retries(config: &RedisConfig, max_retries: u32) -> Result<Pool> {
    let mut attempt = 0;
    let base_delay = Duration::from_secs(config.retry_delay_secs);

    loop {
        match try_create_pool(config).await {
            Ok(pool) => {
                if attempt > 0 {
                    tracing::info!(
                        "Redis connection established after {} attempt(s)",
                        attempt + 1
                    );
                } else {
                    tracing::info!(
                        "Redis connection pool created: max_connections={}",
                        config.max_connections
                    );
                }
                return Ok(pool);
            }
            Err(e) => {
                attempt += 1;

                if attempt > max_retries {
                    tracing::error!(
                        "Failed to connect to Redis at '{}' after {} attempts: {}",
                        sanitize_url(&config.url),
                        max_retries + 1,
                        e
                    );
                    return Err(Error::Internal(format!(
                        "cache unavailable at '{}'",
                        sanitize_url(&config.url)
                    )));
                }

                let delay = base_delay * 2_u32.pow(attempt.saturating_sub(1));
                tracing::warn!(
                    "Redis connection attempt {} failed: {}. Retrying in {:?}...",
                    attempt,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

async fn try_create_pool(config: &RedisConfig) -> std::result::Result<Pool, String> {
    let pool = DeadpoolConfig::from_url(&config.url)
        .builder()
        .map_err(|e| format!("invalid Redis configuration: {}", e))?
        .max_size(config.max_connections)
        .wait_timeout(Some(Duration::from_secs(config.acquire_timeout_secs)))
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| format!("failed to build Redis pool: {}", e))?;

    // first checkout proves the server is reachable
    let conn = pool.get().await.map_err(|e| e.to_string())?;
    drop(conn);

    Ok(pool)
}

#[async_trait]
impl CacheBackend for RedisCache {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn().await?;
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "Redis SET EX failed");
                Error::Internal("cache write failed".to_string())
            })?;
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn().await?;
        conn.get::<_, Option<String>>(key).await.map_err(|e| {
            tracing::warn!(error = %e, "Redis GET failed");
            Error::Internal("cache read failed".to_string())
        })
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let removed: i64 = conn.del(key).await.map_err(|e| {
            tracing::warn!(error = %e, "Redis DEL failed");
            Error::Internal("cache delete failed".to_string())
        })?;
        Ok(removed > 0)
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}
