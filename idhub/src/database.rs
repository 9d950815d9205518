//! PostgreSQL pool management and schema migrations

use std::time::Duration;

use sqlx::{postgres::PgPoolOptions, PgPool};

use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use crate::store::{sanitize_url, StoreError, StoreOperation};

/// Create a PostgreSQL connection pool, retrying with exponential backoff
///
/// Runs the bundled migrations when `run_migrations` is set.
pub(crate) async fn create_pool(config: &DatabaseConfig) -> Result<PgPool> {
    let pool = create_pool_with_retries(config, config.max_retries).await?;
    if config.run_migrations {
        run_migrations(&pool).await?;
    }
    Ok(pool)
}

async fn create_pool_with_retries(config: &DatabaseConfig, max_retries: u32) -> Result<PgPool> {
    let mut attempt = 0;
    let base_delay = Duration::from_secs(config.retry_delay_secs);

    loop {
        match try_create_pool(config).await {
            Ok(pool) => {
                if attempt > 0 {
                    tracing::info!(
                        "Database connection established after {} attempt(s)",
                        attempt + 1
                    );
                } else {
                    tracing::info!(
                        "Database connection pool created: max={}, min={}",
                        config.max_connections,
                        config.min_connections
                    );
                }
                return Ok(pool);
            }
            Err(e) => {
                attempt += 1;

                if attempt > max_retries || !e.is_retriable() {
                    tracing::error!(
                        "Failed to connect to database at '{}' after {} attempt(s): {}",
                        sanitize_url(&config.url),
                        attempt,
                        e
                    );
                    return Err(Error::Internal(format!(
                        "database unavailable at '{}'",
                        sanitize_url(&config.url)
                    )));
                }

                let delay = base_delay * 2_u32.pow(attempt.saturating_sub(1));
                tracing::warn!(
                    "Database connection attempt {} failed: {}. Retrying in {:?}...",
                    attempt,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

async fn try_create_pool(config: &DatabaseConfig) -> std::result::Result<PgPool, StoreError> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.connection_timeout_secs))
        .connect(&config.url)
        .await
        .map_err(|e| StoreError::from(e).during(StoreOperation::Connect))
}

/// Apply the migrations under `migrations/`
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await.map_err(|e| {
        tracing::error!(error = %e, "Schema migration failed");
        Error::Internal(format!("schema migration failed: {}", e))
    })?;
    tracing::info!("Schema migrations applied");
    Ok(())
}
