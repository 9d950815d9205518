//! Application state management

use std::sync::Arc;

use crate::cache::{CacheBackend, CacheNamespace, MemoryCache};
use crate::config::Config;
use crate::error::Result;
use crate::identity::{IdentityService, LastLoginRecorder, PasswordHasher, Repositories};
use crate::schema::SchemaRegistry;
use crate::session::TokenStore;
use crate::store::{MemoryStore, RowStore};

/// Application state shared across handlers
///
/// Cloning is cheap; every component sits behind an `Arc`.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    registry: Arc<SchemaRegistry>,
    store: Arc<dyn RowStore>,
    cache: Arc<dyn CacheBackend>,
    identity: IdentityService,
}

impl AppState {
    /// Create a new builder for AppState
    pub fn builder() -> AppStateBuilder {
        AppStateBuilder::new()
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn RowStore> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<dyn CacheBackend> {
        &self.cache
    }

    pub fn identity(&self) -> &IdentityService {
        &self.identity
    }
}

/// Builder for AppState
pub struct AppStateBuilder {
    config: Option<Config>,
    enable_tracing: bool,
    store: Option<Arc<dyn RowStore>>,
    cache: Option<Arc<dyn CacheBackend>>,
}

impl AppStateBuilder {
    /// Create a new builder with sensible defaults
    ///
    /// By default:
    /// - Config will be loaded from `Config::default()` if not provided
    /// - Tracing will be auto-initialized if not already set up
    pub fn new() -> Self {
        Self {
            config: None,
            enable_tracing: true,
            store: None,
            cache: None,
        }
    }

    /// Set the configuration
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Use this row store instead of the one the config selects
    ///
    /// The store must have been built against the builtin schemas.
    pub fn store(mut self, store: Arc<dyn RowStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use this cache instead of the one the config selects
    pub fn cache(mut self, cache: Arc<dyn CacheBackend>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Enable automatic tracing initialization (default: enabled)
    pub fn with_tracing(mut self) -> Self {
        self.enable_tracing = true;
        self
    }

    /// Disable automatic tracing initialization
    ///
    /// Use this if your application already has tracing configured.
    pub fn without_tracing(mut self) -> Self {
        self.enable_tracing = false;
        self
    }

    /// Build the AppState, connecting backends as needed
    ///
    /// This will:
    /// - Use provided config or `Config::default()` if not set
    /// - Initialize tracing (unless disabled or already initialized)
    /// - Connect PostgreSQL when `database` is configured, else keep rows in memory
    /// - Connect Redis when `redis` is configured, else keep sessions in memory
    pub async fn build(self) -> Result<AppState> {
        let config = self.config.unwrap_or_default();

        if self.enable_tracing {
            crate::observability::init_tracing(&config)?;
        }

        let registry = Arc::new(SchemaRegistry::builtin()?);

        let store = match self.store {
            Some(store) => store,
            None => Self::connect_store(&config, registry.clone()).await?,
        };
        let cache = match self.cache {
            Some(cache) => cache,
            None => Self::connect_cache(&config).await?,
        };

        let repos = Repositories::new(registry.clone(), store.clone())?;
        let tokens = TokenStore::new(
            cache.clone(),
            CacheNamespace::new(config.session.namespace.clone(), config.session.ttl()),
        )
        .with_create_retries(config.session.create_retries)
        .with_activity_recorder(Arc::new(LastLoginRecorder::new(repos.users.clone())));
        let hasher = PasswordHasher::new(&config.password)?;
        let identity = IdentityService::new(repos, hasher, tokens);

        tracing::info!(
            store = store.backend(),
            cache = cache.backend(),
            "Application state ready"
        );

        Ok(AppState {
            config: Arc::new(config),
            registry,
            store,
            cache,
            identity,
        })
    }

    async fn connect_store(
        config: &Config,
        registry: Arc<SchemaRegistry>,
    ) -> Result<Arc<dyn RowStore>> {
        #[cfg(feature = "database")]
        if let Some(db_config) = &config.database {
            let pool = crate::database::create_pool(db_config).await?;
            return Ok(Arc::new(crate::store::PgStore::new(pool)));
        }

        #[cfg(not(feature = "database"))]
        if config.database.is_some() {
            tracing::warn!("Database configured but the `database` feature is disabled; using in-memory rows");
        }

        Ok(Arc::new(MemoryStore::new(registry)))
    }

    async fn connect_cache(config: &Config) -> Result<Arc<dyn CacheBackend>> {
        #[cfg(feature = "cache")]
        if let Some(redis_config) = &config.redis {
            let cache = crate::cache::RedisCache::connect(redis_config).await?;
            return Ok(Arc::new(cache));
        }

        #[cfg(not(feature = "cache"))]
        if config.redis.is_some() {
            tracing::warn!("Redis configured but the `cache` feature is disabled; using in-memory sessions");
        }

        Ok(Arc::new(MemoryCache::new()))
    }
}

impl Default for AppStateBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PasswordConfig;
    use crate::identity::{NewUser, UserType};

    fn cheap_config() -> Config {
        Config {
            password: PasswordConfig {
                memory_cost_kib: 1024,
                time_cost: 1,
                parallelism: 1,
                min_length: 8,
            },
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_state_builder_defaults() {
        let state = AppStateBuilder::new()
            .without_tracing()
            .build()
            .await
            .unwrap();

        assert_eq!(state.config().service.name, "idhub");
        assert_eq!(state.store().backend(), "memory");
        assert_eq!(state.cache().backend(), "memory");
        assert_eq!(
            state.identity().tokens().namespace().prefix(),
            "IdHub.UserTokenKey"
        );
    }

    #[tokio::test]
    async fn test_state_uses_injected_backends() {
        let registry = Arc::new(SchemaRegistry::builtin().unwrap());
        let store: Arc<dyn RowStore> = Arc::new(MemoryStore::new(registry));
        let cache = Arc::new(MemoryCache::new());

        let state = AppState::builder()
            .config(cheap_config())
            .store(store.clone())
            .cache(cache.clone())
            .without_tracing()
            .build()
            .await
            .unwrap();

        let id = state
            .identity()
            .create_user(NewUser::new("alice01", "s3cret-pass", UserType::P2p))
            .await
            .unwrap()
            .id()
            .unwrap();
        state.identity().login("alice01", "s3cret-pass").await.unwrap();

        assert!(Arc::ptr_eq(state.store(), &store));
        assert_eq!(cache.len(), 1);
        assert!(state
            .identity()
            .repositories()
            .users
            .get(id)
            .await
            .unwrap()
            .get_timestamp("last_login_time")
            .is_some());
    }

    #[tokio::test]
    async fn test_bad_password_params_fail_build() {
        let mut config = cheap_config();
        config.password.parallelism = 0;
        assert!(AppState::builder()
            .config(config)
            .without_tracing()
            .build()
            .await
            .is_err());
    }
}
