//! Session tokens with sliding expiration
//!
//! A token is an opaque random id whose cache entry holds a snapshot of the
//! signed-in identity. Presence of the entry means the session is valid;
//! absence, whether from TTL lapse, revocation or a token that never
//! existed, is reported uniformly as [`Error::Expired`]. Every successful
//! [`TokenStore::check`] rewrites the entry with a fresh TTL.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use idhub::cache::{CacheNamespace, MemoryCache};
//! use idhub::session::{SessionPayload, TokenStore};
//!
//! # async fn example() -> idhub::Result<()> {
//! let tokens = TokenStore::new(
//!     Arc::new(MemoryCache::new()),
//!     CacheNamespace::new("IdHub.UserTokenKey", Duration::from_secs(10800)),
//! );
//!
//! let payload = SessionPayload::new(1, "alice01", "p2p").with_roles(["admin"]);
//! let token = tokens.create(&payload).await?;
//! assert_eq!(tokens.check(&token).await?, payload);
//!
//! tokens.revoke(&token).await?;
//! assert!(tokens.check(&token).await.is_err());
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::{CacheBackend, CacheNamespace};
use crate::error::{Error, Result};

/// Write attempts made by [`TokenStore::create`] before giving up
pub const DEFAULT_CREATE_RETRIES: u32 = 5;

/// Identity snapshot stored under a session token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPayload {
    pub id: i64,
    pub username: String,
    #[serde(rename = "type")]
    pub user_type: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl SessionPayload {
    pub fn new(id: i64, username: impl Into<String>, user_type: impl Into<String>) -> Self {
        Self {
            id,
            username: username.into(),
            user_type: user_type.into(),
            roles: Vec::new(),
            email: None,
            description: None,
        }
    }

    #[must_use]
    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// True when the session holds at least one of `required`
    ///
    /// An empty requirement list is satisfied by any session.
    pub fn has_any_role<S: AsRef<str>>(&self, required: &[S]) -> bool {
        required.is_empty()
            || required
                .iter()
                .any(|r| self.roles.iter().any(|have| have == r.as_ref()))
    }

    /// Fail with [`Error::PermissionDenied`] unless [`Self::has_any_role`] holds
    pub fn require_any_role<S: AsRef<str>>(&self, required: &[S]) -> Result<()> {
        if self.has_any_role(required) {
            Ok(())
        } else {
            Err(Error::PermissionDenied(format!(
                "{} lacks a required role",
                self.username
            )))
        }
    }
}

/// Side effect run after a session is created
#[async_trait]
pub trait ActivityRecorder: Send + Sync {
    async fn record_activity(&self, user_id: i64) -> Result<()>;
}

/// Session lifecycle over a TTL cache
#[derive(Clone)]
pub struct TokenStore {
    cache: Arc<dyn CacheBackend>,
    namespace: CacheNamespace,
    create_retries: u32,
    activity: Option<Arc<dyn ActivityRecorder>>,
}

impl TokenStore {
    pub fn new(cache: Arc<dyn CacheBackend>, namespace: CacheNamespace) -> Self {
        Self {
            cache,
            namespace,
            create_retries: DEFAULT_CREATE_RETRIES,
            activity: None,
        }
    }

    #[must_use]
    pub fn with_create_retries(mut self, retries: u32) -> Self {
        self.create_retries = retries.max(1);
        self
    }

    #[must_use]
    pub fn with_activity_recorder(mut self, recorder: Arc<dyn ActivityRecorder>) -> Self {
        self.activity = Some(recorder);
        self
    }

    pub fn namespace(&self) -> &CacheNamespace {
        &self.namespace
    }

    /// Persist `payload` under a fresh token and return the token
    ///
    /// The write is retried up to the configured number of attempts; running
    /// out fails with [`Error::Internal`]. After the write the activity
    /// recorder runs and its failure fails the call.
    pub async fn create(&self, payload: &SessionPayload) -> Result<String> {
        let token = Uuid::new_v4().simple().to_string();
        let key = self.namespace.key(&token);
        let body = serde_json::to_string(payload)
            .map_err(|e| Error::Internal(format!("failed to encode session: {}", e)))?;

        let mut stored = false;
        for attempt in 1..=self.create_retries {
            match self.cache.set(&key, &body, self.namespace.ttl()).await {
                Ok(true) => {
                    stored = true;
                    break;
                }
                Ok(false) => {
                    warn!(attempt, user_id = payload.id, "Session write rejected");
                }
                Err(e) => {
                    warn!(attempt, user_id = payload.id, error = %e, "Session write failed");
                }
            }
        }
        if !stored {
            error!(
                user_id = payload.id,
                attempts = self.create_retries,
                backend = self.cache.backend(),
                "Session write retries exhausted"
            );
            return Err(Error::Internal("could not create session".to_string()));
        }

        if let Some(recorder) = &self.activity {
            recorder.record_activity(payload.id).await?;
        }

        info!(user_id = payload.id, username = %payload.username, "Session created");
        Ok(token)
    }

    /// Payload of a live token, renewing its TTL
    ///
    /// A failed renewal is logged and the payload is still returned.
    pub async fn check(&self, token: &str) -> Result<SessionPayload> {
        let key = self.namespace.key(token);
        let body = match self.cache.get(&key).await {
            Ok(Some(body)) => body,
            Ok(None) => {
                debug!("Session token absent");
                return Err(Error::Expired);
            }
            Err(e) => {
                error!(error = %e, "Session lookup failed");
                return Err(Error::Internal("session lookup failed".to_string()));
            }
        };

        let payload: SessionPayload = serde_json::from_str(&body).map_err(|e| {
            error!(error = %e, "Stored session is unreadable");
            Error::Internal("stored session is unreadable".to_string())
        })?;

        match self.cache.set(&key, &body, self.namespace.ttl()).await {
            Ok(true) => {}
            Ok(false) => warn!(user_id = payload.id, "Session renewal rejected"),
            Err(e) => warn!(user_id = payload.id, error = %e, "Session renewal failed"),
        }

        Ok(payload)
    }

    /// Explicitly reset a token's TTL
    pub async fn renew(&self, token: &str) -> Result<SessionPayload> {
        self.check(token).await
    }

    /// Remove a live token
    ///
    /// Existence is confirmed through [`Self::check`] first, so an absent
    /// token fails with [`Error::Expired`].
    pub async fn revoke(&self, token: &str) -> Result<bool> {
        let payload = self.check(token).await?;
        let key = self.namespace.key(token);
        match self.cache.delete(&key).await {
            Ok(true) => {
                info!(user_id = payload.id, "Session revoked");
                Ok(true)
            }
            Ok(false) => {
                debug!(user_id = payload.id, "Session already gone when revoked");
                Err(Error::Expired)
            }
            Err(e) => {
                error!(user_id = payload.id, error = %e, "Session revoke failed");
                Err(Error::Internal("could not revoke session".to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    const TTL: Duration = Duration::from_secs(60);

    fn payload() -> SessionPayload {
        SessionPayload::new(7, "alice01", "p2p")
            .with_roles(["admin", "auditor"])
            .with_email("alice@example.com")
    }

    fn store(cache: Arc<dyn CacheBackend>) -> TokenStore {
        TokenStore::new(cache, CacheNamespace::new("IdHub.UserTokenKey", TTL))
    }

    /// Fails the first `fail_sets` writes, and every read when `fail_gets` is set
    struct FlakyCache {
        inner: MemoryCache,
        fail_sets: AtomicU32,
        fail_gets: bool,
        set_calls: AtomicU32,
    }

    impl FlakyCache {
        fn new(fail_sets: u32) -> Self {
            Self {
                inner: MemoryCache::new(),
                fail_sets: AtomicU32::new(fail_sets),
                fail_gets: false,
                set_calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl CacheBackend for FlakyCache {
        async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
            self.set_calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.fail_sets.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_sets.store(remaining - 1, Ordering::SeqCst);
                return Err(Error::Internal("cache write failed".into()));
            }
            self.inner.set(key, value, ttl).await
        }

        async fn get(&self, key: &str) -> Result<Option<String>> {
            if self.fail_gets {
                return Err(Error::Internal("cache read failed".into()));
            }
            self.inner.get(key).await
        }

        async fn delete(&self, key: &str) -> Result<bool> {
            self.inner.delete(key).await
        }

        fn backend(&self) -> &'static str {
            "flaky"
        }
    }

    /// Yields to the scheduler before every call so concurrent callers interleave
    struct YieldingCache {
        inner: MemoryCache,
    }

    #[async_trait]
    impl CacheBackend for YieldingCache {
        async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
            tokio::task::yield_now().await;
            self.inner.set(key, value, ttl).await
        }

        async fn get(&self, key: &str) -> Result<Option<String>> {
            tokio::task::yield_now().await;
            self.inner.get(key).await
        }

        async fn delete(&self, key: &str) -> Result<bool> {
            tokio::task::yield_now().await;
            self.inner.delete(key).await
        }

        fn backend(&self) -> &'static str {
            "yielding"
        }
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl ActivityRecorder for Recorder {
        async fn record_activity(&self, user_id: i64) -> Result<()> {
            self.seen.lock().unwrap().push(user_id);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_create_then_check_returns_payload() {
        let cache = Arc::new(MemoryCache::new());
        let tokens = store(cache.clone());
        let token = tokens.create(&payload()).await.unwrap();

        assert_eq!(tokens.check(&token).await.unwrap(), payload());
        assert!(cache
            .get(&format!("IdHub.UserTokenKey.{}", token))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_tokens_are_unique() {
        let tokens = store(Arc::new(MemoryCache::new()));
        let a = tokens.create(&payload()).await.unwrap();
        let b = tokens.create(&payload()).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_slides_expiry() {
        let tokens = store(Arc::new(MemoryCache::new()));
        let token = tokens.create(&payload()).await.unwrap();

        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(45)).await;
            assert_eq!(tokens.check(&token).await.unwrap(), payload());
        }

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(matches!(tokens.check(&token).await, Err(Error::Expired)));
    }

    #[tokio::test]
    async fn test_unknown_token_is_expired() {
        let tokens = store(Arc::new(MemoryCache::new()));
        assert!(matches!(tokens.check("nope").await, Err(Error::Expired)));
        assert!(matches!(tokens.revoke("nope").await, Err(Error::Expired)));
    }

    #[tokio::test]
    async fn test_revoke_then_check_is_expired() {
        let tokens = store(Arc::new(MemoryCache::new()));
        let token = tokens.create(&payload()).await.unwrap();

        assert!(tokens.revoke(&token).await.unwrap());
        assert!(matches!(tokens.check(&token).await, Err(Error::Expired)));
        assert!(matches!(tokens.revoke(&token).await, Err(Error::Expired)));
    }

    #[tokio::test]
    async fn test_concurrent_revoke_expires_the_loser() {
        let tokens = store(Arc::new(YieldingCache {
            inner: MemoryCache::new(),
        }));
        let token = tokens.create(&payload()).await.unwrap();

        let (a, b) = tokio::join!(tokens.revoke(&token), tokens.revoke(&token));
        let outcomes = [a, b];
        assert_eq!(outcomes.iter().filter(|r| matches!(r, Ok(true))).count(), 1);
        assert_eq!(
            outcomes.iter().filter(|r| matches!(r, Err(Error::Expired))).count(),
            1
        );
        assert!(matches!(tokens.check(&token).await, Err(Error::Expired)));
    }

    #[tokio::test]
    async fn test_create_retries_failed_writes() {
        let cache = Arc::new(FlakyCache::new(3));
        let tokens = store(cache.clone());
        let token = tokens.create(&payload()).await.unwrap();

        assert_eq!(cache.set_calls.load(Ordering::SeqCst), 4);
        assert_eq!(tokens.check(&token).await.unwrap().id, 7);
    }

    #[tokio::test]
    async fn test_create_gives_up_after_retries() {
        let cache = Arc::new(FlakyCache::new(10));
        let recorder = Arc::new(Recorder::default());
        let tokens = store(cache.clone()).with_activity_recorder(recorder.clone());

        assert!(matches!(
            tokens.create(&payload()).await,
            Err(Error::Internal(_))
        ));
        assert_eq!(
            cache.set_calls.load(Ordering::SeqCst),
            DEFAULT_CREATE_RETRIES
        );
        assert!(recorder.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_records_activity() {
        let recorder = Arc::new(Recorder::default());
        let tokens =
            store(Arc::new(MemoryCache::new())).with_activity_recorder(recorder.clone());
        tokens.create(&payload()).await.unwrap();
        assert_eq!(*recorder.seen.lock().unwrap(), vec![7]);
    }

    #[tokio::test]
    async fn test_failed_renewal_still_returns_payload() {
        let cache = Arc::new(FlakyCache::new(0));
        let tokens = store(cache.clone());
        let token = tokens.create(&payload()).await.unwrap();

        cache.fail_sets.store(1, Ordering::SeqCst);
        assert_eq!(tokens.check(&token).await.unwrap(), payload());
    }

    #[tokio::test]
    async fn test_cache_read_failure_is_internal() {
        let cache = Arc::new(FlakyCache {
            fail_gets: true,
            ..FlakyCache::new(0)
        });
        let tokens = store(cache);
        assert!(matches!(tokens.check("any").await, Err(Error::Internal(_))));
    }

    #[test]
    fn test_has_any_role() {
        let p = payload();
        assert!(p.has_any_role(&["auditor"]));
        assert!(p.has_any_role(&["nobody", "admin"]));
        assert!(!p.has_any_role(&["nobody"]));
        assert!(p.has_any_role::<&str>(&[]));
        assert!(matches!(
            p.require_any_role(&["root"]),
            Err(Error::PermissionDenied(_))
        ));
    }

    #[test]
    fn test_payload_serializes_type_field() {
        let json = serde_json::to_value(payload()).unwrap();
        assert_eq!(json["type"], "p2p");
        assert_eq!(json["roles"][1], "auditor");
    }
}
