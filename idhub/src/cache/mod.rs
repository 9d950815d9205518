//! TTL key-value cache
//!
//! [`CacheBackend`] is the seam the token store writes through. Two
//! backends ship with the crate: [`MemoryCache`] for single-process
//! deployments and tests, and `RedisCache` behind the `cache` feature.
//!
//! Keys are namespaced as `<namespace>.<token>`:
//!
//! ```rust
//! use std::time::Duration;
//! use idhub::cache::CacheNamespace;
//!
//! let ns = CacheNamespace::new("IdHub.UserTokenKey", Duration::from_secs(10800));
//! assert_eq!(ns.key("abc"), "IdHub.UserTokenKey.abc");
//! ```

mod memory;
#[cfg(feature = "cache")]
mod redis;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

pub use memory::MemoryCache;
#[cfg(feature = "cache")]
pub use redis::RedisCache;

/// Key-value store whose entries lapse after a per-write TTL
///
/// Every call borrows a backend connection for its own duration. Backend
/// failures surface as [`crate::Error::Internal`].
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Unconditionally write `value` under `key`; returns whether the write was accepted
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Current value, `None` when absent or lapsed
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Remove `key`; returns whether anything was removed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Short backend name for logs
    fn backend(&self) -> &'static str;
}

/// Key prefix and fixed TTL shared by every entry of one kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheNamespace {
    prefix: String,
    ttl: Duration,
}

impl CacheNamespace {
    pub fn new(prefix: impl Into<String>, ttl: Duration) -> Self {
        Self {
            prefix: prefix.into(),
            ttl,
        }
    }

    pub fn key(&self, id: &str) -> String {
        format!("{}.{}", self.prefix, id)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}
