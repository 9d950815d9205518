//! In-process cache on a concurrent map
//!
//! Expiry is measured on the tokio clock so paused-time tests can advance
//! past a TTL without sleeping. Lapsed entries are dropped lazily on read.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use super::CacheBackend;
use crate::error::Result;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

/// In-process [`CacheBackend`]
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: DashMap<String, Entry>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| e.expires_at > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every lapsed entry
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before - self.entries.len()
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        let value = match self.entries.get(key) {
            Some(entry) if entry.expires_at > now => return Ok(Some(entry.value.clone())),
            Some(_) => None,
            None => return Ok(None),
        };
        // the read guard is released before removing
        self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, entry)| entry.expires_at > now))
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_entry_lapses_after_ttl() {
        let cache = MemoryCache::new();
        assert!(cache.set("k", "v", Duration::from_secs(10)).await.unwrap());
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(cache.get("k").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get("k").await.unwrap().is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_overwrites_and_resets_ttl() {
        let cache = MemoryCache::new();
        cache.set("k", "one", Duration::from_secs(5)).await.unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;
        cache.set("k", "two", Duration::from_secs(5)).await.unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("two"));
    }

    #[tokio::test]
    async fn test_delete_reports_removal() {
        let cache = MemoryCache::new();
        cache.set("k", "v", Duration::from_secs(60)).await.unwrap();
        assert!(cache.delete("k").await.unwrap());
        assert!(!cache.delete("k").await.unwrap());
        assert!(cache.get("k").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let cache = MemoryCache::new();
        cache.set("a", "1", Duration::from_secs(1)).await.unwrap();
        cache.set("b", "2", Duration::from_secs(100)).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
    }
}
