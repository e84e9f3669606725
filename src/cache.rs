//! Query-engine response caching.
//!
//! `vout`/`vin_txid`/`vin_spent`/`coinbase`/`block` documents are
//! immutable once written on the canonical chain, so per-key lookups
//! performed while answering an address-detail or unspent request can
//! be served from a short-lived LRU. `address` documents are upserted
//! on every incremental run and get a much shorter TTL. The Orphan
//! Unwinder explicitly invalidates affected keys rather than relying on
//! TTL expiry, since its deletes must be visible immediately.

use lru::LruCache;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

struct CachedEntry<T> {
    value: T,
    expires_at: Instant,
}

impl<T> CachedEntry<T> {
    fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Cache manager holding the generic JSON document cache used by the
/// query engine. Keyed by `"<table>:<key>"`.
pub struct CacheManager {
    json_cache: RwLock<LruCache<String, CachedEntry<serde_json::Value>>>,
}

impl CacheManager {
    pub fn new() -> Self {
        Self::with_capacity(20_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            json_cache: RwLock::new(LruCache::new(NonZeroUsize::new(capacity).unwrap())),
        }
    }

    pub async fn get_json<T>(&self, key: &str) -> Option<T>
    where
        T: DeserializeOwned,
    {
        let mut cache = self.json_cache.write().await;
        if let Some(entry) = cache.get(&key.to_string()) {
            if !entry.is_expired() {
                if let Ok(value) = serde_json::from_value::<T>(entry.value.clone()) {
                    return Some(value);
                }
            } else {
                cache.pop(&key.to_string());
            }
        }
        None
    }

    pub async fn set_json<T>(&self, key: &str, value: &T, ttl: Duration)
    where
        T: Serialize,
    {
        if let Ok(json_value) = serde_json::to_value(value) {
            let entry = CachedEntry::new(json_value, ttl);
            let mut cache = self.json_cache.write().await;
            cache.put(key.to_string(), entry);
        }
    }

    pub async fn invalidate(&self, key: &str) {
        self.json_cache.write().await.pop(&key.to_string());
    }

    /// Invalidate every key with the given `"<table>:"` prefix.
    pub async fn invalidate_prefix(&self, prefix: &str) {
        let mut cache = self.json_cache.write().await;
        let stale: Vec<String> = cache
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale {
            cache.pop(&key);
        }
    }

    pub async fn get_or_compute<F, Fut, T, E>(&self, key: &str, ttl: Duration, compute: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        T: Clone + Serialize + DeserializeOwned,
    {
        if let Some(cached) = self.get_json::<T>(key).await {
            return Ok(cached);
        }
        let value = compute().await?;
        self.set_json(key, &value, ttl).await;
        Ok(value)
    }

    pub async fn len(&self) -> usize {
        self.json_cache.read().await.len()
    }
}

impl Default for CacheManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn caches_and_expires() {
        let cache = CacheManager::new();
        cache.set_json("vout:txid1", &serde_json::json!({"height": 1}), Duration::from_millis(20)).await;
        let got: serde_json::Value = cache.get_json("vout:txid1").await.unwrap();
        assert_eq!(got["height"], 1);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.get_json::<serde_json::Value>("vout:txid1").await.is_none());
    }

    #[tokio::test]
    async fn invalidate_prefix_clears_matching_keys() {
        let cache = CacheManager::new();
        cache.set_json("address:a1", &1, Duration::from_secs(60)).await;
        cache.set_json("vout:t1", &2, Duration::from_secs(60)).await;
        cache.invalidate_prefix("address:").await;
        assert!(cache.get_json::<i32>("address:a1").await.is_none());
        assert!(cache.get_json::<i32>("vout:t1").await.is_some());
    }
}
