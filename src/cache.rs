//! In-memory read-through caches.
//!
//! Entries have no TTL: freshness relies on every mutation path calling
//! [`CacheLayer::invalidate`]. The category cache has no invalidation path at all and
//! is treated as static for the process lifetime, so categories edited externally stay
//! stale until restart.

use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::db::{Category, Device};
use crate::metrics::record_cache_lookup;

/// Kinds of cached entities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKind {
    Categories,
    UserDevices,
}

impl CacheKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheKind::Categories => "categories",
            CacheKind::UserDevices => "user_devices",
        }
    }
}

/// A concurrent key → value map populated on miss.
///
/// Concurrent misses may each load and insert; the last insert wins.
#[derive(Debug)]
pub struct ReadThroughCache<V> {
    kind: CacheKind,
    entries: DashMap<String, V>,
    /// Bumped on every invalidation
    generation: AtomicU64,
}

impl<V: Clone> ReadThroughCache<V> {
    pub fn new(kind: CacheKind) -> Self {
        Self {
            kind,
            entries: DashMap::new(),
            generation: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    pub fn insert(&self, key: &str, value: V) {
        self.entries.insert(key.to_string(), value);
    }

    /// Return the cached value or load, cache and return it.
    ///
    /// A load that overlapped an invalidation is returned to the caller but not cached.
    pub async fn get_or_load<F, Fut, E>(&self, key: &str, load: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(key) {
            record_cache_lookup(self.kind.as_str(), true);
            return Ok(value);
        }
        record_cache_lookup(self.kind.as_str(), false);

        let generation = self.generation.load(Ordering::Acquire);
        let value = load().await?;
        if self.generation.load(Ordering::Acquire) == generation {
            self.insert(key, value.clone());
        } else {
            tracing::trace!(cache = self.kind.as_str(), key = %key, "Skipped caching a stale load");
        }
        Ok(value)
    }

    pub fn invalidate(&self, key: &str) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.entries.remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Key under which the single category list is cached
const CATEGORIES_KEY: &str = "all";

/// All caches owned by one engine instance
#[derive(Debug)]
pub struct CacheLayer {
    categories: ReadThroughCache<Arc<Vec<Category>>>,
    user_devices: ReadThroughCache<Arc<Vec<Device>>>,
}

impl Default for CacheLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheLayer {
    pub fn new() -> Self {
        Self {
            categories: ReadThroughCache::new(CacheKind::Categories),
            user_devices: ReadThroughCache::new(CacheKind::UserDevices),
        }
    }

    pub async fn categories<F, Fut, E>(&self, load: F) -> Result<Arc<Vec<Category>>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<Vec<Category>>, E>>,
    {
        self.categories.get_or_load(CATEGORIES_KEY, load).await
    }

    pub fn cached_categories(&self) -> Option<Arc<Vec<Category>>> {
        self.categories.get(CATEGORIES_KEY)
    }

    pub async fn user_devices<F, Fut, E>(&self, user_id: &str, load: F) -> Result<Arc<Vec<Device>>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<Vec<Device>>, E>>,
    {
        self.user_devices.get_or_load(user_id, load).await
    }

    /// Remove one entry. Categories are static reference data and are never invalidated.
    pub fn invalidate(&self, kind: CacheKind, key: &str) {
        match kind {
            CacheKind::Categories => {
                tracing::debug!("Category cache has no invalidation path, ignoring");
            }
            CacheKind::UserDevices => self.user_devices.invalidate(key),
        }
    }

    pub fn len(&self, kind: CacheKind) -> usize {
        match kind {
            CacheKind::Categories => self.categories.len(),
            CacheKind::UserDevices => self.user_devices.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_loads_once_until_invalidated() {
        let cache: ReadThroughCache<u32> = ReadThroughCache::new(CacheKind::UserDevices);
        let loads = AtomicUsize::new(0);

        for _ in 0..3 {
            let value = cache
                .get_or_load("u1", || async {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ()>(7)
                })
                .await
                .unwrap();
            assert_eq!(value, 7);
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        cache.invalidate("u1");
        assert!(cache.get("u1").is_none());

        cache
            .get_or_load("u1", || async {
                loads.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ()>(8)
            })
            .await
            .unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 2);
        assert_eq!(cache.get("u1"), Some(8));
    }

    #[tokio::test]
    async fn test_failed_load_is_not_cached() {
        let cache: ReadThroughCache<u32> = ReadThroughCache::new(CacheKind::UserDevices);
        let result = cache
            .get_or_load("u1", || async { Err::<u32, _>("offline") })
            .await;
        assert_eq!(result, Err("offline"));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_load_racing_an_invalidation_is_not_cached() {
        let cache: ReadThroughCache<u32> = ReadThroughCache::new(CacheKind::UserDevices);
        let value = cache
            .get_or_load("u1", || async {
                cache.invalidate("u1");
                Ok::<_, ()>(1)
            })
            .await
            .unwrap();
        assert_eq!(value, 1);
        assert!(cache.get("u1").is_none());
    }

    #[test]
    fn test_category_invalidation_is_ignored() {
        let layer = CacheLayer::new();
        layer.categories.insert(CATEGORIES_KEY, Arc::new(Vec::new()));
        layer.invalidate(CacheKind::Categories, CATEGORIES_KEY);
        assert_eq!(layer.len(CacheKind::Categories), 1);
    }
}
