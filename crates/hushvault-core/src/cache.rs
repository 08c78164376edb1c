//! Bounded TTL cache.
//!
//! Caches small per-user facts the server would otherwise hit storage for on
//! every request (vault existence, most prominently). Entries are keyed
//! `(user_id, resource)`, expire after a fixed TTL, and can be invalidated
//! explicitly when the underlying fact changes. The cache is owned by
//! whoever constructs it — it is never process-global state.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::trace;

#[derive(Debug)]
struct Entry<V> {
    value: V,
    inserted_at: Instant,
}

/// A bounded map from `(user_id, resource)` to `V` with per-entry expiry.
///
/// Eviction at capacity removes the oldest entry by insertion time, which is
/// close enough to LRU for the small capacities this is used with.
#[derive(Debug)]
pub struct TtlCache<V> {
    entries: Mutex<HashMap<(String, String), Entry<V>>>,
    ttl: Duration,
    capacity: usize,
}

impl<V: Clone> TtlCache<V> {
    /// Create a cache holding at most `capacity` entries, each valid for
    /// `ttl` after insertion. A zero capacity caches nothing.
    #[must_use]
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            capacity,
        }
    }

    /// Look up a live entry. Expired entries are removed on access.
    pub async fn get(&self, user_id: &str, resource: &str) -> Option<V> {
        let mut entries = self.entries.lock().await;
        let key = (user_id.to_owned(), resource.to_owned());

        match entries.get(&key) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    /// Insert or refresh an entry.
    pub async fn put(&self, user_id: &str, resource: &str, value: V) {
        if self.capacity == 0 {
            return;
        }

        let mut entries = self.entries.lock().await;
        let key = (user_id.to_owned(), resource.to_owned());

        if !entries.contains_key(&key) && entries.len() >= self.capacity {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.inserted_at)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                trace!(user_id = %oldest.0, resource = %oldest.1, "cache entry evicted");
                entries.remove(&oldest);
            }
        }

        entries.insert(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Drop one entry.
    pub async fn invalidate(&self, user_id: &str, resource: &str) {
        self.entries
            .lock()
            .await
            .remove(&(user_id.to_owned(), resource.to_owned()));
    }

    /// Drop every entry belonging to a user.
    pub async fn invalidate_user(&self, user_id: &str) {
        self.entries.lock().await.retain(|(uid, _), _| uid != user_id);
    }

    /// How many entries are currently held, expired or not.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Whether the cache is empty.
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_roundtrip() {
        let cache = TtlCache::new(Duration::from_secs(60), 16);
        cache.put("user-1", "vault_exists", true).await;
        assert_eq!(cache.get("user-1", "vault_exists").await, Some(true));
        assert_eq!(cache.get("user-1", "other").await, None);
        assert_eq!(cache.get("user-2", "vault_exists").await, None);
    }

    #[tokio::test]
    async fn entries_expire() {
        let cache = TtlCache::new(Duration::ZERO, 16);
        cache.put("user-1", "vault_exists", true).await;
        assert_eq!(cache.get("user-1", "vault_exists").await, None);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn invalidate_is_targeted() {
        let cache = TtlCache::new(Duration::from_secs(60), 16);
        cache.put("user-1", "vault_exists", true).await;
        cache.put("user-1", "profile", false).await;
        cache.put("user-2", "vault_exists", true).await;

        cache.invalidate("user-1", "vault_exists").await;
        assert_eq!(cache.get("user-1", "vault_exists").await, None);
        assert_eq!(cache.get("user-1", "profile").await, Some(false));

        cache.invalidate_user("user-1").await;
        assert_eq!(cache.get("user-1", "profile").await, None);
        assert_eq!(cache.get("user-2", "vault_exists").await, Some(true));
    }

    #[tokio::test]
    async fn capacity_is_bounded() {
        let cache = TtlCache::new(Duration::from_secs(60), 2);
        cache.put("user-1", "a", 1).await;
        cache.put("user-1", "b", 2).await;
        cache.put("user-1", "c", 3).await;

        assert_eq!(cache.len().await, 2);
        // The newest entry always survives.
        assert_eq!(cache.get("user-1", "c").await, Some(3));
    }

    #[tokio::test]
    async fn zero_capacity_caches_nothing() {
        let cache = TtlCache::new(Duration::from_secs(60), 0);
        cache.put("user-1", "a", 1).await;
        assert_eq!(cache.get("user-1", "a").await, None);
    }

    #[tokio::test]
    async fn refresh_does_not_evict() {
        let cache = TtlCache::new(Duration::from_secs(60), 2);
        cache.put("user-1", "a", 1).await;
        cache.put("user-1", "b", 2).await;
        cache.put("user-1", "a", 10).await;

        assert_eq!(cache.len().await, 2);
        assert_eq!(cache.get("user-1", "a").await, Some(10));
        assert_eq!(cache.get("user-1", "b").await, Some(2));
    }
}
