//! In-memory TTL cache with thread-safe async access.
//!
//! Used for geocode lookups (24h), coupons and the delivery settings row
//! (short TTLs). The cache is process-local: every instance keeps its own
//! copy, so writes that must be seen everywhere go through `invalidate`
//! on the writing instance and otherwise age out.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use model::Clock;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: DateTime<Utc>,
}

/// Thread-safe cache whose entries expire `ttl` after insertion.
#[derive(Debug)]
pub struct TtlCache<K, V> {
    name: &'static str,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    inner: RwLock<HashMap<K, CacheEntry<V>>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone + Debug,
    V: Clone,
{
    /// Create a new, empty cache.
    ///
    /// # Arguments
    /// * `name`: label used in log lines.
    /// * `ttl`: lifetime of each entry.
    /// * `clock`: time source for expiry decisions.
    pub fn new(name: &'static str, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            name,
            ttl,
            clock,
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Get a cloned value if present and not expired.
    pub async fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        let map = self.inner.read().await;
        map.get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.value.clone())
    }

    /// Insert or replace a value, restarting its TTL.
    pub async fn set(&self, key: K, value: V) {
        let expires_at = self.clock.now() + self.ttl;
        let mut map = self.inner.write().await;
        map.insert(key, CacheEntry { value, expires_at });
    }

    pub async fn invalidate(&self, key: &K) {
        let mut map = self.inner.write().await;
        if map.remove(key).is_some() {
            debug!(cache = self.name, ?key, "Cache entry invalidated");
        }
    }

    pub async fn clear(&self) {
        self.inner.write().await.clear();
        debug!(cache = self.name, "Cache cleared");
    }

    /// Drops expired entries. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut map = self.inner.write().await;
        let before = map.len();
        map.retain(|_, entry| entry.expires_at > now);
        before - map.len()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}
