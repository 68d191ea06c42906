//! Generic TTL cache (L1) and the connection cache built on top of it.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::debug;

/// A single cache slot. `valid_until`, when set, governs expiry instead of
/// `inserted + ttl`.
#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    inserted: Instant,
    valid_until: Option<Instant>,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        match self.valid_until {
            Some(until) => now >= until,
            None => now.saturating_duration_since(self.inserted) > self.ttl,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// Generic keyed TTL cache. Readers observe a consistent snapshot; an
/// expired-on-read entry is indistinguishable from a miss.
pub struct TtlCache<K, V> {
    entries: RwLock<HashMap<K, CacheEntry<V>>>,
    stats: RwLock<CacheStats>,
    default_ttl: Duration,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            stats: RwLock::new(CacheStats::default()),
            default_ttl,
        }
    }

    pub async fn set(&self, key: K, value: V) {
        self.set_with_ttl(key, value, self.default_ttl).await;
    }

    pub async fn set_with_ttl(&self, key: K, value: V, ttl: Duration) {
        let mut entries = self.entries.write().await;
        entries.insert(
            key,
            CacheEntry {
                value,
                inserted: Instant::now(),
                valid_until: None,
                ttl,
            },
        );
    }

    /// Inserts with an absolute expiry instant rather than a relative TTL.
    pub async fn set_until(&self, key: K, value: V, valid_until: Instant) {
        let mut entries = self.entries.write().await;
        entries.insert(
            key,
            CacheEntry {
                value,
                inserted: Instant::now(),
                valid_until: Some(valid_until),
                ttl: self.default_ttl,
            },
        );
    }

    pub async fn get(&self, key: &K) -> (Option<V>, bool) {
        let now = Instant::now();
        let entries = self.entries.read().await;
        match entries.get(key) {
            Some(entry) if !entry.is_expired(now) => {
                drop(entries);
                self.record_hit().await;
                (Some(entry.value.clone()), true)
            }
            Some(_) => {
                drop(entries);
                self.record_miss().await;
                (None, false)
            }
            None => {
                drop(entries);
                self.record_miss().await;
                (None, false)
            }
        }
    }

    /// A read that also evicts the entry on expiry, so it takes the write
    /// lock rather than the read lock.
    pub async fn get_with_ttl(&self, key: &K) -> (Option<V>, bool) {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
                drop(entries);
                self.record_miss().await;
                (None, false)
            }
            Some(entry) => {
                let value = entry.value.clone();
                drop(entries);
                self.record_hit().await;
                (Some(value), true)
            }
            None => {
                drop(entries);
                self.record_miss().await;
                (None, false)
            }
        }
    }

    pub async fn cleanup_expired(&self, default_ttl: Option<Duration>) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| {
            let effective_ttl = default_ttl.unwrap_or(entry.ttl);
            match entry.valid_until {
                Some(until) => now < until,
                None => now.saturating_duration_since(entry.inserted) <= effective_ttl,
            }
        });
        before - entries.len()
    }

    pub async fn stats(&self) -> CacheStats {
        *self.stats.read().await
    }

    async fn record_hit(&self) {
        self.stats.write().await.hits += 1;
    }

    async fn record_miss(&self) {
        self.stats.write().await.misses += 1;
    }
}

/// Spawns the periodic cleanup task (default every 10 minutes). The
/// returned handle is owned by the caller's
/// supervisor; dropping/aborting it stops cleanup.
pub fn spawn_cleanup_task<K, V>(
    cache: Arc<TtlCache<K, V>>,
    interval: Duration,
) -> JoinHandle<()>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let removed = cache.cleanup_expired(None).await;
            if removed > 0 {
                debug!(removed, "ttl cache cleanup");
            }
        }
    })
}

/// DeviceID → (addresses, inserted-at) fast path used by the discovery
/// manager when external discovery is unavailable.
pub struct ConnectionCache {
    inner: TtlCache<[u8; 32], Vec<String>>,
}

impl ConnectionCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: TtlCache::new(ttl),
        }
    }

    pub async fn update(&self, device: [u8; 32], addresses: Vec<String>) {
        if addresses.is_empty() {
            return;
        }
        self.inner.set(device, addresses).await;
    }

    pub async fn lookup(&self, device: &[u8; 32]) -> Option<Vec<String>> {
        self.inner.get(device).await.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_hits() {
        let cache: TtlCache<String, u32> = TtlCache::new(Duration::from_secs(60));
        cache.set("a".to_string(), 1).await;
        let (v, hit) = cache.get(&"a".to_string()).await;
        assert_eq!(v, Some(1));
        assert!(hit);
        assert_eq!(cache.stats().await.hits, 1);
    }

    #[tokio::test]
    async fn expired_entry_reads_as_miss() {
        let cache: TtlCache<String, u32> = TtlCache::new(Duration::from_millis(1));
        cache.set("a".to_string(), 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let (v, hit) = cache.get(&"a".to_string()).await;
        assert_eq!(v, None);
        assert!(!hit);
    }

    #[tokio::test]
    async fn get_with_ttl_evicts_expired() {
        let cache: TtlCache<String, u32> = TtlCache::new(Duration::from_millis(1));
        cache.set("a".to_string(), 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let (v, _) = cache.get_with_ttl(&"a".to_string()).await;
        assert_eq!(v, None);
        assert_eq!(cache.cleanup_expired(None).await, 0);
    }

    #[tokio::test]
    async fn connection_cache_rejects_empty_address_list() {
        let cache = ConnectionCache::new(Duration::from_secs(60));
        let device = [1u8; 32];
        cache.update(device, vec![]).await;
        assert_eq!(cache.lookup(&device).await, None);
        cache
            .update(device, vec!["tcp://10.0.0.1:22000".to_string()])
            .await;
        assert!(cache.lookup(&device).await.is_some());
    }
}
