//! Discovery manager (L9): merges the connection cache and the three
//! finders behind a single `lookup(device)` call with an overall time
//! budget.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::Finder;
use crate::cache::ConnectionCache;
use crate::cert::pinning::DeviceId;
use crate::config::DiscoveryConfig;
use crate::error::{CoreError, CoreResult};

/// A single finder's contribution, ordered by descending priority
/// (local beacon, then global directory, then peer-assisted).
struct RankedFinder {
    finder: Arc<dyn Finder>,
    priority: i32,
}

/// Ring buffer of a finder's last errors, capped at 50 entries.
struct ErrorRing {
    recent: VecDeque<(Instant, String)>,
}

impl ErrorRing {
    fn new() -> Self {
        Self { recent: VecDeque::new() }
    }

    fn push(&mut self, message: String) {
        if self.recent.len() >= 50 {
            self.recent.pop_front();
        }
        self.recent.push_back((Instant::now(), message));
    }
}

/// Orchestrates concurrent per-source lookups, merges results, and
/// populates the connection cache for subsequent fast-path hits.
pub struct DiscoveryManager {
    finders: Vec<RankedFinder>,
    connection_cache: Arc<ConnectionCache>,
    connection_cache_enabled: bool,
    overall_budget: Duration,
    error_rings: DashMap<&'static str, RwLock<ErrorRing>>,
}

impl DiscoveryManager {
    pub fn new(config: &DiscoveryConfig, connection_cache: Arc<ConnectionCache>) -> Self {
        Self {
            finders: Vec::new(),
            connection_cache,
            connection_cache_enabled: config.connection_cache_enabled,
            overall_budget: config.overall_budget,
            error_rings: DashMap::new(),
        }
    }

    /// Registers a finder at a given priority; higher priority finders'
    /// addresses are ordered first in the merged result.
    pub fn register(&mut self, finder: Arc<dyn Finder>, priority: i32) {
        self.error_rings.insert(finder.name(), RwLock::new(ErrorRing::new()));
        self.finders.push(RankedFinder { finder, priority });
    }

    /// `Lookup(device)`: connection-cache fast path, then a
    /// priority-ordered, concurrent fan-out to every registered finder
    /// bounded by the overall budget, merged and deduplicated.
    pub async fn lookup(&self, device: DeviceId) -> CoreResult<Vec<String>> {
        if let Some(cached) = self.connection_cache.lookup(&device).await {
            debug!(device = %hex::encode(device), "discovery: connection-cache hit");
            return Ok(cached);
        }

        let mut ranked: Vec<&RankedFinder> = self.finders.iter().collect();
        ranked.sort_by(|a, b| b.priority.cmp(&a.priority));

        let budget_deadline = Instant::now() + self.overall_budget;

        let mut handles = Vec::with_capacity(ranked.len());
        for entry in &ranked {
            let finder = entry.finder.clone();
            let per_source_timeout = finder.timeout();
            handles.push(tokio::spawn(async move {
                let name = finder.name();
                let result = timeout(per_source_timeout, finder.lookup(device)).await;
                (name, result)
            }));
        }

        let remaining = budget_deadline.saturating_duration_since(Instant::now());
        let joined = match timeout(remaining, futures_join_all(handles)).await {
            Ok(joined) => joined,
            Err(_) => {
                warn!(device = %hex::encode(device), "discovery: overall budget exceeded");
                Vec::new()
            }
        };

        let mut seen = std::collections::HashSet::new();
        let mut merged = Vec::new();

        for outcome in joined {
            let (name, result) = match outcome {
                Ok(pair) => pair,
                Err(_) => continue,
            };
            match result {
                Ok(Ok(addresses)) => {
                    for addr in addresses {
                        if seen.insert(addr.clone()) {
                            merged.push(addr);
                        }
                    }
                }
                Ok(Err(err)) => self.record_error(name, err).await,
                Err(_) => self.record_error(name, CoreError::Timeout(per_source_timeout_for(&ranked, name))).await,
            }
        }

        if merged.is_empty() {
            return Err(CoreError::Unreachable(format!(
                "no discovery source returned addresses for {}",
                hex::encode(device)
            ))
            .with_cache_for(Duration::from_secs(60)));
        }

        if self.connection_cache_enabled {
            self.connection_cache.update(device, merged.clone()).await;
        }
        Ok(merged)
    }

    async fn record_error(&self, source: &'static str, err: CoreError) {
        if let Some(ring) = self.error_rings.get(source) {
            ring.write().await.push(err.to_string());
        }
    }

    /// Snapshot of the last errors recorded for a named source, most
    /// recent last.
    pub async fn recent_errors(&self, source: &str) -> Vec<String> {
        match self.error_rings.get(source) {
            Some(ring) => ring.read().await.recent.iter().map(|(_, m)| m.clone()).collect(),
            None => Vec::new(),
        }
    }
}

fn per_source_timeout_for(ranked: &[&RankedFinder], name: &str) -> Duration {
    ranked
        .iter()
        .find(|r| r.finder.name() == name)
        .map(|r| r.finder.timeout())
        .unwrap_or(Duration::from_secs(0))
}

/// Small local stand-in for `futures::future::join_all` so the manager
/// doesn't need a whole-crate dependency on `futures` for one call site.
async fn futures_join_all(
    handles: Vec<tokio::task::JoinHandle<(&'static str, Result<CoreResult<Vec<String>>, tokio::time::error::Elapsed>)>>,
) -> Vec<Result<(&'static str, Result<CoreResult<Vec<String>>, tokio::time::error::Elapsed>), tokio::task::JoinError>> {
    let mut out = Vec::with_capacity(handles.len());
    for handle in handles {
        out.push(handle.await);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticFinder {
        name: &'static str,
        priority: i32,
        addresses: Vec<String>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Finder for StaticFinder {
        fn name(&self) -> &'static str {
            self.name
        }
        fn priority(&self) -> i32 {
            self.priority
        }
        fn timeout(&self) -> Duration {
            Duration::from_millis(200)
        }
        async fn lookup(&self, _device: DeviceId) -> CoreResult<Vec<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.addresses.clone())
        }
    }

    struct FailingFinder;

    #[async_trait]
    impl Finder for FailingFinder {
        fn name(&self) -> &'static str {
            "failing"
        }
        fn priority(&self) -> i32 {
            0
        }
        fn timeout(&self) -> Duration {
            Duration::from_millis(200)
        }
        async fn lookup(&self, _device: DeviceId) -> CoreResult<Vec<String>> {
            Err(CoreError::Unreachable("nope".to_string()))
        }
    }

    fn config() -> DiscoveryConfig {
        DiscoveryConfig::default()
    }

    #[tokio::test]
    async fn connection_cache_hit_skips_finders() {
        let cache = Arc::new(ConnectionCache::new(Duration::from_secs(60)));
        let device = [7u8; 32];
        cache.update(device, vec!["tcp://10.0.0.1:22000".to_string()]).await;

        let mut manager = DiscoveryManager::new(&config(), cache);
        manager.register(
            Arc::new(StaticFinder {
                name: "local",
                priority: 3,
                addresses: vec!["tcp://192.0.2.1:22000".to_string()],
                calls: AtomicUsize::new(0),
            }),
            3,
        );

        let result = manager.lookup(device).await.unwrap();
        assert_eq!(result, vec!["tcp://10.0.0.1:22000".to_string()]);
    }

    #[tokio::test]
    async fn merges_and_dedupes_across_finders() {
        let cache = Arc::new(ConnectionCache::new(Duration::from_secs(60)));
        let mut manager = DiscoveryManager::new(&config(), cache);

        manager.register(
            Arc::new(StaticFinder {
                name: "local",
                priority: 3,
                addresses: vec!["tcp://192.0.2.1:22000".to_string()],
                calls: AtomicUsize::new(0),
            }),
            3,
        );
        manager.register(
            Arc::new(StaticFinder {
                name: "global",
                priority: 2,
                addresses: vec![
                    "tcp://192.0.2.1:22000".to_string(),
                    "tcp://192.0.2.2:22000".to_string(),
                ],
                calls: AtomicUsize::new(0),
            }),
            2,
        );

        let result = manager.lookup([9u8; 32]).await.unwrap();
        assert_eq!(result.len(), 2);
    }

    #[tokio::test]
    async fn records_errors_in_ring_buffer() {
        let cache = Arc::new(ConnectionCache::new(Duration::from_secs(60)));
        let mut manager = DiscoveryManager::new(&config(), cache);
        manager.register(Arc::new(FailingFinder), 0);
        manager.register(
            Arc::new(StaticFinder {
                name: "local",
                priority: 3,
                addresses: vec!["tcp://192.0.2.1:22000".to_string()],
                calls: AtomicUsize::new(0),
            }),
            3,
        );

        manager.lookup([3u8; 32]).await.unwrap();
        let errors = manager.recent_errors("failing").await;
        assert_eq!(errors.len(), 1);
    }

    #[tokio::test]
    async fn no_sources_returns_unreachable() {
        let cache = Arc::new(ConnectionCache::new(Duration::from_secs(60)));
        let mut manager = DiscoveryManager::new(&config(), cache);
        manager.register(Arc::new(FailingFinder), 0);

        let result = manager.lookup([5u8; 32]).await;
        assert!(result.is_err());
    }
}
