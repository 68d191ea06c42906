//! Peer-assisted finder (L8): fan out a query to up-to-K connected
//! peers, scored by connection quality.
//!
//! Responses are correlated only by device-id with no nonce/cookie;
//! results are therefore tagged low-trust and excluded from direct
//! connection-cache promotion by the manager (see DESIGN.md).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::timeout;

use super::Finder;
use crate::cache::TtlCache;
use crate::cert::pinning::DeviceId;
use crate::config::DiscoveryConfig;
use crate::error::{CoreError, CoreResult};
use crate::metrics::{MetricsEvent, MetricsStore};

const COLLECTION_WINDOW: Duration = Duration::from_secs(5);

/// Connected-peer quality score: 40% success-rate, 30% latency (lower
/// better), 30% packet-loss (lower better). Missing metrics contribute
/// a neutral 0.5.
pub fn quality_score(
    success_rate: Option<f64>,
    latency_ms: Option<f64>,
    loss_rate: Option<f64>,
) -> f64 {
    let success_component = success_rate.unwrap_or(0.5);
    let latency_component = latency_ms
        .map(|ms| 1.0 - (ms / 1000.0).clamp(0.0, 1.0))
        .unwrap_or(0.5);
    let loss_component = loss_rate.map(|l| 1.0 - l.clamp(0.0, 1.0)).unwrap_or(0.5);
    0.4 * success_component + 0.3 * latency_component + 0.3 * loss_component
}

/// Capability to send a `QueryDevice` to a specific connected peer and
/// receive its `ResponseDevice`, abstracting over the live connection
/// pool the manager doesn't own directly.
#[async_trait]
pub trait PeerQueryTransport: Send + Sync {
    /// Peers currently connected, with a quality score each.
    async fn scored_peers(&self) -> Vec<(DeviceId, f64)>;

    /// Sends `QueryDevice{id: device}` to `peer` and waits for a
    /// correlated `ResponseDevice` on the returned channel.
    async fn query(&self, peer: DeviceId, device: DeviceId) -> mpsc::Receiver<Vec<String>>;
}

pub struct PeerAssistedFinder<T: PeerQueryTransport> {
    transport: T,
    fanout: usize,
    metrics: Arc<MetricsStore>,
    /// Keyed by queried device; `Some(addrs)` is a positive hit, `None`
    /// a cached negative. Populated with a shorter TTL than the
    /// positive default via `set_with_ttl`.
    cache: TtlCache<DeviceId, Option<Vec<String>>>,
    positive_ttl: Duration,
    negative_ttl: Duration,
    timeout: Duration,
}

impl<T: PeerQueryTransport> PeerAssistedFinder<T> {
    pub fn new(transport: T, metrics: Arc<MetricsStore>, config: &DiscoveryConfig) -> Self {
        Self {
            transport,
            fanout: config.peer_assisted_fanout,
            metrics,
            cache: TtlCache::new(config.peer_positive_ttl),
            positive_ttl: config.peer_positive_ttl,
            negative_ttl: config.peer_negative_ttl,
            timeout: config.peer_timeout,
        }
    }

    pub fn with_fanout(mut self, fanout: usize) -> Self {
        self.fanout = fanout;
        self
    }

    async fn pick_peers(&self) -> Vec<DeviceId> {
        let mut peers = self.transport.scored_peers().await;
        peers.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        peers.into_iter().take(self.fanout).map(|(d, _)| d).collect()
    }
}

#[async_trait]
impl<T: PeerQueryTransport + 'static> Finder for PeerAssistedFinder<T> {
    fn name(&self) -> &'static str {
        "peer-assisted"
    }

    fn priority(&self) -> i32 {
        1
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn lookup(&self, device: DeviceId) -> CoreResult<Vec<String>> {
        let (cached, hit) = self.cache.get(&device).await;
        if hit {
            return match cached.flatten() {
                Some(addrs) => Ok(addrs),
                None => Err(CoreError::Unreachable(
                    "peer-assisted lookup cached negative".to_string(),
                )),
            };
        }

        let peers = self.pick_peers().await;
        if peers.is_empty() {
            return Err(CoreError::Unreachable("no connected peers for peer-assisted lookup".to_string()));
        }

        let mut seen: HashSet<String> = HashSet::new();
        let mut addresses = Vec::new();

        for peer in peers {
            self.metrics.record(peer, MetricsEvent::Attempt);
            let started = std::time::Instant::now();
            let mut rx = self.transport.query(peer, device).await;
            match timeout(COLLECTION_WINDOW, rx.recv()).await {
                Ok(Some(batch)) => {
                    self.metrics
                        .record(peer, MetricsEvent::Success { duration: started.elapsed() });
                    for addr in super::filter_addresses(&batch) {
                        if seen.insert(addr.clone()) {
                            addresses.push(addr);
                        }
                    }
                }
                _ => {
                    self.metrics.record(
                        peer,
                        MetricsEvent::Failure { error: "no response within collection window".to_string() },
                    );
                }
            }
        }

        if addresses.is_empty() {
            self.cache.set_with_ttl(device, None, self.negative_ttl).await;
            Err(CoreError::Unreachable("no peer-assisted responses".to_string()).with_cache_for(self.negative_ttl))
        } else {
            self.cache
                .set_with_ttl(device, Some(addresses.clone()), self.positive_ttl)
                .await;
            Ok(addresses)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn quality_score_uses_neutral_for_missing_metrics() {
        let score = quality_score(None, None, None);
        assert!((score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn quality_score_rewards_low_latency_and_loss() {
        let good = quality_score(Some(0.95), Some(10.0), Some(0.01));
        let bad = quality_score(Some(0.2), Some(900.0), Some(0.8));
        assert!(good > bad);
    }

    struct CountingTransport {
        peer: DeviceId,
        calls: AtomicUsize,
        reply: Vec<String>,
    }

    #[async_trait]
    impl PeerQueryTransport for CountingTransport {
        async fn scored_peers(&self) -> Vec<(DeviceId, f64)> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            vec![(self.peer, 1.0)]
        }

        async fn query(&self, _peer: DeviceId, _device: DeviceId) -> mpsc::Receiver<Vec<String>> {
            let (tx, rx) = mpsc::channel(1);
            let _ = tx.try_send(self.reply.clone());
            rx
        }
    }

    #[tokio::test]
    async fn positive_result_is_served_from_cache_on_second_lookup() {
        let transport = CountingTransport {
            peer: [1u8; 32],
            calls: AtomicUsize::new(0),
            reply: vec!["tcp://192.0.2.1:22000".to_string()],
        };
        let finder = PeerAssistedFinder::new(
            transport,
            Arc::new(MetricsStore::new(Default::default())),
            &DiscoveryConfig::default(),
        );

        let first = finder.lookup([9u8; 32]).await.unwrap();
        assert!(!first.is_empty());
        let second = finder.lookup([9u8; 32]).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(finder.transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_response_is_cached_as_negative() {
        let transport = CountingTransport {
            peer: [2u8; 32],
            calls: AtomicUsize::new(0),
            reply: vec![],
        };
        let finder = PeerAssistedFinder::new(
            transport,
            Arc::new(MetricsStore::new(Default::default())),
            &DiscoveryConfig::default(),
        );

        assert!(finder.lookup([8u8; 32]).await.is_err());
        assert!(finder.lookup([8u8; 32]).await.is_err());
        assert_eq!(finder.transport.calls.load(Ordering::SeqCst), 1);
    }
}
