//! Global directory client (L8): one per server URL, with circuit
//! breaker, exponential backoff, reannounce/debounce handling.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::Finder;
use crate::cache::TtlCache;
use crate::cert::pinning::DeviceId;
use crate::config::DiscoveryConfig;
use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Consecutive-failure circuit breaker with a single recovery probe
/// window.
pub struct CircuitBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    threshold: u32,
    recovery: Duration,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, recovery: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            threshold,
            recovery,
        }
    }

    /// Whether a call may proceed right now.
    pub fn allow(&mut self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if self.opened_at.map(|t| t.elapsed() >= self.recovery).unwrap_or(false) {
                    self.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => true,
        }
    }

    pub fn record_success(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
    }

    pub fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        if self.state == CircuitState::HalfOpen || self.consecutive_failures >= self.threshold {
            self.state = CircuitState::Open;
            self.opened_at = Some(Instant::now());
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == CircuitState::Open
    }

    pub fn recovery(&self) -> Duration {
        self.recovery
    }
}

/// Exponential backoff, doubling from a configured base up to a
/// configured max; reset on success.
pub struct Backoff {
    current: Duration,
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { current: base, base, max }
    }

    pub fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

/// Debounces "listen-addresses-changed" events; after enough debounces
/// in close succession, latches "flip-flopping" until the next
/// full re-announce interval (see DESIGN.md Open Question 2 — the
/// latch is permanent-until-next-announce and exposed as observable
/// state rather than auto-clearing).
pub struct FlipFlopTracker {
    recent_changes: VecDeque<Instant>,
    flip_flopping_since: Option<Instant>,
    debounce_window: Duration,
    threshold: u32,
    backoff: Duration,
}

impl FlipFlopTracker {
    pub fn new(debounce_window: Duration, threshold: u32, backoff: Duration) -> Self {
        Self {
            recent_changes: VecDeque::new(),
            flip_flopping_since: None,
            debounce_window,
            threshold,
            backoff,
        }
    }

    /// Records an address-change event; returns whether the tracker just
    /// entered (or remains in) the flip-flopping state.
    pub fn record_change(&mut self) -> bool {
        let now = Instant::now();
        self.recent_changes.retain(|t| now.duration_since(*t) <= self.debounce_window);
        self.recent_changes.push_back(now);

        if self.recent_changes.len() as u32 >= self.threshold {
            self.flip_flopping_since = Some(now);
        }
        self.is_flip_flopping()
    }

    pub fn is_flip_flopping(&self) -> bool {
        match self.flip_flopping_since {
            Some(since) => since.elapsed() < self.backoff,
            None => false,
        }
    }

    /// Explicit reset, since the latch otherwise only clears once a full
    /// re-announce interval elapses.
    pub fn reset(&mut self) {
        self.flip_flopping_since = None;
        self.recent_changes.clear();
    }
}

#[derive(Debug, Serialize)]
struct AnnounceBody<'a> {
    addresses: &'a [String],
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    addresses: Vec<String>,
}

struct NegativeCache {
    entries: std::collections::HashMap<DeviceId, Instant>,
}

impl NegativeCache {
    fn new() -> Self {
        Self {
            entries: std::collections::HashMap::new(),
        }
    }

    fn set(&mut self, device: DeviceId, ttl: Duration) {
        self.entries.insert(device, Instant::now() + ttl);
    }

    fn is_negative(&self, device: &DeviceId) -> bool {
        self.entries.get(device).map(|until| Instant::now() < *until).unwrap_or(false)
    }
}

pub struct GlobalDirectoryClient {
    server_url: String,
    http: Client,
    circuit: Mutex<CircuitBreaker>,
    backoff: Mutex<Backoff>,
    flip_flop: Mutex<FlipFlopTracker>,
    negative_cache: Mutex<NegativeCache>,
    reannounce_interval: Mutex<Duration>,
    positive_cache: TtlCache<DeviceId, Vec<String>>,
    backoff_base: Duration,
    global_negative_ttl: Duration,
    timeout: Duration,
}

impl GlobalDirectoryClient {
    pub fn new(server_url: impl Into<String>, http: Client, config: &DiscoveryConfig) -> Self {
        Self {
            server_url: server_url.into(),
            http,
            circuit: Mutex::new(CircuitBreaker::new(
                config.global_circuit_threshold,
                config.global_circuit_recovery,
            )),
            backoff: Mutex::new(Backoff::new(config.global_backoff_base, config.global_backoff_max)),
            flip_flop: Mutex::new(FlipFlopTracker::new(
                config.flip_flop_debounce,
                config.flip_flop_threshold,
                config.flip_flop_backoff,
            )),
            negative_cache: Mutex::new(NegativeCache::new()),
            reannounce_interval: Mutex::new(config.global_reannounce_default),
            positive_cache: TtlCache::new(config.global_positive_ttl),
            backoff_base: config.global_backoff_base,
            global_negative_ttl: config.global_negative_ttl,
            timeout: config.global_timeout,
        }
    }

    pub async fn reannounce_interval(&self) -> Duration {
        *self.reannounce_interval.lock().await
    }

    pub async fn notify_addresses_changed(&self) -> bool {
        self.flip_flop.lock().await.record_change()
    }

    /// `POST {server} application/json {"addresses":[...]}`.
    pub async fn announce(&self, addresses: &[String]) -> CoreResult<()> {
        {
            let mut circuit = self.circuit.lock().await;
            if !circuit.allow() {
                return Err(CoreError::CircuitOpen {
                    service: self.server_url.clone(),
                    retry_after: circuit.recovery(),
                });
            }
        }

        let body = AnnounceBody { addresses };
        let result = self.http.post(&self.server_url).json(&body).send().await;

        match result {
            Ok(resp) if resp.status().is_success() => {
                if let Some(header) = resp.headers().get("Reannounce-After") {
                    if let Ok(secs) = header.to_str().unwrap_or_default().parse::<u64>() {
                        *self.reannounce_interval.lock().await = Duration::from_secs(secs);
                    }
                }
                self.circuit.lock().await.record_success();
                self.backoff.lock().await.reset();
                Ok(())
            }
            Ok(resp) => {
                let retry_after = parse_retry_after(&resp);
                self.circuit.lock().await.record_failure();
                Err(CoreError::Unreachable(format!("status {}", resp.status()))
                    .with_cache_for(retry_after.unwrap_or_else(|| self.backoff_delay_now())))
            }
            Err(e) => {
                self.circuit.lock().await.record_failure();
                Err(CoreError::from(e).with_cache_for(self.backoff_delay_now()))
            }
        }
    }

    fn backoff_delay_now(&self) -> Duration {
        self.backoff_base
    }

    async fn lookup_inner(&self, device: DeviceId) -> CoreResult<Vec<String>> {
        if self.negative_cache.lock().await.is_negative(&device) {
            return Ok(Vec::new());
        }
        let (cached, hit) = self.positive_cache.get(&device).await;
        if hit {
            if let Some(addrs) = cached {
                return Ok(addrs);
            }
        }

        {
            let mut circuit = self.circuit.lock().await;
            if !circuit.allow() {
                return Err(CoreError::CircuitOpen {
                    service: self.server_url.clone(),
                    retry_after: circuit.recovery(),
                });
            }
        }

        let device_hex = hex::encode(device);
        let result = self
            .http
            .get(&self.server_url)
            .query(&[("device", device_hex)])
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => {
                self.circuit.lock().await.record_success();
                self.backoff.lock().await.reset();
                let parsed: LookupResponse = resp
                    .json()
                    .await
                    .map_err(|e| CoreError::MalformedMessage(e.to_string()))?;
                let addresses = super::filter_addresses(&parsed.addresses);
                self.positive_cache.set(device, addresses.clone()).await;
                Ok(addresses)
            }
            Ok(resp) => {
                let retry_after = parse_retry_after(&resp).unwrap_or(self.global_negative_ttl);
                self.circuit.lock().await.record_failure();
                self.negative_cache.lock().await.set(device, retry_after);
                Err(CoreError::Unreachable(format!("status {}", resp.status())).with_cache_for(retry_after))
            }
            Err(e) => {
                self.circuit.lock().await.record_failure();
                let delay = self.backoff.lock().await.next();
                self.negative_cache.lock().await.set(device, delay);
                Err(CoreError::from(e).with_cache_for(delay))
            }
        }
    }
}

fn parse_retry_after(resp: &reqwest::Response) -> Option<Duration> {
    resp.headers()
        .get("Retry-After")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[async_trait]
impl Finder for GlobalDirectoryClient {
    fn name(&self) -> &'static str {
        "global-directory"
    }

    fn priority(&self) -> i32 {
        2
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn lookup(&self, device: DeviceId) -> CoreResult<Vec<String>> {
        self.lookup_inner(device).await
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            CoreError::Timeout(Duration::from_secs(10))
        } else {
            CoreError::Unreachable(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circuit_opens_after_threshold_failures() {
        let mut breaker = CircuitBreaker::new(5, Duration::from_secs(60));
        for _ in 0..5 {
            breaker.record_failure();
        }
        assert!(breaker.is_open());
        assert!(!breaker.allow());
    }

    #[test]
    fn circuit_recovers_after_success() {
        let mut breaker = CircuitBreaker::new(5, Duration::from_secs(60));
        for _ in 0..5 {
            breaker.record_failure();
        }
        breaker.record_success();
        assert!(!breaker.is_open());
        assert!(breaker.allow());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        assert_eq!(backoff.next(), Duration::from_secs(1));
        assert_eq!(backoff.next(), Duration::from_secs(2));
        assert_eq!(backoff.next(), Duration::from_secs(4));
        backoff.reset();
        assert_eq!(backoff.next(), Duration::from_secs(1));
    }

    #[test]
    fn flip_flop_latches_after_threshold_debounces() {
        let mut tracker =
            FlipFlopTracker::new(Duration::from_secs(2), 10, Duration::from_secs(5 * 60));
        let mut flipping = false;
        for _ in 0..10 {
            flipping = tracker.record_change();
        }
        assert!(flipping);
        assert!(tracker.is_flip_flopping());
    }
}
