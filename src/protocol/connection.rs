//! Connection engine: adaptive keep-alive and health scoring (L11).

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ConnectionConfig;
use crate::service::Service;

const RTT_EWMA_ALPHA: f64 = 0.3;
const MAX_RTT_SAMPLES: usize = 20;

/// Tracks RTT/jitter/loss/idleness for a single connection and derives a
/// health score in `[0, 1]`.
pub struct HealthTracker {
    config: ConnectionConfig,
    rtt_avg: Option<f64>,
    recent_rtts: VecDeque<f64>,
    pings_sent: u32,
    pings_lost: u32,
    last_write: Instant,
    consecutive_degraded: u32,
    stressed: bool,
}

impl HealthTracker {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            rtt_avg: None,
            recent_rtts: VecDeque::new(),
            pings_sent: 0,
            pings_lost: 0,
            last_write: Instant::now(),
            consecutive_degraded: 0,
            stressed: false,
        }
    }

    pub fn record_ping_success(&mut self, rtt: Duration) {
        self.pings_sent += 1;
        let rtt_ms = rtt.as_secs_f64() * 1000.0;
        self.rtt_avg = Some(match self.rtt_avg {
            Some(avg) => RTT_EWMA_ALPHA * rtt_ms + (1.0 - RTT_EWMA_ALPHA) * avg,
            None => rtt_ms,
        });
        self.recent_rtts.push_back(rtt_ms);
        if self.recent_rtts.len() > MAX_RTT_SAMPLES {
            self.recent_rtts.pop_front();
        }
    }

    pub fn record_ping_loss(&mut self) {
        self.pings_sent += 1;
        self.pings_lost += 1;
    }

    pub fn record_write_activity(&mut self) {
        self.last_write = Instant::now();
    }

    fn jitter_ms(&self) -> f64 {
        if self.recent_rtts.len() < 2 {
            return 0.0;
        }
        let avg: f64 = self.recent_rtts.iter().sum::<f64>() / self.recent_rtts.len() as f64;
        let variance = self
            .recent_rtts
            .iter()
            .map(|v| (v - avg).powi(2))
            .sum::<f64>()
            / self.recent_rtts.len() as f64;
        variance.sqrt()
    }

    fn loss_rate(&self) -> f64 {
        if self.pings_sent == 0 {
            0.0
        } else {
            self.pings_lost as f64 / self.pings_sent as f64
        }
    }

    /// Health score in `[0, 1]`; higher is healthier. Lower RTT, lower
    /// jitter, lower loss, and recent write activity all push the score
    /// up.
    pub fn score(&self) -> f64 {
        let rtt_component = match self.rtt_avg {
            Some(avg) => 1.0 - (avg / 1000.0).clamp(0.0, 1.0),
            None => 1.0,
        };
        let jitter_component = 1.0 - (self.jitter_ms() / 500.0).clamp(0.0, 1.0);
        let loss_component = 1.0 - self.loss_rate();
        let idleness_component = if self.last_write.elapsed() > Duration::from_secs(300) {
            0.5
        } else {
            1.0
        };

        (0.4 * rtt_component + 0.2 * jitter_component + 0.3 * loss_component + 0.1 * idleness_component)
            .clamp(0.0, 1.0)
    }

    /// Cadence for the next keep-alive ping, bounded by configured
    /// min/max: a higher health score extends the interval.
    pub fn next_interval(&self) -> Duration {
        let score = self.score();
        let span = self.config.ping_max_interval.as_secs_f64() - self.config.ping_min_interval.as_secs_f64();
        let secs = self.config.ping_min_interval.as_secs_f64() + span * score;
        Duration::from_secs_f64(secs)
    }

    /// Updates the consecutive-degraded-sample counter and returns
    /// whether the connection should now be considered "stressed".
    pub fn note_sample(&mut self) -> bool {
        if self.score() < self.config.degraded_threshold {
            self.consecutive_degraded += 1;
        } else {
            self.consecutive_degraded = 0;
            self.stressed = false;
        }
        if self.consecutive_degraded >= self.config.degraded_consecutive_samples {
            self.stressed = true;
        }
        self.stressed
    }

    pub fn is_stressed(&self) -> bool {
        self.stressed
    }
}

/// Capability a transport must expose for the keep-alive sender to
/// probe connection health without owning the socket directly.
#[async_trait]
pub trait PingTransport: Send + Sync {
    async fn send_ping(&self) -> anyhow::Result<Duration>;
}

/// Drives periodic pings at `HealthTracker`'s adaptive cadence. Runs as
/// a supervised service per active connection.
pub struct KeepAliveService<T: PingTransport> {
    transport: T,
    tracker: tokio::sync::Mutex<HealthTracker>,
    name: String,
}

impl<T: PingTransport> KeepAliveService<T> {
    pub fn new(transport: T, config: ConnectionConfig, name: impl Into<String>) -> Self {
        Self {
            transport,
            tracker: tokio::sync::Mutex::new(HealthTracker::new(config)),
            name: name.into(),
        }
    }
}

#[async_trait]
impl<T: PingTransport + 'static> Service for KeepAliveService<T> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        loop {
            let interval = {
                let tracker = self.tracker.lock().await;
                tracker.next_interval()
            };

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(interval) => {}
            }

            let mut tracker = self.tracker.lock().await;
            match self.transport.send_ping().await {
                Ok(rtt) => tracker.record_ping_success(rtt),
                Err(e) => {
                    warn!(error = %e, "keep-alive ping failed");
                    tracker.record_ping_loss();
                }
            }
            if tracker.note_sample() {
                warn!("connection marked stressed, preferring shorter keep-alive cadence");
            } else {
                info!(score = tracker.score(), "connection healthy");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ConnectionConfig {
        ConnectionConfig {
            ping_min_interval: Duration::from_secs(20),
            ping_max_interval: Duration::from_secs(90),
            degraded_threshold: 0.4,
            degraded_consecutive_samples: 3,
        }
    }

    #[test]
    fn healthy_connection_scores_near_one() {
        let mut tracker = HealthTracker::new(config());
        for _ in 0..5 {
            tracker.record_ping_success(Duration::from_millis(10));
        }
        tracker.record_write_activity();
        assert!(tracker.score() > 0.9);
    }

    #[test]
    fn repeated_loss_eventually_marks_stressed() {
        let mut tracker = HealthTracker::new(config());
        let mut stressed = false;
        for _ in 0..10 {
            tracker.record_ping_loss();
            stressed = tracker.note_sample();
        }
        assert!(stressed);
    }

    #[test]
    fn interval_stays_within_bounds() {
        let cfg = config();
        let tracker = HealthTracker::new(cfg);
        let interval = tracker.next_interval();
        assert!(interval >= cfg.ping_min_interval);
        assert!(interval <= cfg.ping_max_interval);
    }
}
