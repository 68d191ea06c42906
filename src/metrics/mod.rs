//! Connection-quality metrics, certificate alerts and failure detection (L7).

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::cert::pinning::DeviceId;
use crate::service::Service;

const MAX_RECENT_DURATIONS: usize = 100;
const METRICS_IDLE_GC: chrono::Duration = chrono::Duration::days(30);
const ALERT_GC: chrono::Duration = chrono::Duration::days(30);

#[derive(Debug, Clone)]
pub enum MetricsEvent {
    Attempt,
    Success { duration: Duration },
    Failure { error: String },
    TlsFailure { error: String },
    CertError { error: String },
}

/// Per-peer counters.
#[derive(Debug, Clone, Default)]
pub struct DeviceMetrics {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub tls_failures: u64,
    pub cert_errors: u64,
    pub consecutive_failures: u32,
    pub last_error: Option<(String, DateTime<Utc>)>,
    pub recent_durations: VecDeque<Duration>,
    pub last_activity: Option<DateTime<Utc>>,
    // timestamps of recent failure/tls/cert events, for rate-over-window
    failure_events: VecDeque<DateTime<Utc>>,
    tls_events: VecDeque<DateTime<Utc>>,
    cert_events: VecDeque<DateTime<Utc>>,
    attempt_events: VecDeque<DateTime<Utc>>,
}

impl DeviceMetrics {
    fn record(&mut self, event: &MetricsEvent, now: DateTime<Utc>) {
        self.last_activity = Some(now);
        match event {
            MetricsEvent::Attempt => {
                self.attempts += 1;
                self.attempt_events.push_back(now);
            }
            MetricsEvent::Success { duration } => {
                self.successes += 1;
                self.consecutive_failures = 0;
                self.recent_durations.push_back(*duration);
                if self.recent_durations.len() > MAX_RECENT_DURATIONS {
                    self.recent_durations.pop_front();
                }
            }
            MetricsEvent::Failure { error } => {
                self.failures += 1;
                self.consecutive_failures += 1;
                self.last_error = Some((error.clone(), now));
                self.failure_events.push_back(now);
            }
            MetricsEvent::TlsFailure { error } => {
                self.tls_failures += 1;
                self.consecutive_failures += 1;
                self.last_error = Some((error.clone(), now));
                self.tls_events.push_back(now);
            }
            MetricsEvent::CertError { error } => {
                self.cert_errors += 1;
                self.last_error = Some((error.clone(), now));
                self.cert_events.push_back(now);
            }
        }
    }

    fn prune_window(&mut self, window: chrono::Duration, now: DateTime<Utc>) {
        let cutoff = now - window;
        for q in [
            &mut self.attempt_events,
            &mut self.failure_events,
            &mut self.tls_events,
            &mut self.cert_events,
        ] {
            while matches!(q.front(), Some(t) if *t < cutoff) {
                q.pop_front();
            }
        }
    }

    pub fn failure_rate(&self) -> f64 {
        rate(self.failure_events.len(), self.attempt_events.len())
    }

    pub fn tls_error_rate(&self) -> f64 {
        rate(self.tls_events.len(), self.attempt_events.len())
    }

    pub fn cert_error_rate(&self) -> f64 {
        rate(self.cert_events.len(), self.attempt_events.len())
    }

    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            return 0.0;
        }
        self.successes as f64 / self.attempts as f64
    }
}

fn rate(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FailureThresholds {
    pub max_consecutive_failures: u32,
    pub max_failure_rate: f64,
    pub max_tls_error_rate: f64,
    pub max_cert_error_rate: f64,
    pub time_window: Duration,
}

impl Default for FailureThresholds {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 5,
            max_failure_rate: 0.5,
            max_tls_error_rate: 0.3,
            max_cert_error_rate: 0.2,
            time_window: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FailureReport {
    pub device: DeviceId,
    pub kind: &'static str,
    pub details: String,
}

/// Per-peer metrics recorder. Readers/writer discipline via `DashMap`'s
/// internal sharding plus per-entry exclusivity for updates.
pub struct MetricsStore {
    peers: DashMap<DeviceId, DeviceMetrics>,
    thresholds: RwLock<HashMap<DeviceId, FailureThresholds>>,
    default_thresholds: FailureThresholds,
}

impl MetricsStore {
    pub fn new(default_thresholds: FailureThresholds) -> Self {
        Self {
            peers: DashMap::new(),
            thresholds: RwLock::new(HashMap::new()),
            default_thresholds,
        }
    }

    pub async fn set_thresholds(&self, device: DeviceId, thresholds: FailureThresholds) {
        self.thresholds.write().await.insert(device, thresholds);
    }

    pub fn record(&self, device: DeviceId, event: MetricsEvent) {
        let now = Utc::now();
        let mut entry = self.peers.entry(device).or_default();
        entry.record(&event, now);
    }

    pub fn get(&self, device: &DeviceId) -> Option<DeviceMetrics> {
        self.peers.get(device).map(|e| e.clone())
    }

    /// Drops peers with no activity in 30 days.
    pub fn cleanup_idle(&self) -> usize {
        let now = Utc::now();
        let before = self.peers.len();
        self.peers.retain(|_, metrics| {
            metrics
                .last_activity
                .map(|t| now - t <= METRICS_IDLE_GC)
                .unwrap_or(true)
        });
        before - self.peers.len()
    }

    /// Evaluates every tracked peer against its thresholds, returning a
    /// `FailureReport` for each that crosses one.
    pub async fn evaluate_failures(&self) -> Vec<FailureReport> {
        let now = Utc::now();
        let thresholds_overrides = self.thresholds.read().await;
        let mut reports = Vec::new();

        for mut entry in self.peers.iter_mut() {
            let device = *entry.key();
            let thresholds = thresholds_overrides
                .get(&device)
                .copied()
                .unwrap_or(self.default_thresholds);
            let window = chrono::Duration::from_std(thresholds.time_window)
                .unwrap_or_else(|_| chrono::Duration::hours(1));
            entry.value_mut().prune_window(window, now);
            let metrics = entry.value();

            if metrics.consecutive_failures >= thresholds.max_consecutive_failures {
                reports.push(FailureReport {
                    device,
                    kind: "consecutive_failures",
                    details: format!("{} consecutive failures", metrics.consecutive_failures),
                });
                continue;
            }
            if metrics.failure_rate() > thresholds.max_failure_rate {
                reports.push(FailureReport {
                    device,
                    kind: "failure_rate",
                    details: format!("failure rate {:.2}", metrics.failure_rate()),
                });
            } else if metrics.tls_error_rate() > thresholds.max_tls_error_rate {
                reports.push(FailureReport {
                    device,
                    kind: "tls_error_rate",
                    details: format!("tls error rate {:.2}", metrics.tls_error_rate()),
                });
            } else if metrics.cert_error_rate() > thresholds.max_cert_error_rate {
                reports.push(FailureReport {
                    device,
                    kind: "cert_error_rate",
                    details: format!("cert error rate {:.2}", metrics.cert_error_rate()),
                });
            }
        }
        reports
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    ExpiringSoon,
    ExpiringVerySoon,
    Expired,
    Missing,
    Invalid,
}

impl AlertKind {
    fn reminder_cadence(self) -> chrono::Duration {
        match self {
            AlertKind::ExpiringVerySoon => chrono::Duration::hours(6),
            AlertKind::ExpiringSoon => chrono::Duration::hours(24),
            AlertKind::Expired => chrono::Duration::hours(12),
            AlertKind::Missing | AlertKind::Invalid => chrono::Duration::hours(24),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CertificateAlert {
    pub certificate_file: PathBuf,
    pub device_id: Option<DeviceId>,
    pub subject: String,
    pub not_after: Option<DateTime<Utc>>,
    pub kind: AlertKind,
    pub created_at: DateTime<Utc>,
    pub last_notified: DateTime<Utc>,
}

/// At most one alert per certificate-file; alerts auto-clear when the
/// certificate is again valid.
#[derive(Default)]
pub struct AlertStore {
    alerts: RwLock<HashMap<PathBuf, CertificateAlert>>,
}

impl AlertStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn raise(
        &self,
        certificate_file: PathBuf,
        device_id: Option<DeviceId>,
        subject: String,
        not_after: Option<DateTime<Utc>>,
        kind: AlertKind,
    ) -> bool {
        let now = Utc::now();
        let mut alerts = self.alerts.write().await;
        match alerts.get_mut(&certificate_file) {
            Some(existing) if existing.kind == kind => {
                if now - existing.last_notified >= kind.reminder_cadence() {
                    existing.last_notified = now;
                    true
                } else {
                    false
                }
            }
            _ => {
                alerts.insert(
                    certificate_file.clone(),
                    CertificateAlert {
                        certificate_file,
                        device_id,
                        subject,
                        not_after,
                        kind,
                        created_at: now,
                        last_notified: now,
                    },
                );
                true
            }
        }
    }

    pub async fn clear(&self, certificate_file: &PathBuf) {
        self.alerts.write().await.remove(certificate_file);
    }

    pub async fn active(&self) -> Vec<CertificateAlert> {
        self.alerts.read().await.values().cloned().collect()
    }

    /// Garbage-collects alerts older than 30 days.
    pub async fn gc(&self) -> usize {
        let now = Utc::now();
        let mut alerts = self.alerts.write().await;
        let before = alerts.len();
        alerts.retain(|_, alert| now - alert.created_at <= ALERT_GC);
        before - alerts.len()
    }
}

/// Periodic failure detector (default every 5 min, immediate on
/// startup). Auto-remediation is strictly advisory: registered callbacks
/// are invoked, nothing is mutated directly.
pub struct FailureDetector {
    metrics: Arc<MetricsStore>,
    events: broadcast::Sender<FailureReport>,
    interval: Duration,
}

impl FailureDetector {
    pub fn new(metrics: Arc<MetricsStore>, interval: Duration) -> Self {
        let (tx, _rx) = broadcast::channel(64);
        Self {
            metrics,
            events: tx,
            interval,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FailureReport> {
        self.events.subscribe()
    }
}

#[async_trait]
impl Service for FailureDetector {
    fn name(&self) -> &str {
        "failure-detector"
    }

    #[instrument(skip(self, cancel))]
    async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        loop {
            let reports = self.metrics.evaluate_failures().await;
            for report in reports {
                warn!(device = ?report.device, kind = report.kind, "peer failure detected");
                let _ = self.events.send(report);
            }
            let removed = self.metrics.cleanup_idle();
            if removed > 0 {
                info!(removed, "pruned idle peer metrics");
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consecutive_failures_trigger_report() {
        let store = MetricsStore::new(FailureThresholds {
            max_consecutive_failures: 2,
            ..Default::default()
        });
        let device = [1u8; 32];
        store.record(device, MetricsEvent::Attempt);
        store.record(device, MetricsEvent::Failure { error: "a".into() });
        store.record(device, MetricsEvent::Attempt);
        store.record(device, MetricsEvent::Failure { error: "b".into() });
        let metrics = store.get(&device).unwrap();
        assert_eq!(metrics.consecutive_failures, 2);
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let store = MetricsStore::new(FailureThresholds::default());
        let device = [2u8; 32];
        store.record(device, MetricsEvent::Failure { error: "a".into() });
        store.record(device, MetricsEvent::Success {
            duration: Duration::from_millis(10),
        });
        let metrics = store.get(&device).unwrap();
        assert_eq!(metrics.consecutive_failures, 0);
        assert_eq!(metrics.recent_durations.len(), 1);
    }

    #[tokio::test]
    async fn alert_raised_once_then_debounced_by_cadence() {
        let store = AlertStore::new();
        let path = PathBuf::from("cert.pem");
        let first = store
            .raise(path.clone(), None, "dev".into(), None, AlertKind::Missing)
            .await;
        let second = store
            .raise(path.clone(), None, "dev".into(), None, AlertKind::Missing)
            .await;
        assert!(first);
        assert!(!second);
        assert_eq!(store.active().await.len(), 1);
    }

    #[tokio::test]
    async fn clearing_alert_removes_it() {
        let store = AlertStore::new();
        let path = PathBuf::from("cert.pem");
        store
            .raise(path.clone(), None, "dev".into(), None, AlertKind::Expired)
            .await;
        store.clear(&path).await;
        assert!(store.active().await.is_empty());
    }
}
