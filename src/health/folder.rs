//! Folder health monitor (L15): adaptive-cadence per-folder path and
//! resource checks with degradation classification.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{FolderConfig, HealthConfig};
use crate::error::CoreError;
use crate::service::Service;

const RESOURCE_EWMA_ALPHA: f64 = 0.3;
const IMPLAUSIBLE_MEMORY_BYTES: u64 = 100 * 1024 * 1024 * 1024;

/// Folder lifecycle state, fed in from outside this core (the folder
/// runner knows whether a folder is actively syncing, quiescent, or
/// paused); governs which of the three check cadences applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FolderState {
    Active,
    Idle,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DegradationKind {
    SlowChecks,
    HighFailureRate,
    CpuSustained,
    MemorySustained,
}

#[derive(Debug, Clone)]
pub enum FolderHealthEvent {
    HealthChanged { folder_id: String, healthy: bool },
    Failure { folder_id: String, kind: DegradationKind },
    MemoryOptimizeHint { folder_id: String },
}

#[derive(Debug, Clone)]
pub struct FolderHealthStatus {
    pub healthy: bool,
    pub check_time: DateTime<Utc>,
    pub check_duration: Duration,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct FolderPerformanceStats {
    pub last_check: Option<DateTime<Utc>>,
    pub check_count: u64,
    pub failed_check_count: u64,
    pub avg_check_duration: Duration,
    pub rolling_cpu_pct: f64,
    pub rolling_mem_bytes: u64,
    pub last_error: Option<String>,
}

/// Out-of-band CPU%/memory sample for the folder's worker, refreshed by
/// the host process — resource metrics are an external collaborator of
/// this core, same posture as the peer selector's CPU hint.
#[async_trait]
pub trait ResourceSampler: Send + Sync {
    async fn sample(&self) -> (f64, u64);
}

/// Always reports zero; used when no sampler is wired up.
pub struct NoopResourceSampler;

#[async_trait]
impl ResourceSampler for NoopResourceSampler {
    async fn sample(&self) -> (f64, u64) {
        (0.0, 0)
    }
}

/// Verifies the folder path exists, is a directory, and contains the
/// marker file, attempting to (re)create a missing marker once.
async fn check_path(folder: &FolderConfig) -> Result<(), CoreError> {
    let meta = tokio::fs::metadata(&folder.path)
        .await
        .map_err(|_| CoreError::PathMissing(folder.path.clone()))?;
    if !meta.is_dir() {
        return Err(CoreError::NotADirectory(folder.path.clone()));
    }

    let marker = folder.path.join(&folder.marker_name);
    if tokio::fs::metadata(&marker).await.is_ok() {
        return Ok(());
    }

    let _ = tokio::fs::File::create(&marker).await;
    tokio::fs::metadata(&marker)
        .await
        .map(|_| ())
        .map_err(|_| CoreError::MarkerMissing(marker))
}

pub struct FolderHealthMonitor {
    folder: FolderConfig,
    config: HealthConfig,
    sampler: Box<dyn ResourceSampler>,
    state: watch::Receiver<FolderState>,
    stats: RwLock<FolderPerformanceStats>,
    last_healthy: RwLock<Option<bool>>,
    events: broadcast::Sender<FolderHealthEvent>,
}

impl FolderHealthMonitor {
    pub fn new(
        folder: FolderConfig,
        config: HealthConfig,
        sampler: Box<dyn ResourceSampler>,
        state: watch::Receiver<FolderState>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            folder,
            config,
            sampler,
            state,
            stats: RwLock::new(FolderPerformanceStats::default()),
            last_healthy: RwLock::new(None),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FolderHealthEvent> {
        self.events.subscribe()
    }

    pub async fn stats(&self) -> FolderPerformanceStats {
        self.stats.read().await.clone()
    }

    fn interval_for(&self, state: FolderState) -> Duration {
        if let Some(overridden) = self.folder.health_check_interval {
            return overridden;
        }
        match state {
            FolderState::Active => self.config.active_interval,
            FolderState::Idle => self.config.idle_interval,
            FolderState::Paused => self.config.paused_interval,
        }
    }

    /// Runs a single check tick: path/marker verification, resource
    /// sampling, stats update, degradation classification, and event
    /// emission.
    pub async fn tick(&self) -> FolderHealthStatus {
        let started = Instant::now();
        let check_result = check_path(&self.folder).await;
        let check_duration = started.elapsed();
        let healthy = check_result.is_ok();

        let (cpu_pct, mem_bytes) = self.sampler.sample().await;
        let mut issues = Vec::new();
        if let Err(ref e) = check_result {
            issues.push(e.to_string());
        }

        let degradations = {
            let mut stats = self.stats.write().await;
            stats.check_count += 1;
            stats.last_check = Some(Utc::now());
            if !healthy {
                stats.failed_check_count += 1;
                stats.last_error = check_result.as_ref().err().map(|e| e.to_string());
            }

            stats.avg_check_duration = if stats.check_count == 1 {
                check_duration
            } else {
                Duration::from_secs_f64(
                    RESOURCE_EWMA_ALPHA * check_duration.as_secs_f64()
                        + (1.0 - RESOURCE_EWMA_ALPHA) * stats.avg_check_duration.as_secs_f64(),
                )
            };

            stats.rolling_cpu_pct =
                RESOURCE_EWMA_ALPHA * cpu_pct + (1.0 - RESOURCE_EWMA_ALPHA) * stats.rolling_cpu_pct;

            let previous_mem = stats.rolling_mem_bytes;
            let mem_delta = if mem_bytes < IMPLAUSIBLE_MEMORY_BYTES {
                stats.rolling_mem_bytes = (RESOURCE_EWMA_ALPHA * mem_bytes as f64
                    + (1.0 - RESOURCE_EWMA_ALPHA) * previous_mem as f64) as u64;
                stats.rolling_mem_bytes.abs_diff(previous_mem)
            } else {
                0
            };

            self.classify_degradation(&stats, mem_delta)
        };

        for kind in &degradations {
            let _ = self.events.send(FolderHealthEvent::Failure {
                folder_id: self.folder.id.clone(),
                kind: *kind,
            });
            issues.push(format!("{kind:?}"));
        }

        let mut last_healthy = self.last_healthy.write().await;
        if *last_healthy != Some(healthy) {
            *last_healthy = Some(healthy);
            let _ = self.events.send(FolderHealthEvent::HealthChanged {
                folder_id: self.folder.id.clone(),
                healthy,
            });
        }

        FolderHealthStatus {
            healthy,
            check_time: Utc::now(),
            check_duration,
            issues,
        }
    }

    fn classify_degradation(&self, stats: &FolderPerformanceStats, mem_delta: u64) -> Vec<DegradationKind> {
        let mut found = Vec::new();

        if stats.avg_check_duration > self.config.degraded_avg_duration {
            found.push(DegradationKind::SlowChecks);
        }

        if stats.check_count >= self.config.min_checks_for_failure_rate as u64 {
            let failure_rate = stats.failed_check_count as f64 / stats.check_count as f64;
            if failure_rate > self.config.degraded_failure_rate {
                found.push(DegradationKind::HighFailureRate);
            }
        }

        if let Some(cap) = self.folder.max_cpu_pct {
            if stats.rolling_cpu_pct > cap {
                found.push(DegradationKind::CpuSustained);
            }
        }

        if let Some(cap_mb) = self.folder.max_memory_mb {
            if stats.rolling_mem_bytes > cap_mb * 1024 * 1024 {
                found.push(DegradationKind::MemorySustained);
            }
        }

        if mem_delta > self.config.memory_optimize_threshold_bytes {
            let _ = self.events.send(FolderHealthEvent::MemoryOptimizeHint {
                folder_id: self.folder.id.clone(),
            });
        }

        found
    }
}

#[async_trait]
impl Service for FolderHealthMonitor {
    fn name(&self) -> &str {
        "folder-health-monitor"
    }

    async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        let mut state_rx = self.state.clone();
        loop {
            let interval = self.interval_for(*state_rx.borrow());
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(interval) => {
                    let status = self.tick().await;
                    if status.healthy {
                        info!(folder = %self.folder.id, duration = ?status.check_duration, "folder health check ok");
                    } else {
                        warn!(folder = %self.folder.id, issues = ?status.issues, "folder health check failed");
                    }
                }
                _ = state_rx.changed() => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn folder(path: PathBuf) -> FolderConfig {
        let mut cfg = FolderConfig::new("f1", path);
        cfg.marker_name = ".marker".to_string();
        cfg
    }

    fn monitor(folder: FolderConfig) -> FolderHealthMonitor {
        let (_tx, rx) = watch::channel(FolderState::Active);
        FolderHealthMonitor::new(folder, HealthConfig::default(), Box::new(NoopResourceSampler), rx)
    }

    #[tokio::test]
    async fn creates_missing_marker_and_reports_healthy() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = monitor(folder(dir.path().to_path_buf()));
        let status = monitor.tick().await;
        assert!(status.healthy);
        assert!(dir.path().join(".marker").exists());
    }

    #[tokio::test]
    async fn missing_path_reports_unhealthy() {
        let monitor = monitor(folder(PathBuf::from("/nonexistent/path/for/peersync-tests")));
        let status = monitor.tick().await;
        assert!(!status.healthy);
    }

    #[tokio::test]
    async fn health_changed_event_fires_on_transition() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = monitor(folder(dir.path().to_path_buf()));
        let mut events = monitor.subscribe();

        monitor.tick().await;
        let first = events.recv().await.unwrap();
        assert!(matches!(first, FolderHealthEvent::HealthChanged { healthy: true, .. }));

        monitor.tick().await;
        assert!(events.try_recv().is_err(), "no second HealthChanged since state did not flip");
    }

    #[tokio::test]
    async fn sustained_high_failure_rate_is_classified() {
        let monitor = monitor(folder(PathBuf::from("/nonexistent/path/for/peersync-tests")));
        let mut events = monitor.subscribe();

        for _ in 0..5 {
            monitor.tick().await;
        }

        let mut saw_failure_rate = false;
        while let Ok(event) = events.try_recv() {
            if let FolderHealthEvent::Failure { kind: DegradationKind::HighFailureRate, .. } = event {
                saw_failure_rate = true;
            }
        }
        assert!(saw_failure_rate);
    }
}
