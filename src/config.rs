//! Unified configuration.
//!
//! One sub-config per component family, aggregated into `CoreConfig` and
//! assembled through `ConfigBuilder`. Parsing these from an on-disk config
//! file format is out of scope — callers construct already-parsed
//! values.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level aggregate configuration for the core.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CoreConfig {
    pub discovery: DiscoveryConfig,
    pub certificate: CertificateConfig,
    pub connection: ConnectionConfig,
    pub scheduler: SchedulerConfig,
    pub transfer: TransferConfig,
    pub watcher: WatcherConfig,
    pub health: HealthConfig,
}

/// Discovery configuration: finder priorities/timeouts, cache TTLs,
/// connection-cache behavior, beacon interval bounds, and the global
/// directory client's circuit-breaker/backoff/flip-flop tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    pub local_priority: i32,
    pub global_priority: i32,
    pub peer_priority: i32,
    pub local_timeout: Duration,
    pub global_timeout: Duration,
    pub peer_timeout: Duration,
    pub overall_budget: Duration,
    pub local_positive_ttl: Duration,
    pub local_negative_ttl: Duration,
    pub global_positive_ttl: Duration,
    pub global_negative_ttl: Duration,
    pub peer_positive_ttl: Duration,
    pub peer_negative_ttl: Duration,
    pub connection_cache_enabled: bool,
    pub connection_cache_ttl: Duration,
    pub peer_assisted_fanout: usize,
    pub beacon_min_interval: Duration,
    pub beacon_max_interval: Duration,
    pub beacon_default_interval: Duration,
    pub global_reannounce_default: Duration,
    pub global_circuit_threshold: u32,
    pub global_circuit_recovery: Duration,
    pub global_backoff_base: Duration,
    pub global_backoff_max: Duration,
    pub flip_flop_debounce: Duration,
    pub flip_flop_threshold: u32,
    pub flip_flop_backoff: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            local_priority: 3,
            global_priority: 2,
            peer_priority: 1,
            local_timeout: Duration::from_secs(5),
            global_timeout: Duration::from_secs(10),
            peer_timeout: Duration::from_secs(8),
            overall_budget: Duration::from_secs(15),
            local_positive_ttl: Duration::from_secs(600),
            local_negative_ttl: Duration::from_secs(60),
            global_positive_ttl: Duration::from_secs(1800),
            global_negative_ttl: Duration::from_secs(60),
            peer_positive_ttl: Duration::from_secs(300),
            peer_negative_ttl: Duration::from_secs(60),
            connection_cache_enabled: true,
            connection_cache_ttl: Duration::from_secs(3600),
            peer_assisted_fanout: 3,
            beacon_min_interval: Duration::from_secs(10),
            beacon_max_interval: Duration::from_secs(60),
            beacon_default_interval: Duration::from_secs(30),
            global_reannounce_default: Duration::from_secs(30 * 60),
            global_circuit_threshold: 5,
            global_circuit_recovery: Duration::from_secs(60),
            global_backoff_base: Duration::from_secs(1),
            global_backoff_max: Duration::from_secs(30),
            flip_flop_debounce: Duration::from_secs(2),
            flip_flop_threshold: 10,
            flip_flop_backoff: Duration::from_secs(5 * 60),
        }
    }
}

/// Certificate store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateConfig {
    pub common_name: String,
    pub lifetime_days: i64,
    pub renewal_window_days: i64,
    pub check_interval: Duration,
    pub backup_retention: Duration,
}

impl Default for CertificateConfig {
    fn default() -> Self {
        Self {
            common_name: "syncthing".to_string(),
            lifetime_days: 820,
            renewal_window_days: 30,
            check_interval: Duration::from_secs(6 * 3600),
            backup_retention: Duration::from_secs(30 * 24 * 3600),
        }
    }
}

/// Connection health engine configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub ping_min_interval: Duration,
    pub ping_max_interval: Duration,
    pub degraded_threshold: f64,
    pub degraded_consecutive_samples: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            ping_min_interval: Duration::from_secs(20),
            ping_max_interval: Duration::from_secs(90),
            degraded_threshold: 0.4,
            degraded_consecutive_samples: 3,
        }
    }
}

/// Folder scheduler configuration. `max_folder_concurrency`: 0 = number of
/// logical CPUs, negative = unlimited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub max_folder_concurrency: i64,
    pub tie_breaker: TieBreaker,
    pub strategy: SchedulingStrategy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_folder_concurrency: 0,
            tie_breaker: TieBreaker::OldestFirst,
            strategy: SchedulingStrategy::Parallel,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TieBreaker {
    OldestFirst,
    NewestFirst,
    SmallestFirst,
    LargestFirst,
    Alphabetic,
}

impl TieBreaker {
    /// Unknown values fall back to `OldestFirst`.
    pub fn parse_or_default(s: &str) -> Self {
        match s {
            "newestFirst" => TieBreaker::NewestFirst,
            "smallestFirst" => TieBreaker::SmallestFirst,
            "largestFirst" => TieBreaker::LargestFirst,
            "alphabetic" => TieBreaker::Alphabetic,
            "oldestFirst" => TieBreaker::OldestFirst,
            _ => TieBreaker::OldestFirst,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulingStrategy {
    Parallel,
    Ranked,
}

/// Resumable block transfer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    pub default_chunk_size: usize,
    pub min_chunk_size: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            default_chunk_size: 1024 * 1024,
            min_chunk_size: 64 * 1024,
        }
    }
}

/// Filesystem watcher/overflow-tracker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    pub min_buffer: usize,
    pub max_buffer: usize,
    pub initial_buffer: usize,
    pub reconcile_interval: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            min_buffer: 500,
            max_buffer: 10_000,
            initial_buffer: 1000,
            reconcile_interval: Duration::from_secs(600),
        }
    }
}

/// Folder health monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    pub active_interval: Duration,
    pub idle_interval: Duration,
    pub paused_interval: Duration,
    pub degraded_avg_duration: Duration,
    pub degraded_failure_rate: f64,
    pub min_checks_for_failure_rate: u32,
    pub memory_optimize_threshold_bytes: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            active_interval: Duration::from_secs(30),
            idle_interval: Duration::from_secs(5 * 60),
            paused_interval: Duration::from_secs(30 * 60),
            degraded_avg_duration: Duration::from_secs(5),
            degraded_failure_rate: 0.1,
            min_checks_for_failure_rate: 5,
            memory_optimize_threshold_bytes: 1024 * 1024 * 1024,
        }
    }
}

/// Per-folder configuration as consumed by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderConfig {
    pub id: String,
    pub path: std::path::PathBuf,
    pub marker_name: String,
    pub priority: i32,
    pub paused: bool,
    pub max_concurrency_override: Option<usize>,
    pub health_check_interval: Option<Duration>,
    pub max_cpu_pct: Option<f64>,
    pub max_memory_mb: Option<u64>,
    pub throttling_enabled: bool,
    pub resumable_transfers_enabled: bool,
    pub transfer_chunk_size: Option<usize>,
}

impl FolderConfig {
    pub fn new(id: impl Into<String>, path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            marker_name: ".stfolder".to_string(),
            priority: 0,
            paused: false,
            max_concurrency_override: None,
            health_check_interval: None,
            max_cpu_pct: None,
            max_memory_mb: None,
            throttling_enabled: false,
            resumable_transfers_enabled: true,
            transfer_chunk_size: None,
        }
    }
}

/// Configuration builder with validation.
#[derive(Default)]
pub struct ConfigBuilder {
    config: CoreConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: CoreConfig::default(),
        }
    }

    pub fn discovery(mut self, discovery: DiscoveryConfig) -> Self {
        self.config.discovery = discovery;
        self
    }

    pub fn certificate(mut self, certificate: CertificateConfig) -> Self {
        self.config.certificate = certificate;
        self
    }

    pub fn connection(mut self, connection: ConnectionConfig) -> Self {
        self.config.connection = connection;
        self
    }

    pub fn scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.config.scheduler = scheduler;
        self
    }

    pub fn transfer(mut self, transfer: TransferConfig) -> Self {
        self.config.transfer = transfer;
        self
    }

    pub fn watcher(mut self, watcher: WatcherConfig) -> Self {
        self.config.watcher = watcher;
        self
    }

    pub fn health(mut self, health: HealthConfig) -> Self {
        self.config.health = health;
        self
    }

    pub fn build(self) -> anyhow::Result<CoreConfig> {
        self.validate()?;
        Ok(self.config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.config.transfer.min_chunk_size > self.config.transfer.default_chunk_size {
            anyhow::bail!("transfer.min_chunk_size cannot exceed default_chunk_size");
        }
        if self.config.watcher.min_buffer > self.config.watcher.max_buffer {
            anyhow::bail!("watcher.min_buffer cannot exceed max_buffer");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_applies_overrides() {
        let cfg = ConfigBuilder::new()
            .transfer(TransferConfig {
                default_chunk_size: 2 * 1024 * 1024,
                min_chunk_size: 128 * 1024,
            })
            .build()
            .unwrap();
        assert_eq!(cfg.transfer.default_chunk_size, 2 * 1024 * 1024);
    }

    #[test]
    fn builder_rejects_inverted_chunk_bounds() {
        let result = ConfigBuilder::new()
            .transfer(TransferConfig {
                default_chunk_size: 1024,
                min_chunk_size: 2048,
            })
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn tie_breaker_falls_back_to_oldest_first() {
        assert_eq!(TieBreaker::parse_or_default("bogus"), TieBreaker::OldestFirst);
        assert_eq!(
            TieBreaker::parse_or_default("largestFirst"),
            TieBreaker::LargestFirst
        );
    }
}
