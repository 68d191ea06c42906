//! Supervised service runtime (L2).
//!
//! A `Service` is a long-running task with a uniform contract: it runs
//! until its cancellation token fires, releases all scoped resources
//! before returning, and retains no per-run scratch state across restarts.
//! `Supervisor` restarts failed services with a cooldown window.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// A long-running component, run to completion by a `Supervisor`.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Human-readable name used in logs and restart diagnostics.
    fn name(&self) -> &str;

    /// Runs until `cancel` is observed. Must poll `cancel` at every
    /// blocking point and release all scoped resources before returning.
    async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct SupervisorConfig {
    pub max_failures: u32,
    pub cooldown_window: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_failures: 2,
            cooldown_window: Duration::from_secs(60),
        }
    }
}

/// Runs one `Service`, restarting it on failure within `config`'s bounds.
/// Exceeding the failure threshold propagates the failure to the caller.
pub struct Supervisor {
    config: SupervisorConfig,
    recent_failures: Mutex<VecDeque<Instant>>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            recent_failures: Mutex::new(VecDeque::new()),
        }
    }

    /// Runs `service` under supervision until `cancel` fires or the
    /// restart budget is exhausted.
    #[instrument(skip(self, service, cancel), fields(service = service.name()))]
    pub async fn supervise(
        &self,
        service: Arc<dyn Service>,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        loop {
            if cancel.is_cancelled() {
                info!("supervisor observed cancellation before start");
                return Ok(());
            }

            let result = service.run(cancel.clone()).await;

            match result {
                Ok(()) => {
                    info!("service exited normally");
                    return Ok(());
                }
                Err(err) if cancel.is_cancelled() => {
                    warn!(error = %err, "service returned error during shutdown, treating as clean exit");
                    return Ok(());
                }
                Err(err) => {
                    error!(error = %err, "service failed");
                    if self.record_failure_and_check_threshold().await {
                        error!("restart threshold exceeded, propagating failure");
                        return Err(err);
                    }
                    warn!("restarting service after cooldown check");
                }
            }
        }
    }

    /// Records a failure and returns `true` if the restart threshold
    /// within the cooldown window has been exceeded.
    async fn record_failure_and_check_threshold(&self) -> bool {
        let now = Instant::now();
        let mut failures = self.recent_failures.lock().await;
        failures.push_back(now);
        while let Some(&front) = failures.front() {
            if now.saturating_duration_since(front) > self.config.cooldown_window {
                failures.pop_front();
            } else {
                break;
            }
        }
        failures.len() as u32 > self.config.max_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyService {
        attempts: AtomicU32,
        fail_until: u32,
    }

    #[async_trait]
    impl Service for FlakyService {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn run(&self, _cancel: CancellationToken) -> anyhow::Result<()> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_until {
                anyhow::bail!("synthetic failure {n}");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn restarts_until_success_within_budget() {
        let supervisor = Supervisor::new(SupervisorConfig {
            max_failures: 2,
            cooldown_window: Duration::from_secs(60),
        });
        let service = Arc::new(FlakyService {
            attempts: AtomicU32::new(0),
            fail_until: 2,
        });
        let cancel = CancellationToken::new();
        let result = supervisor.supervise(service.clone(), cancel).await;
        assert!(result.is_ok());
        assert_eq!(service.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn propagates_failure_past_threshold() {
        let supervisor = Supervisor::new(SupervisorConfig {
            max_failures: 1,
            cooldown_window: Duration::from_secs(60),
        });
        let service = Arc::new(FlakyService {
            attempts: AtomicU32::new(0),
            fail_until: 100,
        });
        let cancel = CancellationToken::new();
        let result = supervisor.supervise(service, cancel).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn cancellation_before_start_returns_ok() {
        let supervisor = Supervisor::new(SupervisorConfig::default());
        let service = Arc::new(FlakyService {
            attempts: AtomicU32::new(0),
            fail_until: 0,
        });
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = supervisor.supervise(service, cancel).await;
        assert!(result.is_ok());
    }
}
