//! Filesystem watcher & adaptive overflow tracker (L3).

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::WatcherConfig;
use crate::service::Service;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Remove,
    NonRemove,
}

#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub rel_path: PathBuf,
    pub kind: ChangeKind,
}

/// Adaptive buffer-sizing record.
pub struct OverflowTracker {
    pub current: usize,
    pub min: usize,
    pub max: usize,
    recent_overflows: VecDeque<Instant>,
    consecutive_overflows: u32,
    last_event: Option<Instant>,
}

impl OverflowTracker {
    pub fn new(initial: usize, min: usize, max: usize) -> Self {
        Self {
            current: initial.clamp(min, max),
            min,
            max,
            recent_overflows: VecDeque::new(),
            consecutive_overflows: 0,
            last_event: None,
        }
    }

    pub fn note_event(&mut self) {
        self.last_event = Some(Instant::now());
    }

    /// Records an overflow, possibly resizing `current`. Returns the new
    /// buffer size. Invariant: `current` always stays within `[min, max]`.
    pub fn record_overflow(&mut self) -> usize {
        let now = Instant::now();

        let interval_since_last = self.recent_overflows.back().map(|t| now.duration_since(*t));
        self.recent_overflows.push_back(now);
        if self.recent_overflows.len() > 100 {
            self.recent_overflows.pop_front();
        }

        self.consecutive_overflows += 1;

        let should_increase = self.consecutive_overflows >= 3
            && interval_since_last.map(|d| d < Duration::from_secs(30)).unwrap_or(false)
            && self.current < self.max;

        let should_decrease = self.time_since_last_overflow() >= Duration::from_secs(5 * 60)
            && self.time_since_last_event() >= Duration::from_secs(10 * 60)
            && self.current > 2 * self.min;

        if should_increase {
            let factor = self.resize_factor();
            self.current = ((self.current as f64) * factor).round() as usize;
            self.current = self.current.clamp(self.min, self.max);
        } else if should_decrease {
            self.current = (self.current / 2).clamp(self.min, self.max);
        }

        self.current
    }

    fn time_since_last_overflow(&self) -> Duration {
        self.recent_overflows
            .iter()
            .rev()
            .nth(1)
            .map(|t| Instant::now().duration_since(*t))
            .unwrap_or(Duration::MAX)
    }

    fn time_since_last_event(&self) -> Duration {
        self.last_event
            .map(|t| Instant::now().duration_since(t))
            .unwrap_or(Duration::MAX)
    }

    fn rate_per_min(&self) -> f64 {
        if self.recent_overflows.len() < 2 {
            return 0.0;
        }
        let span = self
            .recent_overflows
            .back()
            .unwrap()
            .duration_since(*self.recent_overflows.front().unwrap())
            .as_secs_f64()
            .max(1.0);
        self.recent_overflows.len() as f64 / (span / 60.0)
    }

    /// Pressure-dependent resize factor.
    fn resize_factor(&self) -> f64 {
        let buffer_range = (self.max - self.min).max(1) as f64;
        let pressure = 0.4 * (self.rate_per_min() / 10.0)
            + 0.3 * ((self.current - self.min) as f64 / buffer_range)
            + 0.3 * (self.consecutive_overflows as f64 / 20.0);
        let pressure = pressure.clamp(0.0, 1.0);

        if pressure > 0.8 {
            2.0
        } else if pressure > 0.6 {
            1.5
        } else if pressure > 0.4 {
            1.2
        } else {
            1.1
        }
    }

    /// Logarithmic reconciliation against observed file count, clamped to
    /// `[min, max]` (default every 10 minutes).
    pub fn reconcile_with_file_count(&mut self, file_count: u64) {
        let suggested = ((file_count.max(1) as f64).ln() * 200.0).round() as i64;
        self.current = (suggested.max(self.min as i64) as usize).clamp(self.min, self.max);
    }
}

/// Drops events with invalid UTF-8 paths, paths whose parent is ignored,
/// or paths outside the configured roots.
pub struct WatchFilter {
    roots: Vec<PathBuf>,
    ignored_dirs: Vec<PathBuf>,
}

impl WatchFilter {
    pub fn new(roots: Vec<PathBuf>, ignored_dirs: Vec<PathBuf>) -> Self {
        Self { roots, ignored_dirs }
    }

    pub fn accept(&self, path: &Path) -> bool {
        if path.to_str().is_none() {
            return false;
        }
        if let Some(parent) = path.parent() {
            if self.ignored_dirs.iter().any(|d| parent.starts_with(d)) {
                return false;
            }
        }
        self.roots.iter().any(|root| path.starts_with(root))
    }
}

/// Owns the OS watcher, the adaptive buffer and the bounded event channel
/// consumers receive from.
pub struct FsWatcher {
    filter: WatchFilter,
    tracker: RwLock<OverflowTracker>,
    sender: mpsc::Sender<WatchEvent>,
    receiver: Mutex<mpsc::Receiver<WatchEvent>>,
    root: PathBuf,
}

impl FsWatcher {
    pub fn new(root: PathBuf, filter: WatchFilter, config: &WatcherConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.initial_buffer);
        Self {
            filter,
            tracker: RwLock::new(OverflowTracker::new(
                config.initial_buffer,
                config.min_buffer,
                config.max_buffer,
            )),
            sender: tx,
            receiver: Mutex::new(rx),
            root,
        }
    }

    /// Consumer-facing pull of the next filtered event.
    pub async fn recv(&self) -> Option<WatchEvent> {
        self.receiver.lock().await.recv().await
    }

    /// Attempts to forward a raw OS event; on backpressure, drains the
    /// channel, records an overflow, and emits a synthetic full rescan.
    async fn dispatch(&self, path: PathBuf, kind: ChangeKind) {
        if !self.filter.accept(&path) {
            return;
        }
        let rel_path = path
            .strip_prefix(&self.root)
            .map(Path::to_path_buf)
            .unwrap_or(path);
        let event = WatchEvent { rel_path, kind };

        match self.sender.try_send(event) {
            Ok(()) => {
                self.tracker.write().await.note_event();
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.handle_overflow().await;
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("watch event channel closed, dropping event");
            }
        }
    }

    async fn handle_overflow(&self) {
        let new_size = self.tracker.write().await.record_overflow();
        warn!(new_size, "watcher channel overflow, emitting full rescan");

        {
            let mut receiver = self.receiver.lock().await;
            while receiver.try_recv().is_ok() {}
        }

        let rescan = WatchEvent {
            rel_path: self.root.clone(),
            kind: ChangeKind::NonRemove,
        };
        let _ = self.sender.try_send(rescan);
    }

    /// Reconciles buffer sizing against the folder's current file count.
    pub async fn reconcile(&self, file_count: u64) {
        self.tracker.write().await.reconcile_with_file_count(file_count);
    }
}

/// Runs the OS watcher and periodic reconciliation as a supervised
/// service. `notify`'s own thread bridges into the async world via a
/// std channel pumped on a blocking task.
pub struct FsWatcherService {
    watcher: Arc<FsWatcher>,
    reconcile_interval: Duration,
}

impl FsWatcherService {
    pub fn new(watcher: Arc<FsWatcher>, config: &WatcherConfig) -> Self {
        Self {
            watcher,
            reconcile_interval: config.reconcile_interval,
        }
    }
}

#[async_trait]
impl Service for FsWatcherService {
    fn name(&self) -> &str {
        "fs-watcher"
    }

    async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        let (raw_tx, mut raw_rx) = mpsc::channel(1024);
        let root = self.watcher.root.clone();

        let mut os_watcher: RecommendedWatcher = notify::recommended_watcher(move |res| {
            if let Ok(event) = res {
                let _ = raw_tx.blocking_send(event);
            }
        })?;
        os_watcher.watch(&root, RecursiveMode::Recursive)?;

        info!(root = %root.display(), "watching folder");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("fs watcher cancelled");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.reconcile_interval) => {
                    // File-count-based reconciliation is driven by the
                    // caller through `FsWatcher::reconcile`; this tick
                    // only keeps the service alive on the configured
                    // cadence.
                }
                event = raw_rx.recv() => {
                    match event {
                        Some(event) => {
                            let kind = if matches!(event.kind, notify::EventKind::Remove(_)) {
                                ChangeKind::Remove
                            } else {
                                ChangeKind::NonRemove
                            };
                            for path in event.paths {
                                self.watcher.dispatch(path, kind).await;
                            }
                        }
                        None => return Ok(()),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_keeps_buffer_within_bounds() {
        let mut tracker = OverflowTracker::new(1000, 500, 10_000);
        for _ in 0..5 {
            tracker.record_overflow();
        }
        assert!(tracker.current >= tracker.min);
        assert!(tracker.current <= tracker.max);
    }

    #[test]
    fn reconcile_clamps_to_bounds() {
        let mut tracker = OverflowTracker::new(1000, 500, 10_000);
        tracker.reconcile_with_file_count(1);
        assert!(tracker.current >= tracker.min);
        tracker.reconcile_with_file_count(10_000_000);
        assert!(tracker.current <= tracker.max);
    }

    #[test]
    fn filter_rejects_paths_outside_roots() {
        let filter = WatchFilter::new(vec![PathBuf::from("/sync/folder")], vec![]);
        assert!(filter.accept(Path::new("/sync/folder/a.txt")));
        assert!(!filter.accept(Path::new("/other/a.txt")));
    }

    #[test]
    fn filter_rejects_ignored_parent() {
        let filter = WatchFilter::new(
            vec![PathBuf::from("/sync")],
            vec![PathBuf::from("/sync/.stfolder")],
        );
        assert!(!filter.accept(Path::new("/sync/.stfolder/marker")));
    }
}
