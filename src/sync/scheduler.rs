//! Folder scheduler & priority iterator (L12): reduces per-folder lazy
//! file sequences to one logical stream ordered by folder priority,
//! with a configurable tie-breaker for equal-priority folders.

use std::cmp::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Semaphore};

use crate::config::{SchedulerConfig, SchedulingStrategy, TieBreaker};
use crate::error::CoreResult;

/// A file the scheduler may need to pull, as reported by an external
/// per-folder index (out of scope for this core).
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub folder_id: String,
    pub path: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// A folder's opaque lazy sequence of files needing sync, paired with
/// its numeric priority.
#[async_trait]
pub trait FolderFileSource: Send {
    fn folder_id(&self) -> &str;
    async fn next(&mut self) -> Option<CoreResult<FileInfo>>;
}

fn file_order(a: &FileInfo, b: &FileInfo, tie_breaker: TieBreaker) -> Ordering {
    match tie_breaker {
        TieBreaker::OldestFirst => a.modified.cmp(&b.modified),
        TieBreaker::NewestFirst => b.modified.cmp(&a.modified),
        TieBreaker::SmallestFirst => a.size.cmp(&b.size),
        TieBreaker::LargestFirst => b.size.cmp(&a.size),
        TieBreaker::Alphabetic => a.path.cmp(&b.path),
    }
}

/// Orders two buffered heads; an error always sorts first so failures
/// surface without waiting on a tie-break comparison.
fn head_order(
    a: &Option<CoreResult<FileInfo>>,
    b: &Option<CoreResult<FileInfo>>,
    tie_breaker: TieBreaker,
) -> Ordering {
    match (a, b) {
        (Some(Err(_)), Some(Err(_))) => Ordering::Equal,
        (Some(Err(_)), _) => Ordering::Less,
        (_, Some(Err(_))) => Ordering::Greater,
        (Some(Ok(fa)), Some(Ok(fb))) => file_order(fa, fb, tie_breaker),
        _ => Ordering::Equal,
    }
}

fn permits_for(max_folder_concurrency: i64) -> Option<Arc<Semaphore>> {
    if max_folder_concurrency < 0 {
        None
    } else if max_folder_concurrency == 0 {
        let n = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Some(Arc::new(Semaphore::new(n)))
    } else {
        Some(Arc::new(Semaphore::new(max_folder_concurrency as usize)))
    }
}

/// K-way merges a single priority group's sources by tie-breaker,
/// forwarding each item to `tx` in order, gated by the concurrency
/// semaphore representing "folder is in I/O-intensive work".
async fn drain_group(
    mut sources: Vec<Box<dyn FolderFileSource>>,
    tie_breaker: TieBreaker,
    semaphore: Option<Arc<Semaphore>>,
    tx: mpsc::Sender<CoreResult<FileInfo>>,
) {
    let mut heads: Vec<Option<CoreResult<FileInfo>>> = Vec::with_capacity(sources.len());
    for source in sources.iter_mut() {
        heads.push(source.next().await);
    }

    loop {
        let mut best: Option<usize> = None;
        for i in 0..heads.len() {
            if heads[i].is_none() {
                continue;
            }
            best = match best {
                None => Some(i),
                Some(bi) => {
                    if head_order(&heads[i], &heads[bi], tie_breaker) == Ordering::Less {
                        Some(i)
                    } else {
                        Some(bi)
                    }
                }
            };
        }

        let Some(idx) = best else { break };
        let item = heads[idx].take().expect("selected head is Some");

        let _permit = match &semaphore {
            Some(sem) => sem.clone().acquire_owned().await.ok(),
            None => None,
        };

        if tx.send(item).await.is_err() {
            break;
        }

        heads[idx] = sources[idx].next().await;
    }
}

/// Reduces folder file sources to a single ordered stream.
pub struct FolderScheduler {
    config: SchedulerConfig,
}

impl FolderScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }

    /// Runs the merge, returning the channel receiver end of the
    /// merged stream. `groups` need not be pre-sorted. Groups sharing a
    /// priority are merged into a single `drain_group` call so their
    /// files interleave by tie-breaker rather than draining one
    /// folder's group before the next.
    pub fn run(
        &self,
        groups: Vec<(i32, Vec<Box<dyn FolderFileSource>>)>,
    ) -> mpsc::Receiver<CoreResult<FileInfo>> {
        let mut by_priority: std::collections::HashMap<i32, Vec<Box<dyn FolderFileSource>>> =
            std::collections::HashMap::new();
        for (priority, sources) in groups {
            by_priority.entry(priority).or_default().extend(sources);
        }
        let mut merged: Vec<(i32, Vec<Box<dyn FolderFileSource>>)> = by_priority.into_iter().collect();
        merged.sort_by(|a, b| b.0.cmp(&a.0));

        let (tx, rx) = mpsc::channel(256);
        let tie_breaker = self.config.tie_breaker;
        let strategy = self.config.strategy;
        let permits = permits_for(self.config.max_folder_concurrency);

        tokio::spawn(async move {
            match strategy {
                SchedulingStrategy::Ranked => {
                    for (_, sources) in merged {
                        drain_group(sources, tie_breaker, permits.clone(), tx.clone()).await;
                    }
                }
                SchedulingStrategy::Parallel => {
                    let mut handles = Vec::with_capacity(merged.len());
                    for (_, sources) in merged {
                        let tx = tx.clone();
                        let permits = permits.clone();
                        handles.push(tokio::spawn(drain_group(sources, tie_breaker, permits, tx)));
                    }
                    for handle in handles {
                        let _ = handle.await;
                    }
                }
            }
        });

        rx
    }
}
