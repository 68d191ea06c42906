//! Resumable block transfer (L14): chunked, checkpointed block pull
//! with a coalescing completed-ranges set.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::broadcast;

use crate::cert::pinning::DeviceId;
use crate::config::TransferConfig;
use crate::error::{CoreError, CoreResult};

const HASH_CHUNK: usize = 64 * 1024;

/// Coalescing set of non-overlapping half-open `[start, end)` byte
/// ranges within a block.
#[derive(Debug, Clone, Default)]
struct RangeSet {
    ranges: Vec<(u64, u64)>,
}

impl RangeSet {
    fn insert(&mut self, start: u64, end: u64) {
        if start >= end {
            return;
        }
        self.ranges.push((start, end));
        self.ranges.sort_by_key(|r| r.0);
        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(self.ranges.len());
        for (s, e) in self.ranges.drain(..) {
            if let Some(last) = merged.last_mut() {
                if s <= last.1 {
                    last.1 = last.1.max(e);
                    continue;
                }
            }
            merged.push((s, e));
        }
        self.ranges = merged;
    }

    fn covers(&self, start: u64, end: u64) -> bool {
        self.ranges.iter().any(|&(s, e)| s <= start && end <= e)
    }

    /// Smallest offset in `[start, limit)` not yet covered, if any.
    fn next_uncovered(&self, start: u64, limit: u64) -> Option<u64> {
        let mut pos = start;
        for &(s, e) in &self.ranges {
            if pos < s {
                break;
            }
            if pos < e {
                pos = e;
            }
        }
        if pos < limit {
            Some(pos)
        } else {
            None
        }
    }

    fn total_covered(&self) -> u64 {
        self.ranges.iter().map(|(s, e)| e - s).sum()
    }
}

/// Fetches a byte range `[offset, offset+size)` for a block from a
/// specific peer. A transport-level implementation lives outside this
/// core — peer connections are external collaborators of the transfer
/// state machine.
#[async_trait]
pub trait ChunkSource: Send + Sync {
    async fn fetch(&self, peer: DeviceId, offset: u64, size: u64) -> CoreResult<Vec<u8>>;
}

#[derive(Debug, Clone)]
pub enum BlockTransferEvent {
    ChunkWritten { offset: u64, size: u64 },
    Completed { file: PathBuf },
    VerificationFailed { file: PathBuf },
    PeerBanned { peer: DeviceId },
}

/// State machine for one outstanding block pull. Survives connection
/// drops; reconnect to any peer possessing the block resumes from the
/// next uncovered offset.
pub struct BlockTransfer {
    file: PathBuf,
    temp_path: PathBuf,
    block_offset: u64,
    block_size: u64,
    chunk_size: u64,
    expected_hash: [u8; 32],
    completed: RangeSet,
    banned_peers: HashSet<DeviceId>,
    finalized: bool,
    events: broadcast::Sender<BlockTransferEvent>,
}

impl BlockTransfer {
    pub fn new(
        file: PathBuf,
        block_offset: u64,
        block_size: u64,
        config: &TransferConfig,
        expected_hash: [u8; 32],
    ) -> Self {
        let chunk_size = config.default_chunk_size as u64;
        let min_chunk_size = config.min_chunk_size as u64;
        let chunk_size = chunk_size.clamp(min_chunk_size.min(block_size.max(1)), block_size.max(1));
        let temp_path = temp_path_for(&file, block_offset);
        let (events, _) = broadcast::channel(64);
        Self {
            file,
            temp_path,
            block_offset,
            block_size,
            chunk_size,
            expected_hash,
            completed: RangeSet::default(),
            banned_peers: HashSet::new(),
            finalized: false,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BlockTransferEvent> {
        self.events.subscribe()
    }

    pub fn is_complete(&self) -> bool {
        self.completed.total_covered() >= self.block_size
    }

    pub fn is_banned(&self, peer: &DeviceId) -> bool {
        self.banned_peers.contains(peer)
    }

    /// Smallest offset not yet covered, relative to the block start, or
    /// `None` if the block is already fully covered.
    fn next_chunk(&self) -> Option<(u64, u64)> {
        let block_end = self.block_offset + self.block_size;
        let offset = self.completed.next_uncovered(self.block_offset, block_end)?;
        let size = self.chunk_size.min(block_end - offset);
        Some((offset, size))
    }

    async fn ensure_temp_file(&self) -> CoreResult<File> {
        if let Some(parent) = self.temp_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.temp_path)
            .await
            .map_err(CoreError::from)
    }

    /// Pulls the next uncovered chunk from `peer` via `source`. Returns
    /// `Ok(true)` once the block is fully covered, hash-verified, and
    /// renamed into place.
    ///
    /// A chunk error (timeout, short read, hash mismatch at block
    /// completion) is retryable. A peer returning bytes outside the
    /// requested interval is a protocol violation: the peer is
    /// permanently banned for this block and the error is not
    /// retryable with that peer.
    pub async fn pull(&mut self, peer: DeviceId, source: &dyn ChunkSource) -> CoreResult<bool> {
        if self.finalized {
            return Ok(true);
        }

        if self.is_banned(&peer) {
            return Err(CoreError::ProtocolViolation(format!(
                "peer {} is banned for this block",
                hex::encode(peer)
            )));
        }

        let Some((offset, size)) = self.next_chunk() else {
            return self.finalize().await;
        };

        let bytes = source.fetch(peer, offset, size).await?;
        if bytes.len() as u64 > size {
            self.banned_peers.insert(peer);
            let _ = self.events.send(BlockTransferEvent::PeerBanned { peer });
            return Err(CoreError::ProtocolViolation(
                "peer returned data outside the requested interval".to_string(),
            ));
        }

        // Idempotent: a chunk already covered (e.g. the caller retried
        // before this check) is a no-op rather than an error.
        if self.completed.covers(offset, offset + bytes.len() as u64) {
            return Ok(self.is_complete());
        }

        let mut temp = self.ensure_temp_file().await?;
        temp.seek(SeekFrom::Start(offset)).await?;
        temp.write_all(&bytes).await?;
        temp.flush().await?;

        self.completed.insert(offset, offset + bytes.len() as u64);
        let _ = self.events.send(BlockTransferEvent::ChunkWritten {
            offset,
            size: bytes.len() as u64,
        });

        if self.is_complete() {
            self.finalize().await
        } else {
            Ok(false)
        }
    }

    /// Verifies the completed block hash and renames the temp file
    /// into place, or discards it and restarts the block on mismatch.
    async fn finalize(&mut self) -> CoreResult<bool> {
        if self.finalized {
            return Ok(true);
        }
        if !self.is_complete() {
            return Ok(false);
        }

        let digest = hash_block(&self.temp_path, self.block_offset, self.block_size).await?;
        if digest != self.expected_hash {
            let _ = fs::remove_file(&self.temp_path).await;
            self.completed = RangeSet::default();
            let _ = self.events.send(BlockTransferEvent::VerificationFailed {
                file: self.file.clone(),
            });
            return Ok(false);
        }

        if let Some(parent) = self.file.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(&self.temp_path, &self.file).await?;
        self.finalized = true;
        let _ = self.events.send(BlockTransferEvent::Completed {
            file: self.file.clone(),
        });
        Ok(true)
    }
}

fn temp_path_for(file: &Path, block_offset: u64) -> PathBuf {
    let mut name = file.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(format!(".pscache-{block_offset}.tmp"));
    file.with_file_name(name)
}

/// Hashes the block's bytes in fixed-size chunks rather than loading it
/// into memory at once.
async fn hash_block(temp_path: &Path, block_offset: u64, block_size: u64) -> CoreResult<[u8; 32]> {
    let mut file = File::open(temp_path).await?;
    file.seek(SeekFrom::Start(block_offset)).await?;

    let mut hasher = Sha256::new();
    let mut remaining = block_size;
    let mut buf = vec![0u8; HASH_CHUNK];
    while remaining > 0 {
        let to_read = (buf.len() as u64).min(remaining) as usize;
        let read = file.read(&mut buf[..to_read]).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
        remaining -= read as u64;
        tokio::task::yield_now().await;
    }

    Ok(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    struct FixedChunkSource {
        data: Vec<u8>,
        lie_about_size: bool,
    }

    #[async_trait]
    impl ChunkSource for FixedChunkSource {
        async fn fetch(&self, _peer: DeviceId, offset: u64, size: u64) -> CoreResult<Vec<u8>> {
            let start = offset as usize;
            let len = if self.lie_about_size { size as usize + 8 } else { size as usize };
            let end = (start + len).min(self.data.len());
            Ok(self.data[start..end].to_vec())
        }
    }

    fn block_hash(data: &[u8]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(data);
        hasher.finalize().into()
    }

    #[tokio::test]
    async fn pulls_and_completes_a_block() {
        let dir = tempdir().unwrap();
        let data = vec![7u8; 200 * 1024];
        let hash = block_hash(&data);
        let target = dir.path().join("file.bin");

        let mut transfer = BlockTransfer::new(target.clone(), 0, data.len() as u64, &TransferConfig::default(), hash);
        let source = FixedChunkSource { data: data.clone(), lie_about_size: false };
        let peer = [1u8; 32];

        let mut done = false;
        for _ in 0..10 {
            done = transfer.pull(peer, &source).await.unwrap();
            if done {
                break;
            }
        }

        assert!(done);
        assert!(target.exists());
        let written = tokio::fs::read(&target).await.unwrap();
        assert_eq!(written, data);
    }

    #[tokio::test]
    async fn protocol_violation_bans_peer_permanently() {
        let dir = tempdir().unwrap();
        let data = vec![1u8; 64 * 1024];
        let hash = block_hash(&data);
        let target = dir.path().join("file.bin");

        let mut transfer = BlockTransfer::new(target, 0, data.len() as u64, &TransferConfig::default(), hash);
        let source = FixedChunkSource { data, lie_about_size: true };
        let peer = [2u8; 32];

        let result = transfer.pull(peer, &source).await;
        assert!(result.is_err());
        assert!(transfer.is_banned(&peer));

        let retried = transfer.pull(peer, &source).await;
        assert!(matches!(retried, Err(CoreError::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn duplicate_chunk_is_idempotent() {
        let dir = tempdir().unwrap();
        let data = vec![3u8; 64 * 1024];
        let hash = block_hash(&data);
        let target = dir.path().join("file.bin");

        let mut transfer = BlockTransfer::new(target, 0, data.len() as u64, &TransferConfig::default(), hash);
        let source = FixedChunkSource { data, lie_about_size: false };
        let peer = [3u8; 32];

        let first = transfer.pull(peer, &source).await.unwrap();
        assert!(first);
        let second = transfer.pull(peer, &source).await.unwrap();
        assert!(second);
    }

    #[tokio::test]
    async fn verification_failure_restarts_the_block() {
        let dir = tempdir().unwrap();
        let data = vec![9u8; 64 * 1024];
        let wrong_hash = [0u8; 32];
        let target = dir.path().join("file.bin");

        let mut transfer = BlockTransfer::new(target.clone(), 0, data.len() as u64, &TransferConfig::default(), wrong_hash);
        let source = FixedChunkSource { data, lie_about_size: false };
        let peer = [4u8; 32];

        let done = transfer.pull(peer, &source).await.unwrap();
        assert!(!done);
        assert!(!transfer.is_complete());
        assert!(!target.exists());
    }
}
