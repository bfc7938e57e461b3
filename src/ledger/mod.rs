//! File Ledger
//!
//! Reconciles a client's chunk list for one destination path against the
//! packet store, and assembles the file once every chunk is stored.
//!
//! Protocol Flow:
//! 1. Client digests its file in fixed-size windows
//! 2. Client posts the digest list; the ledger reports the missing ones
//! 3. Client uploads only the missing packets
//! 4. Client re-posts the list; the ledger concatenates the packets

pub mod types;

pub use types::*;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::hasher::{ChunkHasher, Digest};
use crate::locks::KeyedLocks;
use crate::packets::{PacketError, PacketStore};
use crate::paths::SafePath;

pub type Result<T> = std::result::Result<T, LedgerError>;

/// Per-path plan/assemble protocol over the packet store
#[derive(Clone)]
pub struct Ledger {
    inner: Arc<LedgerInner>,
}

struct LedgerInner {
    /// Root for assembled files
    fs_root: PathBuf,

    /// Chunk size used when planning existing files
    block_size: usize,

    packets: PacketStore,

    /// Per-destination-path locks
    locks: KeyedLocks,
}

impl Ledger {
    pub fn new(fs_root: PathBuf, block_size: usize, packets: PacketStore) -> Self {
        Self {
            inner: Arc::new(LedgerInner {
                fs_root,
                block_size,
                packets,
                locks: KeyedLocks::new(),
            }),
        }
    }

    pub fn fs_root(&self) -> &Path {
        &self.inner.fs_root
    }

    /// Chunk an existing file and report each chunk's packet status
    pub async fn plan(&self, path: &SafePath) -> Result<Vec<PlanEntry>> {
        let target = path.resolve(&self.inner.fs_root);

        let metadata = match tokio::fs::metadata(&target).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LedgerError::NotFound(path.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        if !metadata.is_file() {
            return Err(LedgerError::NotAFile(path.clone()));
        }

        let chunks = ChunkHasher::new(self.inner.block_size)
            .hash_chunks(&target)
            .await?;

        let digests: Vec<Digest> = chunks.iter().map(|chunk| chunk.digest.clone()).collect();
        let statuses = self.inner.packets.statuses(&digests).await?;

        let entries: Vec<PlanEntry> = chunks
            .into_iter()
            .zip(statuses)
            .map(|(chunk, (_, status))| PlanEntry {
                index: chunk.index,
                offset: chunk.offset,
                length: chunk.length,
                digest: chunk.digest,
                status,
            })
            .collect();

        tracing::debug!(path = %path, chunks = entries.len(), "Planned existing file");
        Ok(entries)
    }

    /// Classify client digests into stored and missing
    pub async fn classify(&self, digests: &[Digest]) -> Result<LedgerReport> {
        let statuses = self.inner.packets.statuses(digests).await?;
        Ok(LedgerReport::new(statuses))
    }

    /// Create the file at `path` from stored packets, in the given order
    ///
    /// Never overwrites. When packets are missing nothing is created and the
    /// report lists them. A failure while copying removes the partial file.
    pub async fn assemble(&self, path: &SafePath, digests: &[Digest]) -> Result<AssembleOutcome> {
        let _guard = self.inner.locks.lock(path.as_str()).await;
        let target = path.resolve(&self.inner.fs_root);

        if tokio::fs::symlink_metadata(&target).await.is_ok() {
            return Err(LedgerError::AlreadyExists(path.clone()));
        }

        if !digests.is_empty() {
            // Refresh before classifying so a sweep cannot expire what we count on
            self.inner.packets.retain(digests).await?;

            let report = self.classify(digests).await?;
            if !report.is_complete() {
                tracing::info!(
                    path = %path,
                    chunks = digests.len(),
                    missing = report.missing.len(),
                    "Assembly waiting for packets"
                );
                return Ok(AssembleOutcome::Incomplete(report));
            }
        }

        let mut out = create_new(&self.inner.fs_root, &target, path).await?;

        match self.concatenate(&mut out, digests).await {
            Ok(size) => {
                tracing::info!(path = %path, chunks = digests.len(), size = size, "File assembled");
                Ok(AssembleOutcome::Created {
                    path: path.clone(),
                    size,
                })
            }
            Err(e) => {
                drop(out);
                if let Err(remove_err) = tokio::fs::remove_file(&target).await {
                    tracing::error!(
                        path = %path,
                        error = %remove_err,
                        "Failed to remove partially assembled file"
                    );
                }

                // A packet that vanished mid-copy is missing again, not an error
                if matches!(
                    e,
                    LedgerError::Packet(PacketError::NotFound(_) | PacketError::NotStored { .. })
                ) {
                    tracing::info!(path = %path, error = %e, "Packet vanished during assembly");
                    return Ok(AssembleOutcome::Incomplete(self.classify(digests).await?));
                }

                tracing::warn!(path = %path, error = %e, "Assembly failed");
                Err(e)
            }
        }
    }

    async fn concatenate(&self, out: &mut File, digests: &[Digest]) -> Result<u64> {
        let mut size = 0u64;
        for digest in digests {
            let mut packet = self.inner.packets.open_read(digest).await?.into_file();
            size += tokio::io::copy(&mut packet, out).await?;
        }
        out.flush().await?;
        out.sync_all().await?;
        Ok(size)
    }
}

/// Create `target` exclusively, along with its parent directories
///
/// A regular file where a parent directory should be is the client's
/// mistake and reports [`LedgerError::NotAFile`].
async fn create_new(root: &Path, target: &Path, path: &SafePath) -> Result<File> {
    if let Some(parent) = target.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            if blocked_by_file(root, parent).await {
                return Err(LedgerError::NotAFile(path.clone()));
            }
            return Err(e.into());
        }
    }

    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(target)
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::AlreadyExists => LedgerError::AlreadyExists(path.clone()),
            _ => LedgerError::Io(e),
        })
}

/// Whether some ancestor of `dir` below `root` exists as a non-directory
async fn blocked_by_file(root: &Path, dir: &Path) -> bool {
    for ancestor in dir.ancestors() {
        if ancestor == root || !ancestor.starts_with(root) {
            break;
        }
        if let Ok(metadata) = tokio::fs::symlink_metadata(ancestor).await {
            if !metadata.is_dir() {
                return true;
            }
        }
    }
    false
}
