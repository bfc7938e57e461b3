//! Packet Store
//!
//! Content-addressed storage for uploaded packets. Records live in SQLite,
//! bytes live under the packet root sharded by the first two digest
//! characters. Every write and read of a digest runs under that digest's
//! lock, so concurrent uploaders never interleave and a sweep never deletes
//! bytes a reader is verifying.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::Stream;
use sqlx::SqlitePool;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::types::{PacketError, PacketRecord, PacketRow, PacketStatus, SMALL_PAYLOAD_LIMIT};
use crate::db::timestamp;
use crate::hasher::{digest_file, Digest, READ_BUFFER_SIZE};
use crate::locks::{KeyGuard, KeyedLocks};

pub type Result<T> = std::result::Result<T, PacketError>;

/// Digests per `IN (...)` status lookup
pub const LOOKUP_BATCH: usize = 500;

// ============================================================================
// Packet Store
// ============================================================================

/// Content-addressed packet store
#[derive(Clone)]
pub struct PacketStore {
    inner: Arc<PacketStoreInner>,
}

struct PacketStoreInner {
    db: SqlitePool,

    /// Directory holding packet bytes
    root: PathBuf,

    /// Largest accepted packet in bytes
    max_packet_size: u64,

    /// Per-digest locks
    locks: KeyedLocks,
}

impl PacketStore {
    pub fn new(db: SqlitePool, root: PathBuf, max_packet_size: usize) -> Self {
        Self {
            inner: Arc::new(PacketStoreInner {
                db,
                root,
                max_packet_size: max_packet_size as u64,
                locks: KeyedLocks::new(),
            }),
        }
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    #[cfg(test)]
    pub(crate) fn db(&self) -> &SqlitePool {
        &self.inner.db
    }

    #[cfg(test)]
    pub(crate) async fn lock_digest(&self, digest: &Digest) -> KeyGuard {
        self.inner.locks.lock(digest.as_str()).await
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Load the record for a digest, if any
    pub async fn record(&self, digest: &Digest) -> Result<Option<PacketRecord>> {
        let row = sqlx::query_as::<_, PacketRow>(
            r#"
            SELECT digest, storage_ref, status, size, created_at, last_used_at
            FROM file_packets
            WHERE digest = ?
            "#,
        )
        .bind(digest.as_str())
        .fetch_optional(&self.inner.db)
        .await?;

        row.map(PacketRecord::try_from).transpose()
    }

    /// Status of a digest; `Pending` when no record exists
    pub async fn status(&self, digest: &Digest) -> Result<PacketStatus> {
        Ok(self
            .record(digest)
            .await?
            .map(|record| record.status)
            .unwrap_or(PacketStatus::Pending))
    }

    /// Status of each digest, in the given order
    ///
    /// Distinct digests are looked up in batches of [`LOOKUP_BATCH`].
    pub async fn statuses(&self, digests: &[Digest]) -> Result<Vec<(Digest, PacketStatus)>> {
        let unique: Vec<&Digest> = {
            let mut seen = HashSet::with_capacity(digests.len());
            digests.iter().filter(|digest| seen.insert(*digest)).collect()
        };

        let mut known: HashMap<Digest, PacketStatus> = HashMap::with_capacity(unique.len());
        for batch in unique.chunks(LOOKUP_BATCH) {
            let sql = format!(
                "SELECT digest, status FROM file_packets WHERE digest IN ({})",
                placeholders(batch.len())
            );
            let mut query = sqlx::query_as::<_, (String, String)>(&sql);
            for digest in batch {
                query = query.bind(digest.as_str());
            }

            for (digest, status) in query.fetch_all(&self.inner.db).await? {
                let digest: Digest = digest
                    .parse()
                    .map_err(|e: crate::hasher::InvalidDigest| PacketError::InvalidRecord(e.to_string()))?;
                known.insert(digest, status.parse()?);
            }
        }

        Ok(digests
            .iter()
            .map(|digest| {
                let status = known.get(digest).copied().unwrap_or(PacketStatus::Pending);
                (digest.clone(), status)
            })
            .collect())
    }

    /// Refresh `last_used_at` of every `STORED` packet among `digests`
    ///
    /// Each digest is refreshed under its lock, so a sweep that has not yet
    /// claimed the packet will find it fresh and leave it alone.
    pub async fn retain(&self, digests: &[Digest]) -> Result<()> {
        let mut seen = HashSet::with_capacity(digests.len());
        for digest in digests.iter().filter(|digest| seen.insert(*digest)) {
            let _guard = self.inner.locks.lock(digest.as_str()).await;
            sqlx::query("UPDATE file_packets SET last_used_at = ? WHERE digest = ? AND status = 'STORED'")
                .bind(timestamp(Utc::now()))
                .bind(digest.as_str())
                .execute(&self.inner.db)
                .await?;
        }
        Ok(())
    }

    // ========================================================================
    // Writing
    // ========================================================================

    /// Start (or restart) the upload of a packet
    ///
    /// Holds the digest lock until the returned writer is committed,
    /// aborted, or dropped. A dropped writer leaves the record `NEW`.
    pub async fn open_write(&self, digest: &Digest) -> Result<PacketWriter> {
        let guard = self.inner.locks.lock(digest.as_str()).await;

        if let Some(record) = self.record(digest).await? {
            if record.status.is_stored() {
                return Err(PacketError::AlreadyStored(digest.clone()));
            }
        }

        let storage_ref = storage_ref(digest);
        let path = self.inner.root.join(&storage_ref);
        let now = timestamp(Utc::now());

        sqlx::query(
            r#"
            INSERT INTO file_packets (digest, storage_ref, status, size, created_at, last_used_at)
            VALUES (?, ?, 'NEW', 0, ?, ?)
            ON CONFLICT(digest) DO UPDATE SET
                storage_ref = excluded.storage_ref,
                status = 'NEW',
                size = 0,
                last_used_at = excluded.last_used_at
            "#,
        )
        .bind(digest.as_str())
        .bind(&storage_ref)
        .bind(&now)
        .bind(&now)
        .execute(&self.inner.db)
        .await?;

        let file = match create_backing_file(&path).await {
            Ok(file) => file,
            Err(e) => {
                self.mark_failed(digest, Some(&path)).await;
                return Err(e.into());
            }
        };

        tracing::debug!(digest = %digest, path = %path.display(), "Opened packet for writing");

        Ok(PacketWriter {
            digest: digest.clone(),
            path,
            file,
            written: 0,
            limit: self.inner.max_packet_size,
            _guard: guard,
        })
    }

    /// Verify the written bytes and promote the packet to `STORED`
    ///
    /// The digest is recomputed from what actually reached the disk. Any
    /// failure leaves the packet `FAILED` with its bytes removed.
    pub async fn commit(&self, writer: PacketWriter) -> Result<PacketRecord> {
        let PacketWriter {
            digest,
            path,
            file,
            _guard,
            ..
        } = writer;

        match self.verify_and_store(&digest, &path, file).await {
            Ok(record) => {
                tracing::info!(digest = %digest, size = record.size, "Packet stored");
                Ok(record)
            }
            Err(e) => {
                self.mark_failed(&digest, Some(&path)).await;
                tracing::warn!(digest = %digest, error = %e, "Packet commit failed");
                Err(e)
            }
        }
    }

    /// Abandon an upload, leaving the packet `FAILED` and retryable
    pub async fn abort(&self, writer: PacketWriter) {
        let PacketWriter {
            digest,
            path,
            file,
            _guard,
            ..
        } = writer;
        drop(file);

        self.mark_failed(&digest, Some(&path)).await;
        tracing::debug!(digest = %digest, "Packet upload aborted");
    }

    async fn verify_and_store(&self, digest: &Digest, path: &Path, mut file: File) -> Result<PacketRecord> {
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let (actual, size) = digest_file(path).await?;
        if actual != *digest {
            let payload = if size <= SMALL_PAYLOAD_LIMIT {
                tokio::fs::read(path)
                    .await
                    .ok()
                    .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            } else {
                None
            };
            return Err(PacketError::DigestMismatch {
                expected: digest.clone(),
                actual,
                payload,
            });
        }

        sqlx::query(
            r#"
            UPDATE file_packets
            SET status = 'STORED', size = ?, last_used_at = ?
            WHERE digest = ?
            "#,
        )
        .bind(size as i64)
        .bind(timestamp(Utc::now()))
        .bind(digest.as_str())
        .execute(&self.inner.db)
        .await?;

        self.record(digest)
            .await?
            .ok_or_else(|| PacketError::InvalidRecord(format!("record for {digest} vanished")))
    }

    /// Mark a packet `FAILED` and drop its bytes; errors are only logged
    async fn mark_failed(&self, digest: &Digest, path: Option<&Path>) {
        if let Some(path) = path {
            if let Err(e) = remove_if_present(path).await {
                tracing::warn!(digest = %digest, error = %e, "Failed to remove packet bytes");
            }
        }

        let result = sqlx::query(
            r#"
            UPDATE file_packets
            SET status = 'FAILED', size = 0, last_used_at = ?
            WHERE digest = ?
            "#,
        )
        .bind(timestamp(Utc::now()))
        .bind(digest.as_str())
        .execute(&self.inner.db)
        .await;

        if let Err(e) = result {
            tracing::error!(digest = %digest, error = %e, "Failed to mark packet as FAILED");
        }
    }

    // ========================================================================
    // Reading
    // ========================================================================

    /// Open a stored packet for reading
    ///
    /// The bytes are re-verified against the digest before a handle is
    /// handed out; a mismatch or missing file demotes the packet to
    /// `FAILED`. The read refreshes `last_used_at`.
    pub async fn open_read(&self, digest: &Digest) -> Result<PacketReader> {
        let _guard = self.inner.locks.lock(digest.as_str()).await;

        let record = self
            .record(digest)
            .await?
            .ok_or_else(|| PacketError::NotFound(digest.clone()))?;

        if !record.status.is_stored() {
            return Err(PacketError::NotStored {
                digest: digest.clone(),
                status: record.status,
            });
        }

        let Some(storage_ref) = record.storage_ref else {
            self.mark_failed(digest, None).await;
            return Err(PacketError::Corrupt {
                digest: digest.clone(),
                reason: "stored packet has no storage reference".to_string(),
            });
        };
        let path = self.inner.root.join(storage_ref);

        let size = match digest_file(&path).await {
            Ok((actual, size)) if actual == *digest => size,
            Ok((actual, _)) => {
                self.mark_failed(digest, Some(&path)).await;
                tracing::error!(digest = %digest, actual = %actual, "Stored packet failed verification");
                return Err(PacketError::Corrupt {
                    digest: digest.clone(),
                    reason: format!("bytes hash to {actual}"),
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.mark_failed(digest, None).await;
                tracing::error!(digest = %digest, "Stored packet bytes are missing");
                return Err(PacketError::Corrupt {
                    digest: digest.clone(),
                    reason: "bytes are missing".to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        self.touch(digest).await?;
        let file = File::open(&path).await?;

        Ok(PacketReader {
            digest: digest.clone(),
            size,
            file,
        })
    }

    async fn touch(&self, digest: &Digest) -> Result<()> {
        sqlx::query("UPDATE file_packets SET last_used_at = ? WHERE digest = ?")
            .bind(timestamp(Utc::now()))
            .bind(digest.as_str())
            .execute(&self.inner.db)
            .await?;
        Ok(())
    }

    // ========================================================================
    // Cleanup
    // ========================================================================

    /// Delete `STORED` packets unused for longer than `ttl`
    ///
    /// Returns the number of packets reclaimed.
    pub async fn evict_expired(&self, ttl: Duration) -> Result<usize> {
        let count = self.sweep(&[PacketStatus::Stored], ttl).await?;
        if count > 0 {
            tracing::info!(count = count, "Evicted expired packets");
        }
        Ok(count)
    }

    /// Delete `NEW`/`FAILED` packets untouched for longer than `ttl`
    pub async fn reap_stalled(&self, ttl: Duration) -> Result<usize> {
        let count = self
            .sweep(&[PacketStatus::New, PacketStatus::Failed], ttl)
            .await?;
        if count > 0 {
            tracing::info!(count = count, "Reaped stalled packet uploads");
        }
        Ok(count)
    }

    async fn sweep(&self, statuses: &[PacketStatus], ttl: Duration) -> Result<usize> {
        let Some(cutoff) = cutoff(ttl) else {
            return Ok(0);
        };

        let rows = sqlx::query_as::<_, PacketRow>(
            r#"
            SELECT digest, storage_ref, status, size, created_at, last_used_at
            FROM file_packets
            WHERE last_used_at < ?
            "#,
        )
        .bind(&cutoff)
        .fetch_all(&self.inner.db)
        .await?;

        let mut count = 0;
        for row in rows {
            let record = match PacketRecord::try_from(row) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping unreadable packet record");
                    continue;
                }
            };
            if !statuses.contains(&record.status) {
                continue;
            }

            // Busy digests are picked up by a later sweep
            let Some(_guard) = self.inner.locks.try_lock(record.digest.as_str()) else {
                continue;
            };

            // Re-check under the lock; a reader may have refreshed it
            let Some(current) = self.record(&record.digest).await? else {
                continue;
            };
            if !statuses.contains(&current.status) || timestamp(current.last_used_at) >= cutoff {
                continue;
            }

            if let Some(storage_ref) = &current.storage_ref {
                remove_if_present(&self.inner.root.join(storage_ref)).await?;
            }
            sqlx::query("DELETE FROM file_packets WHERE digest = ?")
                .bind(current.digest.as_str())
                .execute(&self.inner.db)
                .await?;

            tracing::debug!(digest = %current.digest, status = %current.status, "Deleted packet");
            count += 1;
        }

        Ok(count)
    }
}

// ============================================================================
// Writer / Reader
// ============================================================================

/// Sink for the bytes of one packet upload
///
/// Owns the digest lock for as long as it lives.
#[derive(Debug)]
pub struct PacketWriter {
    digest: Digest,
    path: PathBuf,
    file: File,
    written: u64,
    limit: u64,
    _guard: KeyGuard,
}

impl PacketWriter {
    /// Append bytes; fails once the packet would exceed the size limit
    ///
    /// After an error the caller should hand the writer to
    /// [`PacketStore::abort`].
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.written + data.len() as u64 > self.limit {
            return Err(PacketError::TooLarge {
                digest: self.digest.clone(),
                limit: self.limit,
            });
        }
        self.file.write_all(data).await?;
        self.written += data.len() as u64;
        Ok(())
    }
}

/// Verified, open handle to a stored packet
#[derive(Debug)]
pub struct PacketReader {
    pub digest: Digest,
    pub size: u64,
    file: File,
}

impl PacketReader {
    pub fn into_file(self) -> File {
        self.file
    }

    /// Stream the packet in bounded frames
    pub fn into_stream(self) -> impl Stream<Item = std::io::Result<Vec<u8>>> + Send {
        futures::stream::try_unfold(self.file, |mut file| async move {
            let mut buffer = vec![0u8; READ_BUFFER_SIZE];
            let read = file.read(&mut buffer).await?;
            buffer.truncate(read);
            Ok::<_, std::io::Error>((read > 0).then_some((buffer, file)))
        })
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Storage location of a digest relative to the packet root
fn storage_ref(digest: &Digest) -> String {
    let (prefix, rest) = digest.as_str().split_at(2);
    format!("{prefix}/{rest}")
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

async fn create_backing_file(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    File::create(path).await
}

async fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn cutoff(ttl: Duration) -> Option<String> {
    let ttl = chrono::Duration::from_std(ttl).ok()?;
    Utc::now().checked_sub_signed(ttl).map(timestamp)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::hasher::digest_bytes;
    use futures::TryStreamExt;
    use tempfile::TempDir;

    async fn test_store(dir: &TempDir) -> PacketStore {
        let pool = test_pool(dir).await;
        PacketStore::new(pool, dir.path().join("packets"), 1024 * 1024)
    }

    async fn upload(store: &PacketStore, digest: &Digest, data: &[u8]) -> Result<PacketRecord> {
        let mut writer = store.open_write(digest).await?;
        writer.write(data).await?;
        store.commit(writer).await
    }

    async fn read_all(store: &PacketStore, digest: &Digest) -> Result<Vec<u8>> {
        let reader = store.open_read(digest).await?;
        let frames: Vec<Vec<u8>> = reader.into_stream().try_collect().await?;
        Ok(frames.concat())
    }

    async fn age(store: &PacketStore, digest: &Digest, hours: i64) {
        sqlx::query("UPDATE file_packets SET last_used_at = ? WHERE digest = ?")
            .bind(timestamp(Utc::now() - chrono::Duration::hours(hours)))
            .bind(digest.as_str())
            .execute(&store.inner.db)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_upload_then_read_back() {
        let temp_dir = TempDir::new().unwrap();
        let store = test_store(&temp_dir).await;

        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 253) as u8).collect();
        let digest = digest_bytes(&data);

        assert_eq!(store.status(&digest).await.unwrap(), PacketStatus::Pending);

        let record = upload(&store, &digest, &data).await.unwrap();
        assert_eq!(record.status, PacketStatus::Stored);
        assert_eq!(record.size, data.len() as u64);
        assert_eq!(record.storage_ref.as_deref(), Some(storage_ref(&digest).as_str()));

        assert_eq!(read_all(&store, &digest).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_reupload_of_stored_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let store = test_store(&temp_dir).await;

        let data = b"first and only";
        let digest = digest_bytes(data);
        upload(&store, &digest, data).await.unwrap();

        let result = store.open_write(&digest).await;
        assert!(matches!(result, Err(PacketError::AlreadyStored(_))));

        assert_eq!(store.status(&digest).await.unwrap(), PacketStatus::Stored);
        assert_eq!(read_all(&store, &digest).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_mismatch_marks_failed_and_allows_retry() {
        let temp_dir = TempDir::new().unwrap();
        let store = test_store(&temp_dir).await;

        let good = b"the real payload";
        let digest = digest_bytes(good);

        let err = upload(&store, &digest, b"something else").await.unwrap_err();
        match err {
            PacketError::DigestMismatch { expected, actual, payload } => {
                assert_eq!(expected, digest);
                assert_eq!(actual, digest_bytes(b"something else"));
                assert_eq!(payload.as_deref(), Some("something else"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.status(&digest).await.unwrap(), PacketStatus::Failed);
        assert!(matches!(
            store.open_read(&digest).await,
            Err(PacketError::NotStored { status: PacketStatus::Failed, .. })
        ));

        upload(&store, &digest, good).await.unwrap();
        assert_eq!(read_all(&store, &digest).await.unwrap(), good);
    }

    #[tokio::test]
    async fn test_large_mismatch_omits_payload() {
        let temp_dir = TempDir::new().unwrap();
        let store = test_store(&temp_dir).await;

        let digest = digest_bytes(b"x");
        let err = upload(&store, &digest, &vec![0u8; 4096]).await.unwrap_err();
        assert!(matches!(err, PacketError::DigestMismatch { payload: None, .. }));
    }

    #[tokio::test]
    async fn test_oversized_packet_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let pool = test_pool(&temp_dir).await;
        let store = PacketStore::new(pool, temp_dir.path().join("packets"), 8);

        let data = b"more than eight bytes";
        let digest = digest_bytes(data);
        let mut writer = store.open_write(&digest).await.unwrap();
        let err = writer.write(data).await.unwrap_err();
        assert!(matches!(err, PacketError::TooLarge { limit: 8, .. }));

        store.abort(writer).await;
        assert_eq!(store.status(&digest).await.unwrap(), PacketStatus::Failed);
    }

    #[tokio::test]
    async fn test_dropped_writer_stays_new() {
        let temp_dir = TempDir::new().unwrap();
        let store = test_store(&temp_dir).await;

        let data = b"interrupted upload";
        let digest = digest_bytes(data);
        {
            let mut writer = store.open_write(&digest).await.unwrap();
            writer.write(&data[..5]).await.unwrap();
        }

        assert_eq!(store.status(&digest).await.unwrap(), PacketStatus::New);
        upload(&store, &digest, data).await.unwrap();
        assert_eq!(store.status(&digest).await.unwrap(), PacketStatus::Stored);
    }

    #[tokio::test]
    async fn test_read_unknown_digest() {
        let temp_dir = TempDir::new().unwrap();
        let store = test_store(&temp_dir).await;

        let digest = digest_bytes(b"never uploaded");
        assert!(matches!(store.open_read(&digest).await, Err(PacketError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_tampered_bytes_are_never_served() {
        let temp_dir = TempDir::new().unwrap();
        let store = test_store(&temp_dir).await;

        let data = b"pristine";
        let digest = digest_bytes(data);
        upload(&store, &digest, data).await.unwrap();

        let path = store.root().join(storage_ref(&digest));
        tokio::fs::write(&path, b"tampered").await.unwrap();

        assert!(matches!(store.open_read(&digest).await, Err(PacketError::Corrupt { .. })));
        assert_eq!(store.status(&digest).await.unwrap(), PacketStatus::Failed);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_vanished_bytes_demote_packet() {
        let temp_dir = TempDir::new().unwrap();
        let store = test_store(&temp_dir).await;

        let data = b"soon gone";
        let digest = digest_bytes(data);
        upload(&store, &digest, data).await.unwrap();
        tokio::fs::remove_file(store.root().join(storage_ref(&digest)))
            .await
            .unwrap();

        assert!(matches!(store.open_read(&digest).await, Err(PacketError::Corrupt { .. })));
        assert_eq!(store.status(&digest).await.unwrap(), PacketStatus::Failed);
    }

    #[tokio::test]
    async fn test_evict_expired_only_removes_old_stored() {
        let temp_dir = TempDir::new().unwrap();
        let store = test_store(&temp_dir).await;
        let ttl = Duration::from_secs(48 * 3600);

        let old = digest_bytes(b"old");
        let fresh = digest_bytes(b"fresh");
        upload(&store, &old, b"old").await.unwrap();
        upload(&store, &fresh, b"fresh").await.unwrap();

        let stalled = digest_bytes(b"stalled");
        drop(store.open_write(&stalled).await.unwrap());

        age(&store, &old, 49).await;
        age(&store, &stalled, 49).await;

        assert_eq!(store.evict_expired(ttl).await.unwrap(), 1);
        assert_eq!(store.status(&old).await.unwrap(), PacketStatus::Pending);
        assert!(!store.root().join(storage_ref(&old)).exists());
        assert_eq!(store.status(&fresh).await.unwrap(), PacketStatus::Stored);
        assert_eq!(store.status(&stalled).await.unwrap(), PacketStatus::New);

        assert_eq!(store.reap_stalled(ttl).await.unwrap(), 1);
        assert_eq!(store.status(&stalled).await.unwrap(), PacketStatus::Pending);
    }

    #[tokio::test]
    async fn test_read_refreshes_last_used() {
        let temp_dir = TempDir::new().unwrap();
        let store = test_store(&temp_dir).await;
        let ttl = Duration::from_secs(3600);

        let digest = digest_bytes(b"busy");
        upload(&store, &digest, b"busy").await.unwrap();
        age(&store, &digest, 2).await;

        let reader = store.open_read(&digest).await.unwrap();
        assert_eq!(store.evict_expired(ttl).await.unwrap(), 0);
        drop(reader);
        assert_eq!(store.status(&digest).await.unwrap(), PacketStatus::Stored);
    }

    #[tokio::test]
    async fn test_sweep_skips_locked_digest() {
        let temp_dir = TempDir::new().unwrap();
        let store = test_store(&temp_dir).await;
        let ttl = Duration::from_secs(3600);

        let digest = digest_bytes(b"held");
        upload(&store, &digest, b"held").await.unwrap();
        age(&store, &digest, 2).await;

        let guard = store.inner.locks.lock(digest.as_str()).await;
        assert_eq!(store.evict_expired(ttl).await.unwrap(), 0);
        drop(guard);
        assert_eq!(store.evict_expired(ttl).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_statuses_keep_request_order_across_batches() {
        let temp_dir = TempDir::new().unwrap();
        let store = test_store(&temp_dir).await;

        let stored = digest_bytes(b"stored");
        upload(&store, &stored, b"stored").await.unwrap();
        let stalled = digest_bytes(b"stalled");
        drop(store.open_write(&stalled).await.unwrap());

        let mut digests: Vec<Digest> = (0..LOOKUP_BATCH + 10)
            .map(|i| digest_bytes(i.to_string().as_bytes()))
            .collect();
        digests.push(stored.clone());
        digests.insert(0, stalled.clone());
        digests.push(stored.clone());

        let statuses = store.statuses(&digests).await.unwrap();
        assert_eq!(statuses.len(), digests.len());
        assert_eq!(statuses[0], (stalled, PacketStatus::New));
        assert_eq!(statuses[1].1, PacketStatus::Pending);
        assert_eq!(statuses[LOOKUP_BATCH + 5].1, PacketStatus::Pending);
        assert_eq!(statuses[statuses.len() - 2], (stored.clone(), PacketStatus::Stored));
        assert_eq!(statuses[statuses.len() - 1], (stored, PacketStatus::Stored));
    }

    #[tokio::test]
    async fn test_retain_protects_stored_from_eviction() {
        let temp_dir = TempDir::new().unwrap();
        let store = test_store(&temp_dir).await;
        let ttl = Duration::from_secs(3600);

        let kept = digest_bytes(b"kept");
        upload(&store, &kept, b"kept").await.unwrap();
        let stalled = digest_bytes(b"stalled");
        drop(store.open_write(&stalled).await.unwrap());
        age(&store, &kept, 2).await;
        age(&store, &stalled, 2).await;

        store
            .retain(&[kept.clone(), stalled.clone(), kept.clone()])
            .await
            .unwrap();

        assert_eq!(store.evict_expired(ttl).await.unwrap(), 0);
        assert_eq!(store.status(&kept).await.unwrap(), PacketStatus::Stored);

        // Only stored packets are refreshed
        assert_eq!(store.reap_stalled(ttl).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_writers_are_serialized() {
        let temp_dir = TempDir::new().unwrap();
        let store = test_store(&temp_dir).await;

        let data = b"contended";
        let digest = digest_bytes(data);
        let mut first = store.open_write(&digest).await.unwrap();

        let second = {
            let store = store.clone();
            let digest = digest.clone();
            tokio::spawn(async move { store.open_write(&digest).await.map(|_| ()) })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished());

        first.write(data).await.unwrap();
        store.commit(first).await.unwrap();

        let result = second.await.unwrap();
        assert!(matches!(result, Err(PacketError::AlreadyStored(_))));
    }
}
