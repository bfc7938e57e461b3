//! Transfer Orchestrator
//!
//! Composes path safety, access control, the packet store and the ledger
//! into the operations exposed over HTTP. Every entry point takes the
//! acting [`Identity`] and a raw client parameter, so callers outside the
//! router get the same checks.

pub mod error;

pub use error::TransferError;

use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use serde::Serialize;
use sqlx::SqlitePool;

use crate::access::AccessRuleRepository;
use crate::config::Config;
use crate::hasher::Digest;
use crate::ledger::{parse_hashes, AssembleOutcome, Ledger, PlanEntry};
use crate::packets::{PacketReader, PacketRecord, PacketStatus, PacketStore};
use crate::paths::SafePath;

pub type Result<T> = std::result::Result<T, TransferError>;

/// Prefix of the virtual path packets are access-checked under
pub const PACKET_PATH_PREFIX: &str = "file-packet";

/// Acting user, as asserted by the fronting authenticator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity(String);

impl Identity {
    /// Empty or whitespace-only names are not identities
    pub fn new(name: &str) -> Option<Self> {
        let name = name.trim();
        (!name.is_empty()).then(|| Self(name.to_string()))
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

/// Packets removed by one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub evicted: usize,
    pub reaped: usize,
}

/// Transfer service
#[derive(Clone)]
pub struct TransferService {
    inner: Arc<TransferInner>,
}

struct TransferInner {
    db: SqlitePool,
    packets: PacketStore,
    ledger: Ledger,
    packet_ttl: Duration,
}

impl TransferService {
    pub fn new(config: &Config, db: SqlitePool) -> Self {
        let packets = PacketStore::new(
            db.clone(),
            config.storage.packet_root.clone(),
            config.transfer.block_size,
        );
        let ledger = Ledger::new(
            config.storage.fs_root.clone(),
            config.transfer.block_size,
            packets.clone(),
        );

        Self {
            inner: Arc::new(TransferInner {
                db,
                packets,
                ledger,
                packet_ttl: config.transfer.packet_ttl(),
            }),
        }
    }

    pub fn packets(&self) -> &PacketStore {
        &self.inner.packets
    }

    pub fn ledger(&self) -> &Ledger {
        &self.inner.ledger
    }

    // ========================================================================
    // Guards
    // ========================================================================

    /// Check `path` for `identity` against the current rule set
    async fn authorize(&self, identity: &Identity, path: &SafePath) -> Result<()> {
        let policy = AccessRuleRepository::new(&self.inner.db).policy().await?;

        policy.check(path, identity.name()).map_err(|denial| {
            tracing::warn!(
                user = identity.name(),
                path = %path,
                rule = denial.rule_id,
                "Access denied"
            );
            TransferError::AccessDenied(denial)
        })
    }

    async fn authorize_path(&self, identity: &Identity, raw_path: &str) -> Result<SafePath> {
        let path = SafePath::parse(raw_path)?;
        self.authorize(identity, &path).await?;
        Ok(path)
    }

    async fn authorize_packet(&self, identity: &Identity, raw_digest: &str) -> Result<Digest> {
        let digest: Digest = raw_digest.parse()?;
        let path = SafePath::parse(&format!("{PACKET_PATH_PREFIX}/{digest}"))?;
        self.authorize(identity, &path).await?;
        Ok(digest)
    }

    // ========================================================================
    // Packets
    // ========================================================================

    pub async fn packet_status(&self, identity: &Identity, raw_digest: &str) -> Result<(Digest, PacketStatus)> {
        let digest = self.authorize_packet(identity, raw_digest).await?;
        let status = self.inner.packets.status(&digest).await?;
        Ok((digest, status))
    }

    pub async fn read_packet(&self, identity: &Identity, raw_digest: &str) -> Result<PacketReader> {
        let digest = self.authorize_packet(identity, raw_digest).await?;
        Ok(self.inner.packets.open_read(&digest).await?)
    }

    /// Receive a packet body and commit it
    ///
    /// Frames are written as they arrive. Whatever the outcome, a sweep
    /// runs afterwards.
    pub async fn upload_packet<S, B, E>(
        &self,
        identity: &Identity,
        raw_digest: &str,
        body: S,
    ) -> Result<PacketRecord>
    where
        S: Stream<Item = std::result::Result<B, E>>,
        B: AsRef<[u8]>,
        E: std::fmt::Display,
    {
        let digest = self.authorize_packet(identity, raw_digest).await?;

        let result = self.receive(&digest, body).await;
        if let Err(e) = &result {
            tracing::info!(user = identity.name(), digest = %digest, error = %e, "Packet upload rejected");
        }

        if let Err(e) = self.sweep().await {
            tracing::error!(error = %e, "Post-upload sweep failed");
        }

        result
    }

    async fn receive<S, B, E>(&self, digest: &Digest, body: S) -> Result<PacketRecord>
    where
        S: Stream<Item = std::result::Result<B, E>>,
        B: AsRef<[u8]>,
        E: std::fmt::Display,
    {
        let packets = &self.inner.packets;
        let mut writer = packets.open_write(digest).await?;

        futures::pin_mut!(body);
        while let Some(frame) = body.next().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    packets.abort(writer).await;
                    return Err(TransferError::ClientInput(format!("Request body failed: {e}")));
                }
            };
            if let Err(e) = writer.write(frame.as_ref()).await {
                packets.abort(writer).await;
                return Err(e.into());
            }
        }

        Ok(packets.commit(writer).await?)
    }

    // ========================================================================
    // Ledger
    // ========================================================================

    pub async fn ledger_plan(&self, identity: &Identity, raw_path: &str) -> Result<Vec<PlanEntry>> {
        let path = self.authorize_path(identity, raw_path).await?;
        Ok(self.inner.ledger.plan(&path).await?)
    }

    /// Assemble `raw_path` from a `{"hashes": [...]}` body
    pub async fn assemble(&self, identity: &Identity, raw_path: &str, body: &[u8]) -> Result<AssembleOutcome> {
        let path = self.authorize_path(identity, raw_path).await?;
        let digests = parse_hashes(body)?;
        let outcome = self.inner.ledger.assemble(&path, &digests).await?;

        if let AssembleOutcome::Created { size, .. } = &outcome {
            tracing::info!(user = identity.name(), path = %path, size = size, "Ledger file created");
        }
        Ok(outcome)
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Evict expired packets and reap stalled uploads
    pub async fn sweep(&self) -> Result<SweepReport> {
        let ttl = self.inner.packet_ttl;
        Ok(SweepReport {
            evicted: self.inner.packets.evict_expired(ttl).await?,
            reaped: self.inner.packets.reap_stalled(ttl).await?,
        })
    }

    /// Start a background task sweeping every `period`
    pub fn start_sweep_task(self, period: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);

            loop {
                interval.tick().await;
                match self.sweep().await {
                    Ok(report) => tracing::debug!(
                        evicted = report.evicted,
                        reaped = report.reaped,
                        "Background sweep finished"
                    ),
                    Err(e) => tracing::error!(error = %e, "Background sweep failed"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::NewAccessRule;
    use crate::db::test_pool;
    use crate::hasher::digest_bytes;
    use tempfile::TempDir;

    async fn test_service(dir: &TempDir, block_size: usize) -> (TransferService, SqlitePool) {
        let pool = test_pool(dir).await;
        let mut config = Config::default();
        config.storage.fs_root = dir.path().join("files");
        config.storage.packet_root = dir.path().join("packets");
        config.transfer.block_size = block_size;
        (TransferService::new(&config, pool.clone()), pool)
    }

    fn body(frames: &[&[u8]]) -> impl Stream<Item = std::result::Result<Vec<u8>, std::io::Error>> {
        let frames: Vec<_> = frames
            .iter()
            .map(|f| Ok::<_, std::io::Error>(f.to_vec()))
            .collect();
        futures::stream::iter(frames)
    }

    fn user(name: &str) -> Identity {
        Identity::new(name).unwrap()
    }

    #[test]
    fn test_identity_rejects_blank() {
        assert!(Identity::new("").is_none());
        assert!(Identity::new("   ").is_none());
        assert_eq!(Identity::new(" alice ").unwrap().name(), "alice");
    }

    #[tokio::test]
    async fn test_upload_in_frames_then_read() {
        let temp_dir = TempDir::new().unwrap();
        let (service, _pool) = test_service(&temp_dir, 64).await;
        let alice = user("alice");

        let digest = digest_bytes(b"framed payload");
        let record = service
            .upload_packet(&alice, digest.as_str(), body(&[b"framed ", b"payload"]))
            .await
            .unwrap();
        assert_eq!(record.size, 14);

        let (_, status) = service.packet_status(&alice, digest.as_str()).await.unwrap();
        assert_eq!(status, PacketStatus::Stored);
        let reader = service.read_packet(&alice, digest.as_str()).await.unwrap();
        assert_eq!(reader.size, 14);
    }

    #[tokio::test]
    async fn test_broken_body_aborts_upload() {
        let temp_dir = TempDir::new().unwrap();
        let (service, _pool) = test_service(&temp_dir, 64).await;
        let alice = user("alice");

        let digest = digest_bytes(b"never arrives");
        let frames: Vec<std::result::Result<Vec<u8>, std::io::Error>> = vec![
            Ok(b"never".to_vec()),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
        ];
        let result = service
            .upload_packet(&alice, digest.as_str(), futures::stream::iter(frames))
            .await;
        assert!(matches!(result, Err(TransferError::ClientInput(_))));

        let (_, status) = service.packet_status(&alice, digest.as_str()).await.unwrap();
        assert_eq!(status, PacketStatus::Failed);
    }

    #[tokio::test]
    async fn test_oversized_body_is_too_large() {
        let temp_dir = TempDir::new().unwrap();
        let (service, _pool) = test_service(&temp_dir, 4).await;

        let digest = digest_bytes(b"12345");
        let result = service
            .upload_packet(&user("alice"), digest.as_str(), body(&[b"123", b"45"]))
            .await;
        assert!(matches!(result, Err(TransferError::TooLarge { limit: 4 })));
    }

    #[tokio::test]
    async fn test_invalid_parameters_are_client_input() {
        let temp_dir = TempDir::new().unwrap();
        let (service, _pool) = test_service(&temp_dir, 64).await;
        let alice = user("alice");

        assert!(matches!(
            service.packet_status(&alice, "not-a-digest").await,
            Err(TransferError::ClientInput(_))
        ));
        assert!(matches!(
            service.ledger_plan(&alice, "../etc/passwd").await,
            Err(TransferError::ClientInput(_))
        ));
        assert!(matches!(
            service.assemble(&alice, "/abs/path", br#"{"hashes": []}"#).await,
            Err(TransferError::ClientInput(_))
        ));
        assert!(matches!(
            service.assemble(&alice, "ok/path", b"[]").await,
            Err(TransferError::ClientInput(_))
        ));
    }

    #[tokio::test]
    async fn test_rules_gate_ledger_and_packets() {
        let temp_dir = TempDir::new().unwrap();
        let (service, pool) = test_service(&temp_dir, 64).await;
        let repo = AccessRuleRepository::new(&pool);
        repo.insert(&NewAccessRule::template("users/$USER/", "$USER"))
            .await
            .unwrap();
        repo.insert(&NewAccessRule::literal("file-packet/", "uploader"))
            .await
            .unwrap();

        let result = service
            .assemble(&user("bob"), "users/alice/x.txt", br#"{"hashes": []}"#)
            .await;
        assert!(matches!(result, Err(TransferError::AccessDenied(_))));
        assert!(!service.ledger().fs_root().join("users/alice/x.txt").exists());

        let outcome = service
            .assemble(&user("alice"), "users/alice/x.txt", br#"{"hashes": []}"#)
            .await
            .unwrap();
        assert!(matches!(outcome, AssembleOutcome::Created { size: 0, .. }));

        let digest = digest_bytes(b"p");
        assert!(matches!(
            service.packet_status(&user("alice"), digest.as_str()).await,
            Err(TransferError::AccessDenied(_))
        ));
        assert!(service
            .packet_status(&user("uploader"), digest.as_str())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_upload_sweeps_expired_packets() {
        let temp_dir = TempDir::new().unwrap();
        let (service, pool) = test_service(&temp_dir, 64).await;
        let alice = user("alice");

        let old = digest_bytes(b"old");
        service
            .upload_packet(&alice, old.as_str(), body(&[b"old"]))
            .await
            .unwrap();

        sqlx::query("UPDATE file_packets SET last_used_at = ? WHERE digest = ?")
            .bind(crate::db::timestamp(chrono::Utc::now() - chrono::Duration::hours(49)))
            .bind(old.as_str())
            .execute(&pool)
            .await
            .unwrap();

        // A failed upload still triggers the sweep
        let wrong = digest_bytes(b"right");
        let _ = service
            .upload_packet(&alice, wrong.as_str(), body(&[b"wrong"]))
            .await;

        let (_, status) = service.packet_status(&alice, old.as_str()).await.unwrap();
        assert_eq!(status, PacketStatus::Pending);
    }
}
