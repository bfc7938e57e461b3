//! Packet types

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::hasher::Digest;

// ============================================================================
// Constants
// ============================================================================

/// Mismatched payloads up to this size are echoed back in the error
pub const SMALL_PAYLOAD_LIMIT: u64 = 1024;

// ============================================================================
// Status
// ============================================================================

/// Packet status
///
/// `Pending` is only ever reported for digests without a record; it is
/// never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PacketStatus {
    /// Upload started, bytes not yet verified
    New,
    /// Last upload failed or did not verify; may be retried
    Failed,
    /// No record exists
    Pending,
    /// Bytes verified against the digest
    Stored,
}

impl PacketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Failed => "FAILED",
            Self::Pending => "PENDING",
            Self::Stored => "STORED",
        }
    }

    pub fn is_stored(&self) -> bool {
        matches!(self, Self::Stored)
    }
}

impl fmt::Display for PacketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PacketStatus {
    type Err = PacketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(Self::New),
            "FAILED" => Ok(Self::Failed),
            "PENDING" => Ok(Self::Pending),
            "STORED" => Ok(Self::Stored),
            other => Err(PacketError::InvalidRecord(format!("unknown status {other:?}"))),
        }
    }
}

// ============================================================================
// Records
// ============================================================================

/// Row as stored in `file_packets`
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct PacketRow {
    pub digest: String,
    pub storage_ref: Option<String>,
    pub status: String,
    pub size: i64,
    pub created_at: String,
    pub last_used_at: String,
}

/// One stored (or in-flight) packet
#[derive(Debug, Clone, Serialize)]
pub struct PacketRecord {
    pub digest: Digest,

    /// Location of the bytes relative to the packet root
    pub storage_ref: Option<String>,

    pub status: PacketStatus,

    /// Verified size in bytes (0 until stored)
    pub size: u64,

    pub created_at: DateTime<Utc>,

    pub last_used_at: DateTime<Utc>,
}

impl TryFrom<PacketRow> for PacketRecord {
    type Error = PacketError;

    fn try_from(row: PacketRow) -> Result<Self, Self::Error> {
        Ok(Self {
            digest: row
                .digest
                .parse()
                .map_err(|e: crate::hasher::InvalidDigest| PacketError::InvalidRecord(e.to_string()))?,
            storage_ref: row.storage_ref,
            status: row.status.parse()?,
            size: u64::try_from(row.size)
                .map_err(|_| PacketError::InvalidRecord(format!("negative size {}", row.size)))?,
            created_at: parse_timestamp(&row.created_at)?,
            last_used_at: parse_timestamp(&row.last_used_at)?,
        })
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, PacketError> {
    DateTime::parse_from_rfc3339(value)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| PacketError::InvalidRecord(format!("bad timestamp {value:?}: {e}")))
}

// ============================================================================
// Error Types
// ============================================================================

/// Packet store error types
#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("Packet {0} is already stored")]
    AlreadyStored(Digest),

    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        expected: Digest,
        actual: Digest,
        /// Offending payload, kept only for small uploads
        payload: Option<String>,
    },

    #[error("Packet {digest} exceeds the maximum packet size of {limit} bytes")]
    TooLarge { digest: Digest, limit: u64 },

    #[error("Packet not found: {0}")]
    NotFound(Digest),

    #[error("Packet {digest} is not stored (status {status})")]
    NotStored { digest: Digest, status: PacketStatus },

    #[error("Packet {digest} is corrupt: {reason}")]
    Corrupt { digest: Digest, reason: String },

    #[error("Invalid packet record: {0}")]
    InvalidRecord(String),

    #[error("Storage error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}
