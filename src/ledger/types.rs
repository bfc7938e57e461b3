//! Ledger types

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::hasher::Digest;
use crate::packets::{PacketError, PacketStatus};
use crate::paths::SafePath;

// ============================================================================
// Requests
// ============================================================================

/// Body of an assembly request
#[derive(Debug, Clone, Deserialize)]
pub struct HashesRequest {
    /// Packet digests in file order
    pub hashes: Vec<Digest>,
}

/// Parse an assembly request body
pub fn parse_hashes(body: &[u8]) -> Result<Vec<Digest>, LedgerError> {
    serde_json::from_slice::<HashesRequest>(body)
        .map(|request| request.hashes)
        .map_err(|e| LedgerError::Malformed(e.to_string()))
}

// ============================================================================
// Responses
// ============================================================================

/// One chunk of an existing file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanEntry {
    pub index: usize,
    pub offset: u64,
    pub length: u64,
    pub digest: Digest,
    pub status: PacketStatus,
}

/// Classification of a client's digests against the packet store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerReport {
    /// Status of every requested digest, in request order
    pub statuses: Vec<(Digest, PacketStatus)>,

    /// Digests not yet stored, once each, in first-seen order
    pub missing: Vec<Digest>,
}

impl LedgerReport {
    pub fn new(statuses: Vec<(Digest, PacketStatus)>) -> Self {
        let missing = {
            let mut seen: HashSet<&Digest> = HashSet::new();
            statuses
                .iter()
                .filter(|(digest, status)| !status.is_stored() && seen.insert(digest))
                .map(|(digest, _)| digest.clone())
                .collect()
        };
        Self { statuses, missing }
    }

    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }

    /// `{digest: status}` for the digests still missing
    pub fn missing_statuses(&self) -> BTreeMap<Digest, PacketStatus> {
        self.statuses
            .iter()
            .filter(|(_, status)| !status.is_stored())
            .cloned()
            .collect()
    }
}

/// Result of an assembly request that did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssembleOutcome {
    /// The file now exists
    Created { path: SafePath, size: u64 },

    /// Some packets are not stored yet; upload them and retry
    Incomplete(LedgerReport),
}

// ============================================================================
// Error Types
// ============================================================================

/// Ledger error types
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("File already exists: {0}")]
    AlreadyExists(SafePath),

    #[error("File not found: {0}")]
    NotFound(SafePath),

    #[error("Not a regular file: {0}")]
    NotAFile(SafePath),

    #[error("Malformed ledger request: {0}")]
    Malformed(String),

    #[error(transparent)]
    Packet(#[from] PacketError),

    #[error("Storage error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::digest_bytes;

    #[test]
    fn test_parse_hashes() {
        let a = digest_bytes(b"a");
        let body = format!(r#"{{"hashes": ["{a}"]}}"#);
        assert_eq!(parse_hashes(body.as_bytes()).unwrap(), vec![a]);
        assert!(parse_hashes(br#"{"hashes": []}"#).unwrap().is_empty());
    }

    #[test]
    fn test_parse_hashes_rejects_malformed() {
        let bodies: [&[u8]; 6] = [
            b"",
            b"not json",
            br#"{}"#,
            br#"{"hashes": "abc"}"#,
            br#"{"hashes": ["not-a-digest"]}"#,
            br#"["a", "b"]"#,
        ];
        for body in bodies {
            assert!(matches!(parse_hashes(body), Err(LedgerError::Malformed(_))));
        }
    }

    #[test]
    fn test_report_missing_is_deduplicated() {
        let a = digest_bytes(b"a");
        let b = digest_bytes(b"b");
        let report = LedgerReport::new(vec![
            (a.clone(), PacketStatus::Pending),
            (b.clone(), PacketStatus::Stored),
            (a.clone(), PacketStatus::Pending),
        ]);

        assert!(!report.is_complete());
        assert_eq!(report.missing, vec![a.clone()]);
        assert_eq!(report.missing_statuses().len(), 1);
        assert_eq!(report.missing_statuses()[&a], PacketStatus::Pending);
    }

    #[test]
    fn test_report_scales_with_many_distinct_missing() {
        let statuses: Vec<_> = (0..100_000u32)
            .map(|i| (digest_bytes(&i.to_le_bytes()), PacketStatus::Pending))
            .collect();

        let started = std::time::Instant::now();
        let report = LedgerReport::new(statuses);
        assert_eq!(report.missing.len(), 100_000);
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
    }
}
