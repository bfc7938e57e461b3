//! Content Hashing
//!
//! SHA-256 digests for packets and whole files. Files are read sequentially
//! through one reusable buffer, so memory stays bounded no matter how large
//! the file or the hashing window is.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use tokio::fs::File;
use tokio::io::AsyncReadExt;

/// Read buffer size used while hashing
pub const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Hex length of a SHA-256 digest
pub const DIGEST_HEX_LEN: usize = 64;

// ============================================================================
// Digest
// ============================================================================

/// Lowercase hex SHA-256 digest, the key of every packet
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

/// Rejected digest text
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid digest {value:?}: expected {DIGEST_HEX_LEN} hex characters")]
pub struct InvalidDigest {
    pub value: String,
}

impl Digest {
    /// Digest of an in-memory byte slice
    pub fn of(data: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(data)))
    }

    fn from_hasher(hasher: Sha256) -> Self {
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Digest {
    type Err = InvalidDigest;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != DIGEST_HEX_LEN || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(InvalidDigest {
                value: s.to_string(),
            });
        }
        Ok(Self(s.to_ascii_lowercase()))
    }
}

impl TryFrom<String> for Digest {
    type Error = InvalidDigest;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Digest {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Chunk Hasher
// ============================================================================

/// Digest of one window of a file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDigest {
    /// Position of the window in the file
    pub index: usize,

    /// Byte offset of the window start
    pub offset: u64,

    /// Window length (shorter than the window size only for the last one)
    pub length: u64,

    pub digest: Digest,
}

/// Splits a file into fixed-size, non-overlapping windows and digests each
pub struct ChunkHasher {
    window: u64,
    buffer: Vec<u8>,
}

impl ChunkHasher {
    /// Create a hasher for the given window size in bytes
    ///
    /// # Panics
    ///
    /// Panics if `window` is zero.
    pub fn new(window: usize) -> Self {
        assert!(window > 0, "hashing window must be non-zero");
        Self {
            window: window as u64,
            buffer: vec![0u8; READ_BUFFER_SIZE],
        }
    }

    /// Number of windows a file of `file_size` bytes splits into
    pub fn chunk_count(&self, file_size: u64) -> u64 {
        file_size.div_ceil(self.window)
    }

    /// Digest every window of the file at `path`
    ///
    /// An empty file has no windows. The first I/O error aborts the pass.
    pub async fn hash_chunks(&mut self, path: &Path) -> std::io::Result<Vec<ChunkDigest>> {
        let mut file = File::open(path).await?;
        let size = file.metadata().await?.len();

        let mut chunks = Vec::with_capacity(self.chunk_count(size) as usize);
        let mut offset = 0u64;

        loop {
            let (digest, length) = self.hash_window(&mut file).await?;
            if length == 0 {
                break;
            }
            chunks.push(ChunkDigest {
                index: chunks.len(),
                offset,
                length,
                digest,
            });
            offset += length;
            if length < self.window {
                break;
            }
        }

        Ok(chunks)
    }

    /// Hash up to one window from the current file position
    async fn hash_window(&mut self, file: &mut File) -> std::io::Result<(Digest, u64)> {
        let mut hasher = Sha256::new();
        let mut length = 0u64;

        while length < self.window {
            let want = (self.window - length).min(self.buffer.len() as u64) as usize;
            let read = file.read(&mut self.buffer[..want]).await?;
            if read == 0 {
                break;
            }
            hasher.update(&self.buffer[..read]);
            length += read as u64;
        }

        Ok((Digest::from_hasher(hasher), length))
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Compute the SHA-256 digest of a whole file, streaming it from disk
pub async fn digest_file(path: &Path) -> std::io::Result<(Digest, u64)> {
    let mut file = File::open(path).await?;
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    let mut hasher = Sha256::new();
    let mut size = 0u64;

    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        size += read as u64;
    }

    Ok((Digest::from_hasher(hasher), size))
}

/// Compute the SHA-256 digest of data
pub fn digest_bytes(data: &[u8]) -> Digest {
    Digest::of(data)
}

// ============================================================================
// Tests
// ============================================================================
