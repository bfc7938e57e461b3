//! File Packet Module
//!
//! Deduplicated, content-addressed chunk storage:
//! - Packets are keyed by the SHA-256 digest of their bytes
//! - Every commit re-hashes what reached the disk before it is trusted
//! - Unused packets are evicted after a TTL
//!
//! Status lifecycle: `NEW -> FAILED <-> NEW (retry) -> STORED`.

pub mod store;
pub mod types;

pub use store::{PacketReader, PacketStore, PacketWriter};
pub use types::*;
