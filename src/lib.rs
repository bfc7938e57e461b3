//! FFS Server Library
//!
//! Content-addressed file transfer: clients upload only the chunks the
//! server does not already hold, then ask for the file to be assembled.
//! The main server binary is in main.rs.
//!
//! # Modules
//!
//! - `hasher`: SHA-256 digests of whole files and fixed-size windows
//! - `packets`: content-addressed chunk store with status tracking and TTL eviction
//! - `ledger`: per-path plan/assemble protocol over the packet store
//! - `access`: ordered, username-templated path rules
//! - `transfer`: orchestration of the above behind path and access checks
//! - `routes`: HTTP surface

pub mod access;
pub mod config;
pub mod db;
pub mod error;
pub mod hasher;
pub mod ledger;
pub mod locks;
pub mod packets;
pub mod paths;
pub mod routes;
pub mod state;
pub mod transfer;
