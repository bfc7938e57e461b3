//! Error types for server bootstrap and persistence
//!
//! Request-level failures are reported through
//! [`TransferError`](crate::transfer::TransferError); this type covers what
//! happens before a request exists: database setup and rule seeding.

use thiserror::Error;

/// Application-wide result type
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid access rules: {0}")]
    Rules(String),
}
