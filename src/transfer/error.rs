//! Request-level errors and their HTTP mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::access::{AccessError, Denial};
use crate::hasher::{Digest, InvalidDigest};
use crate::ledger::LedgerError;
use crate::packets::PacketError;
use crate::paths::PathError;

/// Transfer error types
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("{0}")]
    ClientInput(String),

    #[error("Missing user identity")]
    Unauthenticated,

    #[error("Access denied: {0}")]
    AccessDenied(Denial),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Digest mismatch: expected {expected}, got {actual}")]
    IntegrityFailure {
        expected: Digest,
        actual: Digest,
        payload: Option<String>,
    },

    #[error("Packet exceeds the maximum size of {limit} bytes")]
    TooLarge { limit: u64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TransferError {
    /// Get HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::ClientInput(_) => StatusCode::BAD_REQUEST,
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::AccessDenied(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::BAD_REQUEST,
            Self::IntegrityFailure { .. } => StatusCode::BAD_REQUEST,
            Self::TooLarge { .. } => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::ClientInput(_) => "CLIENT_INPUT",
            Self::Unauthenticated => "UNAUTHENTICATED",
            Self::AccessDenied(_) => "ACCESS_DENIED",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::IntegrityFailure { .. } => "INTEGRITY_FAILURE",
            Self::TooLarge { .. } => "TOO_LARGE",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the caller got far enough to see packet state
    pub fn reveals_packet(&self) -> bool {
        !matches!(self, Self::Unauthenticated | Self::AccessDenied(_))
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<String>,
}

impl IntoResponse for TransferError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let error = match &self {
            // Details stay in the log
            Self::Internal(detail) => {
                tracing::error!(error = %detail, "Transfer request failed");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };
        let payload = match &self {
            Self::IntegrityFailure { payload, .. } => payload.clone(),
            _ => None,
        };

        let body = Json(ErrorResponse {
            error,
            code: self.code(),
            payload,
        });

        (status, body).into_response()
    }
}

// ============================================================================
// Conversions
// ============================================================================

impl From<PacketError> for TransferError {
    fn from(e: PacketError) -> Self {
        match e {
            PacketError::AlreadyStored(_) => Self::Conflict(e.to_string()),
            PacketError::DigestMismatch {
                expected,
                actual,
                payload,
            } => Self::IntegrityFailure {
                expected,
                actual,
                payload,
            },
            PacketError::TooLarge { limit, .. } => Self::TooLarge { limit },
            PacketError::NotFound(_) | PacketError::NotStored { .. } => Self::NotFound(e.to_string()),
            PacketError::Corrupt { .. }
            | PacketError::InvalidRecord(_)
            | PacketError::Io(_)
            | PacketError::Database(_) => Self::Internal(e.to_string()),
        }
    }
}

impl From<LedgerError> for TransferError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::AlreadyExists(_) => Self::Conflict(e.to_string()),
            LedgerError::NotFound(_) => Self::NotFound(e.to_string()),
            LedgerError::NotAFile(_) | LedgerError::Malformed(_) => Self::ClientInput(e.to_string()),
            LedgerError::Packet(inner) => inner.into(),
            LedgerError::Io(_) => Self::Internal(e.to_string()),
        }
    }
}

impl From<AccessError> for TransferError {
    fn from(e: AccessError) -> Self {
        match e {
            AccessError::Denied(denial) => Self::AccessDenied(denial),
            AccessError::InvalidRule { .. } | AccessError::Database(_) => Self::Internal(e.to_string()),
        }
    }
}

impl From<PathError> for TransferError {
    fn from(e: PathError) -> Self {
        Self::ClientInput(e.to_string())
    }
}

impl From<InvalidDigest> for TransferError {
    fn from(e: InvalidDigest) -> Self {
        Self::ClientInput(e.to_string())
    }
}
