//! Request pipeline stages
//!
//! Ordered middleware applied to the transfer routes:
//!
//! 1. `identity_stage` - resolve the acting user or stop with 401
//! 2. `response_headers_stage` - cache and `Vary` headers on the way out
//!
//! A stage short-circuits by returning a response without calling `next`.

use axum::{
    extract::{FromRequestParts, Request, State},
    http::{
        header::{self, HeaderValue},
        request::Parts,
    },
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::state::AppState;
use crate::transfer::{Identity, TransferError};

/// Header reporting a packet's status on every packet response
pub const PACKET_STATUS_HEADER: &str = "x-file-packet-status";

/// Resolve the identity header into an [`Identity`] extension
pub async fn identity_stage(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let header_name = &state.config().server.identity_header;

    let identity = request
        .headers()
        .get(header_name.as_str())
        .and_then(|value| value.to_str().ok())
        .and_then(Identity::new);

    match identity {
        Some(identity) => {
            request.extensions_mut().insert(identity);
            next.run(request).await
        }
        None => {
            tracing::debug!(header = %header_name, path = %request.uri().path(), "Request without identity");
            TransferError::Unauthenticated.into_response()
        }
    }
}

/// Mark transfer responses as uncacheable and declare what they vary on
pub async fn response_headers_stage(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    if !headers.contains_key(header::CACHE_CONTROL) {
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    }

    let mut vary = vec![state.config().server.identity_header.clone()];
    if headers.contains_key(PACKET_STATUS_HEADER) {
        vary.push("X-File-Packet-Status".to_string());
    }
    if let Ok(value) = HeaderValue::from_str(&vary.join(", ")) {
        headers.append(header::VARY, value);
    }

    response
}

/// Extracts the identity that `identity_stage` injected into extensions
#[async_trait::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Identity {
    type Rejection = TransferError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Identity>()
            .cloned()
            .ok_or(TransferError::Unauthenticated)
    }
}
