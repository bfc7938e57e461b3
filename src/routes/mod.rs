//! Route modules for FFS Server
//!
//! Transfer routes are served at the root and, for older clients, under
//! `/private/ffs`.

pub mod file_ledger;
pub mod file_packet;
pub mod health;
pub mod pipeline;
pub mod resource;

use axum::{middleware::from_fn_with_state, routing::get, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;
use file_ledger::FileLedgerResource;
use file_packet::FilePacketResource;

/// Prefix existing clients still call
pub const LEGACY_PREFIX: &str = "/private/ffs";

/// Build the application router
pub fn app(state: AppState) -> Router {
    let transfer = transfer_router(state.clone());

    // Build CORS layer
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([axum::http::HeaderName::from_static(pipeline::PACKET_STATUS_HEADER)]);

    Router::new()
        .route("/health", get(health::health_check))
        .merge(transfer.clone())
        .nest(LEGACY_PREFIX, transfer)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Transfer resources behind the request pipeline
fn transfer_router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/file-packet/:digest", resource::route(FilePacketResource))
        .route("/file-ledger/*path", resource::route(FileLedgerResource))
        .layer(from_fn_with_state(state.clone(), pipeline::response_headers_stage))
        .layer(from_fn_with_state(state, pipeline::identity_stage))
}
