//! File Ledger Routes
//!
//! Endpoints:
//! - GET /file-ledger/*path - `{digest: status}` for an existing file
//! - POST /file-ledger/*path - Assemble a file from `{"hashes": [...]}`
//!
//! Assembly answers 202 with the missing `{digest: status}` while packets
//! are outstanding, and 200 once the file exists.

use std::collections::BTreeMap;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use super::resource::{RequestContext, Resource};
use crate::hasher::Digest;
use crate::ledger::AssembleOutcome;
use crate::packets::PacketStatus;
use crate::transfer::TransferError;

/// Largest accepted assembly request body
pub const MAX_LEDGER_BODY: usize = 16 * 1024 * 1024;

/// `/file-ledger/*path`
pub struct FileLedgerResource;

#[derive(Serialize)]
struct CreatedResponse {
    path: String,
    size: u64,
}

#[async_trait::async_trait]
impl Resource for FileLedgerResource {
    async fn handle_get(&self, ctx: RequestContext) -> Response {
        let transfer = ctx.state.transfer();

        match transfer.ledger_plan(&ctx.identity, &ctx.param).await {
            Ok(plan) => {
                let statuses: BTreeMap<Digest, PacketStatus> =
                    plan.into_iter().map(|entry| (entry.digest, entry.status)).collect();
                Json(statuses).into_response()
            }
            Err(e) => e.into_response(),
        }
    }

    async fn handle_post(&self, ctx: RequestContext) -> Response {
        let body = match axum::body::to_bytes(ctx.body, MAX_LEDGER_BODY).await {
            Ok(body) => body,
            Err(e) => {
                return TransferError::ClientInput(format!("Could not read request body: {e}")).into_response();
            }
        };

        let transfer = ctx.state.transfer();
        match transfer.assemble(&ctx.identity, &ctx.param, &body).await {
            Ok(AssembleOutcome::Created { path, size }) => (
                StatusCode::OK,
                Json(CreatedResponse {
                    path: path.to_string(),
                    size,
                }),
            )
                .into_response(),
            Ok(AssembleOutcome::Incomplete(report)) => {
                (StatusCode::ACCEPTED, Json(report.missing_statuses())).into_response()
            }
            Err(e) => e.into_response(),
        }
    }
}
