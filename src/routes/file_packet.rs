//! File Packet Routes
//!
//! Endpoints:
//! - GET /file-packet/:digest - Packet bytes when stored
//! - HEAD /file-packet/:digest - Packet status only
//! - POST /file-packet/:digest - Upload packet bytes (raw body)
//!
//! Every response, errors included, reports the packet's current status in
//! `X-File-Packet-Status`. Callers stopped by the access check see `PENDING`.

use axum::{
    body::Body,
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use super::pipeline::PACKET_STATUS_HEADER;
use super::resource::{RequestContext, Resource};
use crate::hasher::Digest;
use crate::packets::PacketStatus;
use crate::state::AppState;

/// `/file-packet/:digest`
pub struct FilePacketResource;

#[derive(Serialize)]
struct PacketUploadResponse {
    digest: Digest,
    status: PacketStatus,
    size: u64,
}

#[async_trait::async_trait]
impl Resource for FilePacketResource {
    async fn handle_get(&self, ctx: RequestContext) -> Response {
        let transfer = ctx.state.transfer();

        let (response, visible) = match transfer.read_packet(&ctx.identity, &ctx.param).await {
            Ok(reader) => {
                let size = reader.size;
                let response = (
                    [
                        (header::CONTENT_TYPE, "application/octet-stream".to_string()),
                        (header::CONTENT_LENGTH, size.to_string()),
                    ],
                    Body::from_stream(reader.into_stream()),
                )
                    .into_response();
                (response, true)
            }
            Err(e) => {
                let visible = e.reveals_packet();
                (e.into_response(), visible)
            }
        };

        with_status(&ctx.state, &ctx.param, visible, response).await
    }

    async fn handle_head(&self, ctx: RequestContext) -> Response {
        let transfer = ctx.state.transfer();

        match transfer.packet_status(&ctx.identity, &ctx.param).await {
            Ok((_, status)) => status_header(StatusCode::OK.into_response(), status),
            Err(e) => {
                let visible = e.reveals_packet();
                with_status(&ctx.state, &ctx.param, visible, e.status_code().into_response()).await
            }
        }
    }

    async fn handle_post(&self, ctx: RequestContext) -> Response {
        let transfer = ctx.state.transfer();
        let body = ctx.body.into_data_stream();

        match transfer.upload_packet(&ctx.identity, &ctx.param, body).await {
            Ok(record) => {
                let status = record.status;
                let response = Json(PacketUploadResponse {
                    digest: record.digest,
                    status: record.status,
                    size: record.size,
                })
                .into_response();
                status_header(response, status)
            }
            Err(e) => {
                let visible = e.reveals_packet();
                with_status(&ctx.state, &ctx.param, visible, e.into_response()).await
            }
        }
    }
}

/// Attach the packet's current status to a response
///
/// Requests that never got past the access check, and unparseable digests,
/// report `PENDING`.
async fn with_status(state: &AppState, raw_digest: &str, visible: bool, response: Response) -> Response {
    let status = match raw_digest.parse::<Digest>() {
        Ok(digest) if visible => match state.transfer().packets().status(&digest).await {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(digest = %digest, error = %e, "Could not look up packet status");
                return response;
            }
        },
        _ => PacketStatus::Pending,
    };

    status_header(response, status)
}

fn status_header(mut response: Response, status: PacketStatus) -> Response {
    response
        .headers_mut()
        .insert(PACKET_STATUS_HEADER, HeaderValue::from_static(status.as_str()));
    response
}
