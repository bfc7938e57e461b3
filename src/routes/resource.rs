//! Resource dispatch
//!
//! Each transfer resource implements [`Resource`]; [`route`] turns it into
//! an axum method table. Methods a resource does not override answer 405.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{FromRequest, FromRequestParts, Path, Request},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, MethodRouter},
};

use crate::state::AppState;
use crate::transfer::Identity;

/// Everything a resource handler receives
pub struct RequestContext {
    pub state: AppState,
    pub identity: Identity,
    /// The single path parameter (digest or file path)
    pub param: String,
    pub body: Body,
}

#[async_trait::async_trait]
impl FromRequest<AppState> for RequestContext {
    type Rejection = Response;

    async fn from_request(request: Request, state: &AppState) -> Result<Self, Self::Rejection> {
        let (mut parts, body) = request.into_parts();

        let identity = Identity::from_request_parts(&mut parts, state)
            .await
            .map_err(IntoResponse::into_response)?;
        let Path(param) = Path::<String>::from_request_parts(&mut parts, state)
            .await
            .map_err(IntoResponse::into_response)?;

        Ok(Self {
            state: state.clone(),
            identity,
            param,
            body,
        })
    }
}

/// Capability set of a transfer resource
#[async_trait::async_trait]
pub trait Resource: Send + Sync + 'static {
    async fn handle_get(&self, _ctx: RequestContext) -> Response {
        method_not_allowed()
    }

    async fn handle_head(&self, _ctx: RequestContext) -> Response {
        method_not_allowed()
    }

    async fn handle_post(&self, _ctx: RequestContext) -> Response {
        method_not_allowed()
    }
}

/// Build the method table for a resource
pub fn route<R: Resource>(resource: R) -> MethodRouter<AppState> {
    let resource = Arc::new(resource);
    let (for_get, for_head, for_post) = (resource.clone(), resource.clone(), resource);

    get(move |ctx: RequestContext| async move { for_get.handle_get(ctx).await })
        .head(move |ctx: RequestContext| async move { for_head.handle_head(ctx).await })
        .post(move |ctx: RequestContext| async move { for_post.handle_post(ctx).await })
}

fn method_not_allowed() -> Response {
    StatusCode::METHOD_NOT_ALLOWED.into_response()
}
