//! Inbound RPC handlers.
//!
//! Every handler delegates straight to this node's LOCAL backing adapter.
//! Handlers never re-enter the replication coordinator: an inbound write
//! lands in local storage and nothing else, which is how the distributed
//! cache bottoms out without recursive replication.

use super::{
    BlobQuery, ContainsMultiRequest, ContainsMultiResponse, GetMultiRequest, GetMultiResponse,
    DEADLINE_HEADER, IDENTITY_HEADER,
};
use crate::backing::BlobCache;
use crate::coordinator::Lifecycle;
use crate::error::MeshError;
use crate::types::{Digest, RequestContext};
use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::io::ReaderStream;

/// Shared state of the inbound RPC surface.
#[derive(Clone)]
pub struct RpcState {
    backing: Arc<dyn BlobCache>,
    lifecycle: Arc<Lifecycle>,
}

impl RpcState {
    pub fn new(backing: Arc<dyn BlobCache>, lifecycle: Arc<Lifecycle>) -> Self {
        Self { backing, lifecycle }
    }
}

/// Build the inbound router for one node.
pub fn router(state: RpcState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route(
            "/blob/:hash",
            get(handle_read).put(handle_write).delete(handle_delete),
        )
        .route("/contains/:hash", get(handle_contains))
        .route("/blobs/contains", post(handle_contains_multi))
        .route("/blobs/fetch", post(handle_get_multi))
        .with_state(state)
}

type HandlerError = (StatusCode, String);

fn error_response(e: MeshError) -> HandlerError {
    let status = match &e {
        MeshError::NotFound(_) => StatusCode::NOT_FOUND,
        MeshError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        MeshError::DeadlineExceeded => StatusCode::REQUEST_TIMEOUT,
        MeshError::InvalidConfig { .. } => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

fn ensure_listening(state: &RpcState) -> Result<(), HandlerError> {
    if state.lifecycle.is_listening() {
        Ok(())
    } else {
        Err(error_response(MeshError::ShuttingDown))
    }
}

/// Rebuild the caller's context from the propagation headers.
fn context_from_headers(headers: &HeaderMap) -> RequestContext {
    let mut ctx = match headers.get(IDENTITY_HEADER).and_then(|v| v.to_str().ok()) {
        Some(identity) => RequestContext::with_identity(identity),
        None => RequestContext::anonymous(),
    };

    if let Some(remaining_ms) = headers
        .get(DEADLINE_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
    {
        ctx = ctx.with_timeout(Duration::from_millis(remaining_ms));
    }

    ctx
}

async fn handle_health(State(state): State<RpcState>) -> Response {
    if state.lifecycle.is_listening() {
        (StatusCode::OK, "OK").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

async fn handle_read(
    State(state): State<RpcState>,
    Path(hash): Path<String>,
    Query(query): Query<BlobQuery>,
    headers: HeaderMap,
) -> Result<Response, HandlerError> {
    ensure_listening(&state)?;
    let ctx = context_from_headers(&headers);
    let digest = Digest::new(hash, query.size);

    let reader = state
        .backing
        .read(&ctx, &digest, query.offset)
        .await
        .map_err(error_response)?;

    Ok(Body::from_stream(ReaderStream::new(reader)).into_response())
}

async fn handle_write(
    State(state): State<RpcState>,
    Path(hash): Path<String>,
    Query(query): Query<BlobQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, HandlerError> {
    ensure_listening(&state)?;
    let ctx = context_from_headers(&headers);
    let size = if query.size > 0 {
        query.size
    } else {
        body.len() as u64
    };
    let digest = Digest::new(hash, size);

    state
        .backing
        .write(&ctx, &digest, body)
        .await
        .map_err(error_response)?;

    Ok(StatusCode::NO_CONTENT)
}

async fn handle_delete(
    State(state): State<RpcState>,
    Path(hash): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, HandlerError> {
    ensure_listening(&state)?;
    let ctx = context_from_headers(&headers);
    let digest = Digest::new(hash, 0);

    state
        .backing
        .delete(&ctx, &digest)
        .await
        .map_err(error_response)?;

    Ok(StatusCode::NO_CONTENT)
}

async fn handle_contains(
    State(state): State<RpcState>,
    Path(hash): Path<String>,
    Query(query): Query<BlobQuery>,
    headers: HeaderMap,
) -> Result<Json<bool>, HandlerError> {
    ensure_listening(&state)?;
    let ctx = context_from_headers(&headers);
    let digest = Digest::new(hash, query.size);

    let present = state
        .backing
        .contains(&ctx, &digest)
        .await
        .map_err(error_response)?;

    Ok(Json(present))
}

async fn handle_contains_multi(
    State(state): State<RpcState>,
    headers: HeaderMap,
    Json(request): Json<ContainsMultiRequest>,
) -> Result<Json<ContainsMultiResponse>, HandlerError> {
    ensure_listening(&state)?;
    let ctx = context_from_headers(&headers);

    let found = state
        .backing
        .contains_multi(&ctx, &request.digests)
        .await
        .map_err(error_response)?;

    let found = found
        .into_iter()
        .map(|(digest, present)| (digest.hash().to_string(), present))
        .collect();

    Ok(Json(ContainsMultiResponse { found }))
}

async fn handle_get_multi(
    State(state): State<RpcState>,
    headers: HeaderMap,
    Json(request): Json<GetMultiRequest>,
) -> Result<Json<GetMultiResponse>, HandlerError> {
    ensure_listening(&state)?;
    let ctx = context_from_headers(&headers);

    let blobs = state
        .backing
        .get_multi(&ctx, &request.digests)
        .await
        .map_err(error_response)?;

    let blobs: HashMap<String, String> = blobs
        .into_iter()
        .map(|(digest, data)| (digest.hash().to_string(), BASE64.encode(&data)))
        .collect();

    Ok(Json(GetMultiResponse { blobs }))
}
