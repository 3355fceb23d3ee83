//! Recording request/response surface.
//!
//! - `POST /v1/recordings` - start an upload
//! - `PUT /v1/recordings/:upload_id/chunks` - append raw bytes
//! - `POST /v1/recordings/:upload_id/finalize` - commit and return the URL
//!
//! Every route requires `Authorization: Bearer <identity token>`.

use super::{ChunkReceipt, FinalizedRecording, RecordingIngestor, UploadStarted};
use crate::errors::RuntimeError;
use crate::gateway::IdentityVerifier;
use crate::observability::metrics as prom;

use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::HeaderMap;
use axum::routing::{post, put};
use axum::{Json, Router};
use bytes::Bytes;
use common::types::{SessionId, UploadId};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

pub struct RecordingApi {
    pub ingestor: Arc<RecordingIngestor>,
    pub verifier: Arc<IdentityVerifier>,
}

#[derive(Debug, Deserialize)]
pub struct InitRequest {
    pub session_id: SessionId,
    pub content_type: String,
}

pub fn router(state: Arc<RecordingApi>) -> Router {
    let chunk_limit = state.ingestor.settings().max_chunk_bytes;
    Router::new()
        .route("/v1/recordings", post(init_upload))
        .route(
            "/v1/recordings/:upload_id/chunks",
            put(append_chunk).layer(DefaultBodyLimit::max(chunk_limit)),
        )
        .route("/v1/recordings/:upload_id/finalize", post(finalize_upload))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn caller(state: &RecordingApi, headers: &HeaderMap) -> Result<String, RuntimeError> {
    state
        .verifier
        .authenticate(headers, None)
        .map(|identity| identity.subject)
}

async fn init_upload(
    State(state): State<Arc<RecordingApi>>,
    headers: HeaderMap,
    Json(request): Json<InitRequest>,
) -> Result<Json<UploadStarted>, RuntimeError> {
    let identity = caller(&state, &headers)?;
    state
        .ingestor
        .init(&identity, request.session_id, &request.content_type)
        .await
        .map(Json)
        .inspect_err(|e| prom::record_error("recording-init", e.error_code()))
}

async fn append_chunk(
    State(state): State<Arc<RecordingApi>>,
    Path(upload_id): Path<Uuid>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ChunkReceipt>, RuntimeError> {
    let identity = caller(&state, &headers)?;
    state
        .ingestor
        .chunk(&identity, UploadId(upload_id), body)
        .await
        .map(Json)
        .inspect_err(|e| prom::record_error("recording-chunk", e.error_code()))
}

async fn finalize_upload(
    State(state): State<Arc<RecordingApi>>,
    Path(upload_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<FinalizedRecording>, RuntimeError> {
    let identity = caller(&state, &headers)?;
    state
        .ingestor
        .finalize(&identity, UploadId(upload_id))
        .await
        .map(Json)
        .inspect_err(|e| prom::record_error("recording-finalize", e.error_code()))
}
