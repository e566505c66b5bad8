//! HTTP handlers for upload-session lifecycle and chunk ingest.
//! Chunk bodies are raw bytes — a chunk is opaque, so there is no form
//! decoding here — and storage concerns are delegated to the services.

use crate::{
    errors::AppError,
    models::UploadSession,
    services::{AppState, NewSession},
};
use axum::{
    Json,
    body::Body,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Request body for `POST /uploads`.
#[derive(Debug, Deserialize)]
pub struct CreateSessionReq {
    pub owner_id: String,
    pub filename: String,
    pub mime_type: String,
    pub file_size_bytes: i64,
    /// Optional override; the server default applies when omitted.
    pub chunk_size_bytes: Option<i64>,
}

/// Session snapshot returned by create/get/pause/resume.
#[derive(Debug, Serialize)]
pub struct SessionResponse {
    #[serde(flatten)]
    pub session: UploadSession,
    pub received_chunks: i64,
}

/// Acknowledgement for one accepted chunk.
#[derive(Debug, Serialize)]
pub struct ChunkAccepted {
    pub session_id: String,
    pub chunk_index: u64,
    pub received_chunks: i64,
    pub total_chunks: i64,
}

/// POST `/uploads` — create an upload session.
pub async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionReq>,
) -> Result<impl IntoResponse, AppError> {
    let chunk_size = req
        .chunk_size_bytes
        .unwrap_or(state.default_chunk_size_bytes as i64);
    let session = state
        .sessions
        .create(NewSession {
            owner_id: req.owner_id,
            filename: req.filename,
            mime_type: req.mime_type,
            file_size_bytes: req.file_size_bytes,
            chunk_size_bytes: chunk_size,
        })
        .await?;

    let body = SessionResponse {
        session,
        received_chunks: 0,
    };
    Ok((StatusCode::CREATED, Json(body)))
}

/// GET `/uploads/{id}` — session snapshot.
pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionResponse>, AppError> {
    let session = state.sessions.fetch_current(&id).await?;
    let received_chunks = state.sessions.received_count(&id).await?;
    Ok(Json(SessionResponse {
        session,
        received_chunks,
    }))
}

/// PUT `/uploads/{id}/chunks/{index}` — raw-body chunk upload.
///
/// Idempotent: re-sending an index overwrites the stored bytes and leaves
/// the received set unchanged.
pub async fn upload_chunk(
    State(state): State<AppState>,
    Path((id, index)): Path<(String, u64)>,
    body: Body,
) -> Result<Json<ChunkAccepted>, AppError> {
    let session = state.sessions.fetch_current(&id).await?;
    state.sessions.ensure_uploadable(&session)?;

    // No chunk may exceed the session's chunk size; the limit also bounds
    // what a misbehaving client can make us buffer.
    let limit = session.chunk_size_bytes.max(0) as usize;
    let bytes = axum::body::to_bytes(body, limit)
        .await
        .map_err(|err| AppError::new(StatusCode::BAD_REQUEST, format!("unreadable chunk body: {err}")))?;

    let size_bytes = bytes.len() as i64;
    let outcome = state
        .chunks
        .put(&session.id, session.total_chunks, index, bytes)
        .await?;
    let received_chunks = state
        .sessions
        .record_chunk_received(&session, index, &outcome.key, size_bytes)
        .await?;

    Ok(Json(ChunkAccepted {
        session_id: session.id,
        chunk_index: index,
        received_chunks,
        total_chunks: session.total_chunks,
    }))
}

/// POST `/uploads/{id}/pause`
pub async fn pause_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionResponse>, AppError> {
    let session = state.sessions.pause(&id).await?;
    let received_chunks = state.sessions.received_count(&id).await?;
    Ok(Json(SessionResponse {
        session,
        received_chunks,
    }))
}

/// POST `/uploads/{id}/resume`
pub async fn resume_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionResponse>, AppError> {
    let session = state.sessions.resume(&id).await?;
    let received_chunks = state.sessions.received_count(&id).await?;
    Ok(Json(SessionResponse {
        session,
        received_chunks,
    }))
}

/// POST `/uploads/{id}/finalize` — begin (or observe) assembly.
///
/// Returns 202: assembly of a large file runs for minutes, so the client
/// polls `GET /uploads/{id}/finalize` rather than holding this request open.
pub async fn finalize_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let status = state.assembly.start(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(status)).into_response())
}

/// GET `/uploads/{id}/finalize` — assembly progress.
pub async fn finalize_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let status = state.sessions.finalize_status(&id).await?;
    Ok(Json(status).into_response())
}

/// DELETE `/uploads/{id}` — cancel a session.
///
/// The session becomes permanently non-resumable; chunk payloads are
/// reclaimed in the background, best-effort.
pub async fn cancel_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let session = state.sessions.cancel(&id).await?;
    info!(session_id = %session.id, "session cancelled");

    let chunks = state.chunks.clone();
    tokio::spawn(async move {
        chunks.delete_all(&session.id, session.total_chunks).await;
    });

    Ok(StatusCode::NO_CONTENT)
}
