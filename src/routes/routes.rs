//! Defines routes for the upload-session and streaming operations.
//!
//! ## Structure
//! - **Session endpoints**
//!   - `POST   /uploads` — create upload session
//!   - `GET    /uploads/{id}` — session snapshot
//!   - `DELETE /uploads/{id}` — cancel session
//!   - `POST   /uploads/{id}/pause` / `/resume` — transition requests
//!
//! - **Chunk + finalize endpoints**
//!   - `PUT    /uploads/{id}/chunks/{index}` — upload one chunk (raw body)
//!   - `POST   /uploads/{id}/finalize` — begin assembly (202, then poll)
//!   - `GET    /uploads/{id}/finalize` — assembly progress
//!
//! - **Streaming endpoints**
//!   - `GET/HEAD /uploads/{id}/content` — byte-range serving, pre- or
//!     post-assembly (redirects to the final object once it exists)
//!   - `GET    /blobs/{*key}` — download an assembled object

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        session_handlers::{
            cancel_session, create_session, finalize_session, finalize_status, get_session,
            pause_session, resume_session, upload_chunk,
        },
        stream_handlers::{download_blob, get_content, head_content},
    },
    services::AppState,
};
use axum::{
    Router,
    routing::{get, post, put},
};

/// Build and return the router for all upload routes.
///
/// The router carries shared state ([`AppState`]) to all handlers.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // Session lifecycle
        .route("/uploads", post(create_session))
        .route("/uploads/{id}", get(get_session).delete(cancel_session))
        .route("/uploads/{id}/pause", post(pause_session))
        .route("/uploads/{id}/resume", post(resume_session))
        // Chunks + finalize
        .route("/uploads/{id}/chunks/{index}", put(upload_chunk))
        .route(
            "/uploads/{id}/finalize",
            post(finalize_session).get(finalize_status),
        )
        // Streaming
        .route(
            "/uploads/{id}/content",
            get(get_content).head(head_content),
        )
        .route("/blobs/{*key}", get(download_blob))
}
