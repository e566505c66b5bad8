//! Service layer: session lifecycle, chunk storage, and assembly.
//!
//! Everything here is usable without the HTTP layer; handlers are thin
//! translations on top of these services.

pub mod assembly;
pub mod chunk_store;
pub mod session_service;

pub use assembly::{
    AssemblyConfig, AssemblyPipeline, FileRecord, LoggingRecordCreator, RecordCreator,
};
pub use chunk_store::{ChunkStore, chunk_key};
pub use session_service::{NewSession, SessionService};

use crate::models::SessionStatus;
use crate::storage::{BlobError, BlobStore};
use sqlx::SqlitePool;
use std::{path::PathBuf, sync::Arc};
use thiserror::Error;

/// Error taxonomy of the upload core.
///
/// The split matters to callers: `SessionNotFound`, `SessionExpired`,
/// `InvalidTransition`, `IncompleteUpload`, and `ChunkIndexOutOfRange` are
/// permanent (retrying the same request cannot succeed), while `Blob`,
/// `Sqlx`, and `ChunkNotAvailable` may clear up on retry.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("upload session `{0}` not found")]
    SessionNotFound(String),
    #[error("upload session `{0}` is expired")]
    SessionExpired(String),
    #[error("session `{id}`: cannot {action} while {status}")]
    InvalidTransition {
        id: String,
        status: SessionStatus,
        action: &'static str,
    },
    #[error("session `{id}` incomplete: {received} of {total} chunks received")]
    IncompleteUpload { id: String, received: i64, total: i64 },
    #[error("chunk index {index} out of range for session `{id}` ({total} chunks)")]
    ChunkIndexOutOfRange { id: String, index: u64, total: i64 },
    #[error("chunk {index} of session `{id}` is not yet available")]
    ChunkNotAvailable { id: String, index: u64 },
    #[error("invalid upload request: {0}")]
    InvalidRequest(String),
    #[error("assembly of session `{id}` failed: {reason}")]
    AssemblyFailed { id: String, reason: String },
    #[error(transparent)]
    Blob(#[from] BlobError),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

impl UploadError {
    /// Whether a retry of the same operation could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            UploadError::Blob(_) | UploadError::Sqlx(_) | UploadError::ChunkNotAvailable { .. }
        )
    }
}

pub type UploadResult<T> = Result<T, UploadError>;

/// Shared state handed to every HTTP handler.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<SqlitePool>,
    pub sessions: SessionService,
    pub chunks: ChunkStore,
    pub assembly: AssemblyPipeline,
    pub blobs: Arc<dyn BlobStore>,
    pub storage_dir: PathBuf,
    /// Chunk size assigned to sessions that do not request one.
    pub default_chunk_size_bytes: u64,
}

/// Apply the embedded schema, statement by statement.
pub async fn apply_migrations(db: &SqlitePool) -> Result<(), sqlx::Error> {
    const INIT_SQL: &str = include_str!("../../migrations/0001_init.sql");
    let statements = INIT_SQL
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty() && !s.lines().all(|l| l.trim_start().starts_with("--")))
        .collect::<Vec<_>>();

    for stmt in statements {
        sqlx::query(stmt).execute(db).await?;
    }
    Ok(())
}
