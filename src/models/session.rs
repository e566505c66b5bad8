//! Represents one file upload in progress or completed.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Lifecycle state of an upload session.
///
/// Transitions only move forward: `active → (paused ⇄ active) → finalizing
/// → {completed | failed}`, and any non-completed state may lapse to
/// `expired`. A `failed` session may re-enter `finalizing`, since chunks
/// stay untouched until the final object is written.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Paused,
    Finalizing,
    Completed,
    Failed,
    Expired,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Active => "active",
            SessionStatus::Paused => "paused",
            SessionStatus::Finalizing => "finalizing",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// Fine-grained sub-state of finalize, distinct from session status.
///
/// Finalize of a multi-gigabyte upload can run for minutes, so its progress
/// is observable on its own.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AssemblyPhase {
    NotStarted,
    Streaming,
    WritingFinal,
    Complete,
    Failed,
}

/// A resumable upload session, one per file being uploaded.
///
/// The set of received chunk indices is deliberately **not** a column here;
/// it is the set of rows in `upload_chunks`, which gives set-union semantics
/// under concurrent chunk uploads.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct UploadSession {
    /// Opaque token handed to clients (URL-safe base64 of a UUID).
    pub id: String,

    /// Owner the downstream file record is created for.
    pub owner_id: String,

    /// Original filename of the file being uploaded.
    pub filename: String,

    /// Content type (MIME type) of the source file.
    pub mime_type: String,

    /// Total size of the source file in bytes.
    pub file_size_bytes: i64,

    /// Chunk size this session was created with.
    pub chunk_size_bytes: i64,

    /// `ceil(file_size_bytes / chunk_size_bytes)`, fixed at creation.
    pub total_chunks: i64,

    /// Lifecycle state, owned exclusively by the server.
    pub status: SessionStatus,

    /// Sub-state of finalize; `not_started` until finalize begins.
    pub assembly_phase: AssemblyPhase,

    /// Chunks assembled so far during finalize.
    pub assembly_progress: i64,

    /// Blob key of the assembled object, set on completion.
    pub final_object_key: Option<String>,

    /// Download URL of the assembled object, set on completion.
    pub final_object_url: Option<String>,

    /// Diagnostic reason for the last finalize failure, if any.
    pub failure_reason: Option<String>,

    /// Timestamp when the session was created.
    pub created_at: DateTime<Utc>,

    /// Timestamp of the last chunk or transition activity; drives expiry.
    pub last_activity_at: DateTime<Utc>,
}

impl UploadSession {
    /// Whether the session's TTL has lapsed. Completed sessions never
    /// expire; their final object is the durable artifact.
    pub fn is_stale(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        self.status != SessionStatus::Completed && self.last_activity_at + ttl < now
    }

    /// Whether chunk uploads are still accepted.
    pub fn accepts_chunks(&self) -> bool {
        matches!(self.status, SessionStatus::Active | SessionStatus::Paused)
    }
}

/// Snapshot returned to clients polling finalize progress.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct FinalizeStatus {
    pub phase: AssemblyPhase,
    pub progress: i64,
    pub total_chunks: i64,
}
