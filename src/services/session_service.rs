//! Durable upload-session state, backed by SQLite.
//!
//! The session row is owned exclusively by the server; clients only request
//! transitions. All status changes go through guarded `UPDATE ... WHERE
//! status = ...` statements so concurrent requests race on the database,
//! not in process memory.

use crate::codec;
use crate::models::{AssemblyPhase, ChunkRecord, FinalizeStatus, SessionStatus, UploadSession};
use crate::services::{UploadError, UploadResult};
use base64::{Engine as _, engine::general_purpose};
use chrono::{Duration, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

const SESSION_COLUMNS: &str = "id, owner_id, filename, mime_type, file_size_bytes, \
     chunk_size_bytes, total_chunks, status, assembly_phase, assembly_progress, \
     final_object_key, final_object_url, failure_reason, created_at, last_activity_at";

/// Parameters for creating a session.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub owner_id: String,
    pub filename: String,
    pub mime_type: String,
    pub file_size_bytes: i64,
    pub chunk_size_bytes: i64,
}

/// Opaque external handle: URL-safe base64 of a fresh UUID.
fn new_session_token() -> String {
    general_purpose::URL_SAFE_NO_PAD.encode(Uuid::new_v4().as_bytes())
}

#[derive(Clone)]
pub struct SessionService {
    db: Arc<SqlitePool>,
    ttl: Duration,
}

impl SessionService {
    /// `ttl` bounds how long an inactive session stays resumable.
    pub fn new(db: Arc<SqlitePool>, ttl: Duration) -> Self {
        Self { db, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Create a session in `active` state with a derived chunk count.
    pub async fn create(&self, req: NewSession) -> UploadResult<UploadSession> {
        if req.chunk_size_bytes <= 0 {
            return Err(UploadError::InvalidRequest(
                "chunk size must be positive".into(),
            ));
        }
        if req.file_size_bytes < 0 {
            return Err(UploadError::InvalidRequest(
                "file size must not be negative".into(),
            ));
        }

        let total_chunks =
            codec::total_chunks(req.file_size_bytes as u64, req.chunk_size_bytes as u64) as i64;
        let now = Utc::now();
        let id = new_session_token();

        let session = sqlx::query_as::<_, UploadSession>(&format!(
            "INSERT INTO upload_sessions (
                {SESSION_COLUMNS}
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, NULL, NULL, NULL, ?, ?)
            RETURNING {SESSION_COLUMNS}"
        ))
        .bind(&id)
        .bind(&req.owner_id)
        .bind(&req.filename)
        .bind(&req.mime_type)
        .bind(req.file_size_bytes)
        .bind(req.chunk_size_bytes)
        .bind(total_chunks)
        .bind(SessionStatus::Active)
        .bind(AssemblyPhase::NotStarted)
        .bind(now)
        .bind(now)
        .fetch_one(&*self.db)
        .await?;

        info!(
            session_id = %session.id,
            total_chunks,
            file_size_bytes = req.file_size_bytes,
            "created upload session"
        );
        Ok(session)
    }

    /// Fetch a session row as stored.
    pub async fn fetch(&self, id: &str) -> UploadResult<UploadSession> {
        sqlx::query_as::<_, UploadSession>(&format!(
            "SELECT {SESSION_COLUMNS} FROM upload_sessions WHERE id = ?"
        ))
        .bind(id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => UploadError::SessionNotFound(id.to_string()),
            other => UploadError::Sqlx(other),
        })
    }

    /// Fetch a session, materializing TTL lapse to `expired` on the way.
    /// Keeps expiry honest between background sweeps.
    pub async fn fetch_current(&self, id: &str) -> UploadResult<UploadSession> {
        let session = self.fetch(id).await?;
        if session.is_stale(self.ttl, Utc::now()) && session.status != SessionStatus::Expired {
            sqlx::query(
                "UPDATE upload_sessions SET status = ? WHERE id = ? AND status NOT IN ('completed', 'expired')",
            )
            .bind(SessionStatus::Expired)
            .bind(id)
            .execute(&*self.db)
            .await?;
            return self.fetch(id).await;
        }
        Ok(session)
    }

    /// Reject sessions that no longer accept chunk uploads, with the error
    /// the caller should surface. Checked both before storing chunk bytes
    /// (so dead sessions do not accrete orphan blobs) and before recording.
    pub fn ensure_uploadable(&self, session: &UploadSession) -> UploadResult<()> {
        if session.accepts_chunks() {
            return Ok(());
        }
        Err(match session.status {
            SessionStatus::Expired => UploadError::SessionExpired(session.id.clone()),
            status => UploadError::InvalidTransition {
                id: session.id.clone(),
                status,
                action: "accept chunks",
            },
        })
    }

    /// Record that a chunk arrived: upsert its row (set-union semantics,
    /// since concurrent uploads of different indices insert disjoint rows) and
    /// touch activity. Returns the received-chunk count afterwards.
    pub async fn record_chunk_received(
        &self,
        session: &UploadSession,
        index: u64,
        storage_key: &str,
        size_bytes: i64,
    ) -> UploadResult<i64> {
        self.ensure_uploadable(session)?;
        if index >= session.total_chunks as u64 {
            return Err(UploadError::ChunkIndexOutOfRange {
                id: session.id.clone(),
                index,
                total: session.total_chunks,
            });
        }

        let now = Utc::now();
        sqlx::query(
            "INSERT INTO upload_chunks (session_id, chunk_index, storage_key, size_bytes, received_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(session_id, chunk_index) DO UPDATE SET
                storage_key = excluded.storage_key,
                size_bytes = excluded.size_bytes,
                received_at = excluded.received_at",
        )
        .bind(&session.id)
        .bind(index as i64)
        .bind(storage_key)
        .bind(size_bytes)
        .bind(now)
        .execute(&*self.db)
        .await?;

        sqlx::query("UPDATE upload_sessions SET last_activity_at = ? WHERE id = ?")
            .bind(now)
            .bind(&session.id)
            .execute(&*self.db)
            .await?;

        self.received_count(&session.id).await
    }

    pub async fn received_count(&self, id: &str) -> UploadResult<i64> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM upload_chunks WHERE session_id = ?")
                .bind(id)
                .fetch_one(&*self.db)
                .await?,
        )
    }

    /// Received chunk indices in ascending order.
    pub async fn received_indices(&self, id: &str) -> UploadResult<Vec<i64>> {
        Ok(sqlx::query_scalar(
            "SELECT chunk_index FROM upload_chunks WHERE session_id = ? ORDER BY chunk_index ASC",
        )
        .bind(id)
        .fetch_all(&*self.db)
        .await?)
    }

    /// Full chunk rows, used by the range server for size bookkeeping.
    pub async fn chunk_records(&self, id: &str) -> UploadResult<Vec<ChunkRecord>> {
        Ok(sqlx::query_as::<_, ChunkRecord>(
            "SELECT session_id, chunk_index, storage_key, size_bytes, received_at
             FROM upload_chunks WHERE session_id = ? ORDER BY chunk_index ASC",
        )
        .bind(id)
        .fetch_all(&*self.db)
        .await?)
    }

    pub async fn pause(&self, id: &str) -> UploadResult<UploadSession> {
        self.transition(id, SessionStatus::Active, SessionStatus::Paused, "pause")
            .await
    }

    pub async fn resume(&self, id: &str) -> UploadResult<UploadSession> {
        self.transition(id, SessionStatus::Paused, SessionStatus::Active, "resume")
            .await
    }

    /// Guarded single-step transition; loses gracefully to concurrent writers.
    async fn transition(
        &self,
        id: &str,
        from: SessionStatus,
        to: SessionStatus,
        action: &'static str,
    ) -> UploadResult<UploadSession> {
        let result = sqlx::query(
            "UPDATE upload_sessions SET status = ?, last_activity_at = ? WHERE id = ? AND status = ?",
        )
        .bind(to)
        .bind(Utc::now())
        .bind(id)
        .bind(from)
        .execute(&*self.db)
        .await?;

        let session = self.fetch(id).await?;
        if result.rows_affected() == 0 && session.status != to {
            return Err(UploadError::InvalidTransition {
                id: id.to_string(),
                status: session.status,
                action,
            });
        }
        Ok(session)
    }

    /// Transition to `finalizing` once every chunk is present.
    ///
    /// Legal from `active`, `paused`, and `failed` (finalize is retryable;
    /// chunks are untouched until the final object lands). A session already
    /// `finalizing` is returned as-is so a concurrent caller can poll.
    pub async fn begin_finalize(&self, id: &str) -> UploadResult<UploadSession> {
        let session = self.fetch_current(id).await?;
        match session.status {
            SessionStatus::Finalizing => return Ok(session),
            SessionStatus::Completed | SessionStatus::Expired => {
                return Err(UploadError::InvalidTransition {
                    id: id.to_string(),
                    status: session.status,
                    action: "finalize",
                });
            }
            SessionStatus::Active | SessionStatus::Paused | SessionStatus::Failed => {}
        }

        let received = self.received_count(id).await?;
        if received < session.total_chunks {
            return Err(UploadError::IncompleteUpload {
                id: id.to_string(),
                received,
                total: session.total_chunks,
            });
        }

        let result = sqlx::query(
            "UPDATE upload_sessions
             SET status = ?, assembly_phase = ?, assembly_progress = 0,
                 failure_reason = NULL, last_activity_at = ?
             WHERE id = ? AND status IN ('active', 'paused', 'failed')",
        )
        .bind(SessionStatus::Finalizing)
        .bind(AssemblyPhase::Streaming)
        .bind(Utc::now())
        .bind(id)
        .execute(&*self.db)
        .await?;

        let session = self.fetch(id).await?;
        if result.rows_affected() == 0 && session.status != SessionStatus::Finalizing {
            return Err(UploadError::InvalidTransition {
                id: id.to_string(),
                status: session.status,
                action: "finalize",
            });
        }
        Ok(session)
    }

    pub async fn update_assembly_progress(&self, id: &str, chunks_assembled: i64) -> UploadResult<()> {
        sqlx::query(
            "UPDATE upload_sessions SET assembly_progress = ?, last_activity_at = ? WHERE id = ?",
        )
        .bind(chunks_assembled)
        .bind(Utc::now())
        .bind(id)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    pub async fn set_assembly_phase(&self, id: &str, phase: AssemblyPhase) -> UploadResult<()> {
        sqlx::query("UPDATE upload_sessions SET assembly_phase = ? WHERE id = ?")
            .bind(phase)
            .bind(id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    pub async fn complete_finalize(
        &self,
        id: &str,
        final_object_key: &str,
        final_object_url: &str,
    ) -> UploadResult<UploadSession> {
        let result = sqlx::query(
            "UPDATE upload_sessions
             SET status = ?, assembly_phase = ?, final_object_key = ?,
                 final_object_url = ?, failure_reason = NULL, last_activity_at = ?
             WHERE id = ? AND status = 'finalizing'",
        )
        .bind(SessionStatus::Completed)
        .bind(AssemblyPhase::Complete)
        .bind(final_object_key)
        .bind(final_object_url)
        .bind(Utc::now())
        .bind(id)
        .execute(&*self.db)
        .await?;

        let session = self.fetch(id).await?;
        if result.rows_affected() == 0 && session.status != SessionStatus::Completed {
            return Err(UploadError::InvalidTransition {
                id: id.to_string(),
                status: session.status,
                action: "complete finalize",
            });
        }
        info!(session_id = id, key = final_object_key, "upload completed");
        Ok(session)
    }

    pub async fn fail_finalize(&self, id: &str, reason: &str) -> UploadResult<()> {
        sqlx::query(
            "UPDATE upload_sessions
             SET status = ?, assembly_phase = ?, failure_reason = ?, last_activity_at = ?
             WHERE id = ? AND status = 'finalizing'",
        )
        .bind(SessionStatus::Failed)
        .bind(AssemblyPhase::Failed)
        .bind(reason)
        .bind(Utc::now())
        .bind(id)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    /// Cancel a session: immediately non-resumable, chunks eligible for GC.
    /// Completed sessions cannot be cancelled; their final object stands.
    pub async fn cancel(&self, id: &str) -> UploadResult<UploadSession> {
        let session = self.fetch(id).await?;
        if session.status == SessionStatus::Completed {
            return Err(UploadError::InvalidTransition {
                id: id.to_string(),
                status: session.status,
                action: "cancel",
            });
        }
        sqlx::query(
            "UPDATE upload_sessions SET status = ?, last_activity_at = ? WHERE id = ? AND status != 'completed'",
        )
        .bind(SessionStatus::Expired)
        .bind(Utc::now())
        .bind(id)
        .execute(&*self.db)
        .await?;
        self.fetch(id).await
    }

    /// Batch sweep: mark every non-completed session whose TTL lapsed.
    /// Returns how many sessions were expired.
    pub async fn expire_stale_sessions(&self) -> UploadResult<u64> {
        let cutoff = Utc::now() - self.ttl;
        let result = sqlx::query(
            "UPDATE upload_sessions SET status = ?
             WHERE status NOT IN ('completed', 'expired') AND last_activity_at < ?",
        )
        .bind(SessionStatus::Expired)
        .bind(cutoff)
        .execute(&*self.db)
        .await?;
        if result.rows_affected() > 0 {
            info!(count = result.rows_affected(), "expired stale upload sessions");
        }
        Ok(result.rows_affected())
    }

    pub async fn finalize_status(&self, id: &str) -> UploadResult<FinalizeStatus> {
        let session = self.fetch(id).await?;
        Ok(FinalizeStatus {
            phase: session.assembly_phase,
            progress: session.assembly_progress,
            total_chunks: session.total_chunks,
        })
    }
}
