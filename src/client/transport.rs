//! Transport seam between the orchestrator and the server.
//!
//! The orchestrator only cares whether a failed call is worth retrying, so
//! transport errors come pre-classified as transient or permanent. An HTTP
//! implementation maps timeouts and 5xx to transient, 4xx to permanent;
//! [`LocalTransport`] maps service errors by the same rule.

use crate::models::{FinalizeStatus, SessionStatus};
use crate::services::{AssemblyPipeline, ChunkStore, NewSession, SessionService, UploadError};
use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    /// Network timeout, storage hiccup: worth retrying with backoff.
    #[error("transient transport failure: {0}")]
    Transient(String),
    /// Session gone, index out of range: retrying cannot help.
    #[error("permanent transport failure: {0}")]
    Permanent(String),
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Transient(_))
    }
}

impl From<UploadError> for TransportError {
    fn from(err: UploadError) -> Self {
        if err.is_transient() {
            TransportError::Transient(err.to_string())
        } else {
            TransportError::Permanent(err.to_string())
        }
    }
}

/// What the client needs to know about a server-side session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub session_id: String,
    pub chunk_size_bytes: u64,
    pub total_chunks: u64,
    /// Chunk indices the server already has; the resume path skips these.
    pub received_indices: Vec<u64>,
}

/// Client-facing operations of the upload server, transport-agnostic.
#[async_trait]
pub trait UploadTransport: Send + Sync {
    async fn create_session(&self, req: NewSession) -> Result<SessionHandle, TransportError>;

    /// Look up a session for resumption. `Ok(None)` means the session no
    /// longer accepts chunks (unknown, expired, or already finalized), so
    /// the caller should start fresh.
    async fn resolve_session(&self, session_id: &str)
    -> Result<Option<SessionHandle>, TransportError>;

    async fn upload_chunk(
        &self,
        session_id: &str,
        index: u64,
        bytes: Bytes,
    ) -> Result<(), TransportError>;

    async fn pause_session(&self, session_id: &str) -> Result<(), TransportError>;

    async fn resume_session(&self, session_id: &str) -> Result<(), TransportError>;

    async fn finalize(&self, session_id: &str) -> Result<FinalizeStatus, TransportError>;

    async fn finalize_status(&self, session_id: &str) -> Result<FinalizeStatus, TransportError>;

    async fn cancel_session(&self, session_id: &str) -> Result<(), TransportError>;
}

/// In-process transport: the client services wired straight to the server
/// services, no wire format in between.
#[derive(Clone)]
pub struct LocalTransport {
    sessions: SessionService,
    chunks: ChunkStore,
    assembly: AssemblyPipeline,
}

impl LocalTransport {
    pub fn new(sessions: SessionService, chunks: ChunkStore, assembly: AssemblyPipeline) -> Self {
        Self {
            sessions,
            chunks,
            assembly,
        }
    }
}

#[async_trait]
impl UploadTransport for LocalTransport {
    async fn create_session(&self, req: NewSession) -> Result<SessionHandle, TransportError> {
        let session = self.sessions.create(req).await?;
        Ok(SessionHandle {
            session_id: session.id,
            chunk_size_bytes: session.chunk_size_bytes as u64,
            total_chunks: session.total_chunks as u64,
            received_indices: Vec::new(),
        })
    }

    async fn resolve_session(
        &self,
        session_id: &str,
    ) -> Result<Option<SessionHandle>, TransportError> {
        let session = match self.sessions.fetch_current(session_id).await {
            Ok(session) => session,
            Err(UploadError::SessionNotFound(_)) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        if !matches!(
            session.status,
            SessionStatus::Active | SessionStatus::Paused
        ) {
            return Ok(None);
        }
        let received = self.sessions.received_indices(session_id).await?;
        Ok(Some(SessionHandle {
            session_id: session.id,
            chunk_size_bytes: session.chunk_size_bytes as u64,
            total_chunks: session.total_chunks as u64,
            received_indices: received.into_iter().map(|i| i as u64).collect(),
        }))
    }

    async fn upload_chunk(
        &self,
        session_id: &str,
        index: u64,
        bytes: Bytes,
    ) -> Result<(), TransportError> {
        let session = self.sessions.fetch_current(session_id).await?;
        self.sessions.ensure_uploadable(&session)?;
        let size = bytes.len() as i64;
        let outcome = self
            .chunks
            .put(&session.id, session.total_chunks, index, bytes)
            .await?;
        self.sessions
            .record_chunk_received(&session, index, &outcome.key, size)
            .await?;
        Ok(())
    }

    async fn pause_session(&self, session_id: &str) -> Result<(), TransportError> {
        self.sessions.pause(session_id).await?;
        Ok(())
    }

    async fn resume_session(&self, session_id: &str) -> Result<(), TransportError> {
        self.sessions.resume(session_id).await?;
        Ok(())
    }

    async fn finalize(&self, session_id: &str) -> Result<FinalizeStatus, TransportError> {
        Ok(self.assembly.start(session_id).await?)
    }

    async fn finalize_status(&self, session_id: &str) -> Result<FinalizeStatus, TransportError> {
        Ok(self.sessions.finalize_status(session_id).await?)
    }

    async fn cancel_session(&self, session_id: &str) -> Result<(), TransportError> {
        let session = self.sessions.cancel(session_id).await?;
        self.chunks
            .delete_all(&session.id, session.total_chunks)
            .await;
        Ok(())
    }
}
