//! Client-local progress persistence.
//!
//! A mirror of session progress survives page reloads and crashes; the
//! server's received-chunk set stays the source of truth, so a stale or
//! missing local record costs at most some redundant (idempotent) chunk
//! re-sends, never correctness.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::{io, path::PathBuf};
use tokio::fs;
use tracing::debug;

/// Locally persisted view of one upload's progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientUploadRecord {
    pub session_id: String,
    pub filename: String,
    pub file_size_bytes: i64,
    pub uploaded_chunk_indices: Vec<u64>,
    pub created_at: DateTime<Utc>,
}

/// Where the orchestrator keeps [`ClientUploadRecord`]s between runs.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn save(&self, record: &ClientUploadRecord) -> io::Result<()>;
    async fn load(&self, session_id: &str) -> io::Result<Option<ClientUploadRecord>>;
    async fn remove(&self, session_id: &str) -> io::Result<()>;
    /// Drop records older than `ttl`; they mirror sessions the server has
    /// expired anyway. Returns how many were purged.
    async fn purge_stale(&self, ttl: Duration) -> io::Result<u64>;
}

/// One JSON file per session under a directory. Session tokens are URL-safe
/// base64, so they are valid filenames as-is.
pub struct JsonFileProgressStore {
    dir: PathBuf,
}

impl JsonFileProgressStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}.json"))
    }
}

#[async_trait]
impl ProgressStore for JsonFileProgressStore {
    async fn save(&self, record: &ClientUploadRecord) -> io::Result<()> {
        fs::create_dir_all(&self.dir).await?;
        let json = serde_json::to_vec_pretty(record)?;
        fs::write(self.path_for(&record.session_id), json).await
    }

    async fn load(&self, session_id: &str) -> io::Result<Option<ClientUploadRecord>> {
        let bytes = match fs::read(self.path_for(session_id)).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err),
        };
        match serde_json::from_slice(&bytes) {
            Ok(record) => Ok(Some(record)),
            Err(err) => {
                debug!(session_id, "discarding unreadable progress record: {}", err);
                Ok(None)
            }
        }
    }

    async fn remove(&self, session_id: &str) -> io::Result<()> {
        match fs::remove_file(self.path_for(session_id)).await {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn purge_stale(&self, ttl: Duration) -> io::Result<u64> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err),
        };

        let cutoff = Utc::now() - ttl;
        let mut purged = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let stale = match fs::read(&path).await {
                Ok(bytes) => serde_json::from_slice::<ClientUploadRecord>(&bytes)
                    .map(|record| record.created_at < cutoff)
                    // Unreadable records are dead weight either way.
                    .unwrap_or(true),
                Err(_) => continue,
            };
            if stale && fs::remove_file(&path).await.is_ok() {
                purged += 1;
            }
        }
        Ok(purged)
    }
}
