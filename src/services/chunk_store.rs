//! Chunk payload storage.
//!
//! One blob per `(session, index)`, under a key derived deterministically
//! from both, so a retried upload of the same chunk lands on the same key
//! and overwrites instead of duplicating. Metadata (sizes, received set)
//! lives in the session store; this service only moves bytes.

use crate::services::{UploadError, UploadResult};
use crate::storage::{BlobError, BlobStore, PutOutcome};
use bytes::Bytes;
use std::sync::Arc;
use tracing::debug;

/// Deterministic blob key for chunk `index` of a session.
pub fn chunk_key(session_id: &str, index: u64) -> String {
    format!("sessions/{}/chunks/{:06}", session_id, index)
}

#[derive(Clone)]
pub struct ChunkStore {
    blobs: Arc<dyn BlobStore>,
}

impl ChunkStore {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self { blobs }
    }

    /// Store the payload of one chunk. Idempotent: a retry with the same
    /// index overwrites the same key.
    pub async fn put(
        &self,
        session_id: &str,
        total_chunks: i64,
        index: u64,
        bytes: Bytes,
    ) -> UploadResult<PutOutcome> {
        if index >= total_chunks as u64 {
            return Err(UploadError::ChunkIndexOutOfRange {
                id: session_id.to_string(),
                index,
                total: total_chunks,
            });
        }
        let key = chunk_key(session_id, index);
        Ok(self.blobs.put(&key, bytes, None).await?)
    }

    /// Fetch the payload of one chunk. A chunk that was never stored, or
    /// was already garbage-collected, reports as not-yet-available.
    pub async fn get(&self, session_id: &str, index: u64) -> UploadResult<Bytes> {
        let key = chunk_key(session_id, index);
        self.blobs.get(&key).await.map_err(|err| match err {
            BlobError::NotFound(_) => UploadError::ChunkNotAvailable {
                id: session_id.to_string(),
                index,
            },
            other => UploadError::Blob(other),
        })
    }

    /// Delete one chunk payload. Silently succeeds if already absent.
    pub async fn delete(&self, session_id: &str, index: u64) -> UploadResult<()> {
        let key = chunk_key(session_id, index);
        Ok(self.blobs.delete(&key).await?)
    }

    /// Best-effort removal of every chunk payload of a session, used after
    /// successful assembly and on cancellation. Failures are logged, never
    /// surfaced: leftover chunks cost storage, not correctness.
    pub async fn delete_all(&self, session_id: &str, total_chunks: i64) {
        for index in 0..total_chunks.max(0) as u64 {
            if let Err(err) = self.delete(session_id, index).await {
                debug!(session_id, index, "chunk cleanup failed: {}", err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FsBlobStore;
    use tempfile::TempDir;

    fn chunk_store(dir: &TempDir) -> ChunkStore {
        ChunkStore::new(Arc::new(FsBlobStore::new(dir.path(), "/blobs")))
    }

    #[tokio::test]
    async fn put_then_get_roundtrips() {
        let dir = TempDir::new().unwrap();
        let chunks = chunk_store(&dir);

        chunks
            .put("sess", 4, 2, Bytes::from_static(b"chunk two"))
            .await
            .unwrap();
        let bytes = chunks.get("sess", 2).await.unwrap();
        assert_eq!(&bytes[..], b"chunk two");
    }

    #[tokio::test]
    async fn reupload_overwrites() {
        let dir = TempDir::new().unwrap();
        let chunks = chunk_store(&dir);

        chunks.put("sess", 1, 0, Bytes::from_static(b"first")).await.unwrap();
        chunks.put("sess", 1, 0, Bytes::from_static(b"second")).await.unwrap();
        assert_eq!(&chunks.get("sess", 0).await.unwrap()[..], b"second");
    }

    #[tokio::test]
    async fn out_of_range_index_rejected() {
        let dir = TempDir::new().unwrap();
        let chunks = chunk_store(&dir);

        let err = chunks
            .put("sess", 3, 3, Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            UploadError::ChunkIndexOutOfRange { index: 3, total: 3, .. }
        ));
    }

    #[tokio::test]
    async fn missing_chunk_is_not_yet_available() {
        let dir = TempDir::new().unwrap();
        let err = chunk_store(&dir).get("sess", 7).await.unwrap_err();
        assert!(matches!(err, UploadError::ChunkNotAvailable { index: 7, .. }));
    }

    #[tokio::test]
    async fn delete_absent_chunk_is_silent() {
        let dir = TempDir::new().unwrap();
        chunk_store(&dir).delete("sess", 0).await.unwrap();
    }

    #[tokio::test]
    async fn delete_all_clears_every_chunk() {
        let dir = TempDir::new().unwrap();
        let chunks = chunk_store(&dir);

        for index in 0..5u64 {
            chunks
                .put("sess", 5, index, Bytes::from(vec![index as u8; 8]))
                .await
                .unwrap();
        }
        chunks.delete_all("sess", 5).await;
        for index in 0..5u64 {
            assert!(chunks.get("sess", index).await.is_err());
        }
    }
}
