//! Server-side assembly: streams received chunks, in index order, into one
//! final blob-store object.
//!
//! Assembly runs in batches so peak memory is roughly `batch_size *
//! chunk_size` regardless of file size; a multi-gigabyte finalize can take
//! minutes, which is why the session carries a distinct `finalizing` status
//! and an observable assembly phase. A failed pass leaves chunks untouched,
//! so finalize can be retried from scratch and rewrites the final object
//! whole.

use crate::codec;
use crate::models::{AssemblyPhase, FinalizeStatus, SessionStatus, UploadSession};
use crate::services::{ChunkStore, SessionService, UploadError, UploadResult};
use crate::storage::{BlobStore, BlobWriter};
use async_trait::async_trait;
use bytes::Bytes;
use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing::{debug, error, info, warn};

/// Tunables for the assembly pass.
#[derive(Debug, Clone)]
pub struct AssemblyConfig {
    /// Chunks fetched and appended per batch for large files.
    pub batch_size: u64,
    /// Files at or below this size are assembled in a single pass.
    pub small_file_threshold_bytes: u64,
    /// Attempts per chunk fetch before the pass is abandoned.
    pub chunk_fetch_attempts: u32,
    /// Base backoff between fetch attempts; attempt `n` waits `n * base`.
    pub chunk_fetch_backoff: Duration,
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            small_file_threshold_bytes: 50 * 1024 * 1024,
            chunk_fetch_attempts: 3,
            chunk_fetch_backoff: Duration::from_secs(1),
        }
    }
}

/// Everything the downstream file/video record creator needs.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub url: String,
    pub key: String,
    pub filename: String,
    pub mime_type: String,
    pub file_size_bytes: i64,
    pub owner_id: String,
}

/// Invoked once per completed session. Fire-and-forget from the pipeline's
/// perspective; its own durability is out of scope here.
#[async_trait]
pub trait RecordCreator: Send + Sync {
    async fn file_created(&self, record: FileRecord);
}

/// Default creator: logs the completed upload and nothing else.
pub struct LoggingRecordCreator;

#[async_trait]
impl RecordCreator for LoggingRecordCreator {
    async fn file_created(&self, record: FileRecord) {
        info!(
            key = %record.key,
            filename = %record.filename,
            mime_type = %record.mime_type,
            size_bytes = record.file_size_bytes,
            "file record created"
        );
    }
}

#[derive(Clone)]
pub struct AssemblyPipeline {
    sessions: SessionService,
    chunks: ChunkStore,
    blobs: Arc<dyn BlobStore>,
    records: Arc<dyn RecordCreator>,
    cfg: AssemblyConfig,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl AssemblyPipeline {
    pub fn new(
        sessions: SessionService,
        chunks: ChunkStore,
        blobs: Arc<dyn BlobStore>,
        records: Arc<dyn RecordCreator>,
        cfg: AssemblyConfig,
    ) -> Self {
        Self {
            sessions,
            chunks,
            blobs,
            records,
            cfg,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn is_running(&self, id: &str) -> bool {
        self.in_flight.lock().unwrap().contains(id)
    }

    /// Handle a finalize request: validate, transition to `finalizing`, and
    /// kick off the assembly pass in the background. Returns the status the
    /// caller should start polling.
    ///
    /// Single-flight per session: a second request while a pass is running
    /// observes the in-progress state instead of starting a duplicate. A
    /// session stuck in `finalizing` with no running pass (e.g. after a
    /// restart) gets a fresh pass.
    pub async fn start(&self, id: &str) -> UploadResult<FinalizeStatus> {
        let session = self.sessions.fetch_current(id).await?;
        if session.status == SessionStatus::Completed
            || (session.status == SessionStatus::Finalizing && self.is_running(id))
        {
            return Ok(status_of(&session));
        }

        let session = self.sessions.begin_finalize(id).await?;

        let this = self.clone();
        let session_id = id.to_string();
        tokio::spawn(async move {
            if let Err(err) = this.assemble(&session_id).await {
                error!(session_id = %session_id, "assembly failed: {}", err);
            }
        });

        Ok(status_of(&session))
    }

    /// Run one assembly pass to completion. Callers other than `start` are
    /// tests and retry tooling; the single-flight guard still applies.
    pub async fn assemble(&self, id: &str) -> UploadResult<UploadSession> {
        let _flight = match Flight::acquire(&self.in_flight, id) {
            Some(flight) => flight,
            // Another pass owns this session; report its current state.
            None => return self.sessions.fetch(id).await,
        };

        let session = self.sessions.fetch(id).await?;
        if session.status != SessionStatus::Finalizing {
            return Ok(session);
        }

        match self.run(&session).await {
            Ok(done) => Ok(done),
            Err(err) => {
                let reason = err.to_string();
                if let Err(mark_err) = self.sessions.fail_finalize(id, &reason).await {
                    error!(session_id = id, "failed to record finalize failure: {}", mark_err);
                }
                Err(UploadError::AssemblyFailed {
                    id: id.to_string(),
                    reason,
                })
            }
        }
    }

    async fn run(&self, session: &UploadSession) -> UploadResult<UploadSession> {
        let total = session.total_chunks as u64;
        // Small files skip batching and go through in one pass.
        let batch_size = if session.file_size_bytes as u64 <= self.cfg.small_file_threshold_bytes {
            total.max(1)
        } else {
            self.cfg.batch_size
        };

        let final_key = final_object_key(session);
        let mut writer = self.blobs.writer(&final_key, Some(&session.mime_type)).await?;

        if let Err(err) = self.write_batches(session, total, batch_size, writer.as_mut()).await {
            writer.abort().await;
            return Err(err);
        }

        let outcome = writer.finish().await?;
        let done = self
            .sessions
            .complete_finalize(&session.id, &outcome.key, &outcome.url)
            .await?;
        info!(
            session_id = %session.id,
            key = %outcome.key,
            size_bytes = outcome.size_bytes,
            etag = %outcome.etag,
            "assembly complete"
        );

        // Fire-and-forget hand-off to the downstream record creator: the
        // session is already completed, whatever the creator does with this.
        self.records
            .file_created(FileRecord {
                url: outcome.url,
                key: outcome.key,
                filename: session.filename.clone(),
                mime_type: session.mime_type.clone(),
                file_size_bytes: session.file_size_bytes,
                owner_id: session.owner_id.clone(),
            })
            .await;

        // Chunks are now redundant; reclaim the storage.
        self.chunks.delete_all(&session.id, session.total_chunks).await;

        Ok(done)
    }

    /// Append every chunk to the writer, strictly in index order. This is
    /// the one correctness-critical ordering in the whole pipeline.
    async fn write_batches(
        &self,
        session: &UploadSession,
        total: u64,
        batch_size: u64,
        writer: &mut dyn BlobWriter,
    ) -> UploadResult<()> {
        for batch in codec::batch_plan(total, batch_size) {
            for index in batch.clone() {
                let bytes = self.fetch_chunk_with_retry(&session.id, index).await?;
                writer.write(&bytes).await?;
            }
            self.sessions
                .update_assembly_progress(&session.id, batch.end as i64)
                .await?;
            debug!(
                session_id = %session.id,
                assembled = batch.end,
                total,
                "assembly batch written"
            );
        }
        self.sessions
            .set_assembly_phase(&session.id, AssemblyPhase::WritingFinal)
            .await?;
        Ok(())
    }

    async fn fetch_chunk_with_retry(&self, id: &str, index: u64) -> UploadResult<Bytes> {
        let mut attempt = 1;
        loop {
            match self.chunks.get(id, index).await {
                Ok(bytes) => return Ok(bytes),
                Err(err) if attempt < self.cfg.chunk_fetch_attempts => {
                    warn!(
                        session_id = id,
                        index, attempt, "chunk fetch failed, retrying: {}", err
                    );
                    tokio::time::sleep(self.cfg.chunk_fetch_backoff * attempt).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn status_of(session: &UploadSession) -> FinalizeStatus {
    FinalizeStatus {
        phase: session.assembly_phase,
        progress: session.assembly_progress,
        total_chunks: session.total_chunks,
    }
}

/// Blob key of the assembled object.
fn final_object_key(session: &UploadSession) -> String {
    format!("uploads/{}/{}", session.id, sanitize_filename(&session.filename))
}

/// Reduce a client-supplied filename to a safe key segment.
fn sanitize_filename(filename: &str) -> String {
    let mut out = String::with_capacity(filename.len());
    let mut last_dot = false;
    for c in filename.chars() {
        let keep = c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_');
        let c = if keep { c } else { '_' };
        // Collapse dot runs so the key can never contain `..`.
        if c == '.' && last_dot {
            continue;
        }
        last_dot = c == '.';
        out.push(c);
    }
    if out.is_empty() || out.chars().all(|c| c == '.') {
        "object".to_string()
    } else {
        out
    }
}

/// RAII membership in the in-flight set.
struct Flight {
    set: Arc<Mutex<HashSet<String>>>,
    id: String,
}

impl Flight {
    fn acquire(set: &Arc<Mutex<HashSet<String>>>, id: &str) -> Option<Self> {
        if set.lock().unwrap().insert(id.to_string()) {
            Some(Self {
                set: Arc::clone(set),
                id: id.to_string(),
            })
        } else {
            None
        }
    }
}

impl Drop for Flight {
    fn drop(&mut self) {
        self.set.lock().unwrap().remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{NewSession, apply_migrations, chunk_key};
    use crate::storage::{BlobError, BlobReader, BlobResult, FsBlobStore, PutOutcome};
    use sqlx::sqlite::SqlitePoolOptions;
    use std::collections::HashMap;
    use tempfile::TempDir;

    /// Records every downstream invocation for assertions.
    struct CapturingCreator(Mutex<Vec<FileRecord>>);

    #[async_trait]
    impl RecordCreator for CapturingCreator {
        async fn file_created(&self, record: FileRecord) {
            self.0.lock().unwrap().push(record);
        }
    }

    /// Per-key injected `get` failure counts, shared with the test body so
    /// faults can be armed after the session id is known.
    type Faults = Arc<Mutex<HashMap<String, u32>>>;

    /// Blob store decorator that fails `get` while a key has armed faults.
    struct FlakyBlobStore {
        inner: Arc<dyn BlobStore>,
        faults: Faults,
    }

    #[async_trait]
    impl BlobStore for FlakyBlobStore {
        async fn put(
            &self,
            key: &str,
            bytes: Bytes,
            content_type: Option<&str>,
        ) -> BlobResult<PutOutcome> {
            self.inner.put(key, bytes, content_type).await
        }

        async fn get(&self, key: &str) -> BlobResult<Bytes> {
            {
                let mut faults = self.faults.lock().unwrap();
                if let Some(remaining) = faults.get_mut(key) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        return Err(BlobError::Io(std::io::Error::other("injected fault")));
                    }
                }
            }
            self.inner.get(key).await
        }

        async fn open(&self, key: &str) -> BlobResult<BlobReader> {
            self.inner.open(key).await
        }

        async fn delete(&self, key: &str) -> BlobResult<()> {
            self.inner.delete(key).await
        }

        async fn writer(
            &self,
            key: &str,
            content_type: Option<&str>,
        ) -> BlobResult<Box<dyn BlobWriter>> {
            self.inner.writer(key, content_type).await
        }

        fn download_url(&self, key: &str) -> String {
            self.inner.download_url(key)
        }
    }

    struct Harness {
        _dir: TempDir,
        sessions: SessionService,
        chunks: ChunkStore,
        pipeline: AssemblyPipeline,
        creator: Arc<CapturingCreator>,
        blobs: Arc<dyn BlobStore>,
        faults: Faults,
    }

    async fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let db = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        apply_migrations(&db).await.unwrap();

        let faults: Faults = Arc::new(Mutex::new(HashMap::new()));
        let blobs: Arc<dyn BlobStore> = Arc::new(FlakyBlobStore {
            inner: Arc::new(FsBlobStore::new(dir.path(), "/blobs")),
            faults: Arc::clone(&faults),
        });
        let sessions = SessionService::new(Arc::new(db), chrono::Duration::hours(24));
        let chunks = ChunkStore::new(Arc::clone(&blobs));
        let creator = Arc::new(CapturingCreator(Mutex::new(Vec::new())));
        let cfg = AssemblyConfig {
            chunk_fetch_backoff: Duration::from_millis(1),
            ..AssemblyConfig::default()
        };
        let pipeline = AssemblyPipeline::new(
            sessions.clone(),
            chunks.clone(),
            Arc::clone(&blobs),
            creator.clone(),
            cfg,
        );
        Harness {
            _dir: dir,
            sessions,
            chunks,
            pipeline,
            creator,
            blobs,
            faults,
        }
    }

    /// Upload `data` split at `chunk_size` and return the finalize-ready session.
    async fn seed_session(h: &Harness, data: &Bytes, chunk_size: i64) -> UploadSession {
        let session = h
            .sessions
            .create(NewSession {
                owner_id: "owner-1".into(),
                filename: "clip.mp4".into(),
                mime_type: "video/mp4".into(),
                file_size_bytes: data.len() as i64,
                chunk_size_bytes: chunk_size,
            })
            .await
            .unwrap();
        for (index, chunk) in codec::ChunkReader::new(data.clone(), chunk_size as u64) {
            let outcome = h
                .chunks
                .put(&session.id, session.total_chunks, index, chunk.clone())
                .await
                .unwrap();
            h.sessions
                .record_chunk_received(&session, index, &outcome.key, chunk.len() as i64)
                .await
                .unwrap();
        }
        session
    }

    fn patterned(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
    }

    #[tokio::test]
    async fn small_file_assembles_byte_identical() {
        let h = harness().await;
        let data = patterned(100);
        let session = seed_session(&h, &data, 33).await;

        h.sessions.begin_finalize(&session.id).await.unwrap();
        let done = h.pipeline.assemble(&session.id).await.unwrap();

        assert_eq!(done.status, SessionStatus::Completed);
        assert_eq!(done.assembly_phase, AssemblyPhase::Complete);
        let key = done.final_object_key.unwrap();
        assert_eq!(&h.blobs.get(&key).await.unwrap()[..], &data[..]);

        // Downstream record creator fired once with the final object.
        let records = h.creator.0.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, key);
        assert_eq!(records[0].mime_type, "video/mp4");
    }

    #[tokio::test]
    async fn chunks_are_garbage_collected_after_assembly() {
        let h = harness().await;
        let data = patterned(64);
        let session = seed_session(&h, &data, 16).await;

        h.sessions.begin_finalize(&session.id).await.unwrap();
        h.pipeline.assemble(&session.id).await.unwrap();

        for index in 0..session.total_chunks as u64 {
            assert!(h.chunks.get(&session.id, index).await.is_err());
        }
    }

    #[tokio::test]
    async fn transient_fetch_faults_recover_within_budget() {
        let h = harness().await;
        let data = patterned(200);
        let session = seed_session(&h, &data, 40).await;

        // Two faults on chunk 2: the third attempt of the retry budget lands.
        h.faults
            .lock()
            .unwrap()
            .insert(chunk_key(&session.id, 2), 2);

        h.sessions.begin_finalize(&session.id).await.unwrap();
        let done = h.pipeline.assemble(&session.id).await.unwrap();

        assert_eq!(done.status, SessionStatus::Completed);
        let key = done.final_object_key.unwrap();
        assert_eq!(&h.blobs.get(&key).await.unwrap()[..], &data[..]);
    }

    #[tokio::test]
    async fn failed_pass_is_retryable_and_idempotent() {
        let h = harness().await;
        let data = patterned(96);
        let session = seed_session(&h, &data, 32).await;

        // More faults than the budget: the first pass must fail.
        h.faults
            .lock()
            .unwrap()
            .insert(chunk_key(&session.id, 1), 10);

        h.sessions.begin_finalize(&session.id).await.unwrap();
        let err = h.pipeline.assemble(&session.id).await.unwrap_err();
        assert!(matches!(err, UploadError::AssemblyFailed { .. }));

        let failed = h.sessions.fetch(&session.id).await.unwrap();
        assert_eq!(failed.status, SessionStatus::Failed);
        assert_eq!(failed.assembly_phase, AssemblyPhase::Failed);
        assert!(failed.failure_reason.is_some());

        // Chunks were untouched by the failed pass.
        assert_eq!(
            h.sessions.received_count(&session.id).await.unwrap(),
            session.total_chunks
        );

        // Network heals; a fresh finalize rewrites the object from scratch.
        h.faults.lock().unwrap().clear();
        h.sessions.begin_finalize(&session.id).await.unwrap();
        let done = h.pipeline.assemble(&session.id).await.unwrap();
        assert_eq!(done.status, SessionStatus::Completed);
        let key = done.final_object_key.unwrap();
        assert_eq!(&h.blobs.get(&key).await.unwrap()[..], &data[..]);
    }

    #[tokio::test]
    async fn empty_file_produces_empty_object() {
        let h = harness().await;
        let data = Bytes::new();
        let session = seed_session(&h, &data, 16).await;
        assert_eq!(session.total_chunks, 0);

        h.sessions.begin_finalize(&session.id).await.unwrap();
        let done = h.pipeline.assemble(&session.id).await.unwrap();
        assert_eq!(done.status, SessionStatus::Completed);
        let key = done.final_object_key.unwrap();
        assert!(h.blobs.get(&key).await.unwrap().is_empty());
    }

    #[test]
    fn filenames_reduce_to_safe_keys() {
        assert_eq!(sanitize_filename("movie.mp4"), "movie.mp4");
        assert_eq!(sanitize_filename("my file (1).mp4"), "my_file__1_.mp4");
        assert_eq!(sanitize_filename("../../etc/passwd"), "._._etc_passwd");
        assert_eq!(sanitize_filename(""), "object");
        assert_eq!(sanitize_filename("..."), "object");
    }
}
