//! Turns "upload this file" into a resilient sequence of chunk sends.
//!
//! One orchestrator owns a single upload slot: files queue strictly behind
//! one another instead of interleaving on a constrained uplink. Within the
//! active file, at most `K` chunk sends are in flight. Chunk failures retry
//! with exponential backoff; an exhausted retry budget pauses the whole
//! session locally (flaky mobile links are the common case, not the
//! exception) and a cooldown timer resumes it, unless the caller resumes or
//! cancels first.

use crate::client::backoff::RetryPolicy;
use crate::client::progress::{ClientUploadRecord, ProgressStore};
use crate::client::transport::{SessionHandle, TransportError, UploadTransport};
use crate::codec;
use crate::models::AssemblyPhase;
use crate::services::NewSession;
use bytes::Bytes;
use chrono::Utc;
use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

/// Client-side tunables. The defaults match a flaky consumer uplink; tests
/// shrink every duration to keep themselves fast.
#[derive(Debug, Clone)]
pub struct UploaderConfig {
    /// Max chunk sends in flight at once (`K`).
    pub concurrency: usize,
    pub retry: RetryPolicy,
    /// How long an auto-paused session waits before resuming on its own.
    pub auto_resume_cooldown: Duration,
    /// Persist local progress every this many acknowledged chunks (`M`).
    /// Coarser persistence trades at most `M - 1` redundant re-sends after
    /// a crash for less write amplification; chunk sends are idempotent.
    pub persist_every: u64,
    /// Poll cadence while the server assembles the final object.
    pub poll_interval: Duration,
    pub chunk_size_bytes: u64,
    /// Local progress records older than this are purged; they mirror
    /// sessions the server has expired anyway.
    pub record_ttl: chrono::Duration,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            retry: RetryPolicy::default(),
            auto_resume_cooldown: Duration::from_secs(30),
            persist_every: 5,
            poll_interval: Duration::from_secs(2),
            chunk_size_bytes: 5 * 1024 * 1024,
            record_ttl: chrono::Duration::hours(24),
        }
    }
}

/// One file to upload.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub owner_id: String,
    pub filename: String,
    pub mime_type: String,
    pub data: Bytes,
    /// Session to resume. Ignored when it no longer resolves server-side;
    /// a fresh session is created instead.
    pub resume_session_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CompletedUpload {
    pub session_id: String,
    pub total_chunks: u64,
}

#[derive(Debug, Error)]
pub enum UploadAbort {
    #[error("upload cancelled")]
    Cancelled,
    #[error("upload rejected: {0}")]
    Rejected(TransportError),
    #[error("finalize failed server-side for session `{session_id}`")]
    FinalizeFailed { session_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ControlState {
    Running,
    Paused { reason: String, auto: bool },
    Cancelled,
}

/// Per-session control plane shared between the upload driver, its send
/// workers, and external pause/resume/cancel calls.
struct SessionControl {
    state: watch::Sender<ControlState>,
    auto_resume: StdMutex<Option<AbortHandle>>,
}

impl SessionControl {
    fn new() -> Arc<Self> {
        let (state, _) = watch::channel(ControlState::Running);
        Arc::new(Self {
            state,
            auto_resume: StdMutex::new(None),
        })
    }

    fn snapshot(&self) -> ControlState {
        self.state.borrow().clone()
    }

    fn is_cancelled(&self) -> bool {
        matches!(*self.state.borrow(), ControlState::Cancelled)
    }

    fn is_paused(&self) -> bool {
        matches!(*self.state.borrow(), ControlState::Paused { .. })
    }

    fn set_paused(&self, reason: &str, auto: bool) {
        self.state.send_if_modified(|state| match state {
            ControlState::Cancelled => false,
            _ => {
                *state = ControlState::Paused {
                    reason: reason.to_string(),
                    auto,
                };
                true
            }
        });
    }

    fn set_running(&self) {
        self.abort_timer();
        self.state.send_if_modified(|state| match state {
            ControlState::Cancelled | ControlState::Running => false,
            _ => {
                *state = ControlState::Running;
                true
            }
        });
    }

    /// Cooldown path: only flips an *auto* pause back to running, so a
    /// manual pause issued during the cooldown wins.
    fn resume_if_auto_paused(&self) {
        self.state.send_if_modified(|state| match state {
            ControlState::Paused { auto: true, .. } => {
                *state = ControlState::Running;
                true
            }
            _ => false,
        });
    }

    fn set_cancelled(&self) {
        self.abort_timer();
        self.state.send_replace(ControlState::Cancelled);
    }

    fn abort_timer(&self) {
        if let Some(handle) = self.auto_resume.lock().unwrap().take() {
            handle.abort();
        }
    }
}

/// Outcome shared between send workers and the dispatch loop.
#[derive(Default)]
struct WaveState {
    acked: Vec<u64>,
    exhausted: Option<String>,
    permanent: Option<TransportError>,
}

impl WaveState {
    fn doomed(&self) -> bool {
        self.exhausted.is_some() || self.permanent.is_some()
    }
}

enum WaveEnd {
    Drained,
    Cancelled,
}

#[derive(Clone)]
pub struct Uploader {
    transport: Arc<dyn UploadTransport>,
    progress: Arc<dyn ProgressStore>,
    cfg: UploaderConfig,
    /// The single upload slot: acquisition order is queue order.
    slot: Arc<AsyncMutex<()>>,
    controls: Arc<StdMutex<HashMap<String, Arc<SessionControl>>>>,
}

impl Uploader {
    pub fn new(
        transport: Arc<dyn UploadTransport>,
        progress: Arc<dyn ProgressStore>,
        cfg: UploaderConfig,
    ) -> Self {
        Self {
            transport,
            progress,
            cfg,
            slot: Arc::new(AsyncMutex::new(())),
            controls: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    /// Upload one file to completion, resuming server-side progress where
    /// possible. A second call while a file is uploading queues entirely
    /// behind it.
    pub async fn upload(&self, req: UploadRequest) -> Result<CompletedUpload, UploadAbort> {
        let _slot = self.slot.lock().await;

        if let Err(err) = self.progress.purge_stale(self.cfg.record_ttl).await {
            debug!("progress purge failed: {}", err);
        }

        let handle = self.resolve_or_create(&req).await?;
        let session_id = handle.session_id.clone();
        let ctl = SessionControl::new();
        self.controls
            .lock()
            .unwrap()
            .insert(session_id.clone(), Arc::clone(&ctl));

        let result = self.drive(&req, &handle, &ctl).await;
        self.controls.lock().unwrap().remove(&session_id);
        result
    }

    /// Manually pause an in-progress upload. Also asks the server to mark
    /// the session paused, best-effort.
    pub async fn pause(&self, session_id: &str, reason: &str) {
        if let Some(ctl) = self.control(session_id) {
            ctl.set_paused(reason, false);
        }
        if let Err(err) = self.transport.pause_session(session_id).await {
            debug!(session_id, "server pause failed: {}", err);
        }
    }

    /// Manually resume a paused upload, cancelling any pending auto-resume
    /// timer.
    pub async fn resume(&self, session_id: &str) {
        if let Some(ctl) = self.control(session_id) {
            ctl.set_running();
        }
        if let Err(err) = self.transport.resume_session(session_id).await {
            debug!(session_id, "server resume failed: {}", err);
        }
    }

    /// Cancel an upload. Queued chunk sends for the session are dropped
    /// without starting; in-flight sends are abandoned to finish or fail on
    /// their own. Other sessions are untouched.
    pub async fn cancel(&self, session_id: &str) {
        if let Some(ctl) = self.control(session_id) {
            ctl.set_cancelled();
        }
        // Best-effort "abandon this session" signal to the server.
        if let Err(err) = self.transport.cancel_session(session_id).await {
            debug!(session_id, "server cancel failed: {}", err);
        }
    }

    fn control(&self, session_id: &str) -> Option<Arc<SessionControl>> {
        self.controls.lock().unwrap().get(session_id).cloned()
    }

    async fn resolve_or_create(&self, req: &UploadRequest) -> Result<SessionHandle, UploadAbort> {
        if let Some(session_id) = &req.resume_session_id {
            match self.transport.resolve_session(session_id).await {
                Ok(Some(handle)) => {
                    info!(
                        session_id = %session_id,
                        resumed_chunks = handle.received_indices.len(),
                        "resuming upload session"
                    );
                    return Ok(handle);
                }
                Ok(None) => {
                    // Stale local record; the server-side session is gone.
                    if let Err(err) = self.progress.remove(session_id).await {
                        debug!(session_id = %session_id, "could not drop stale progress record: {}", err);
                    }
                }
                Err(err) => return Err(UploadAbort::Rejected(err)),
            }
        }

        self.transport
            .create_session(NewSession {
                owner_id: req.owner_id.clone(),
                filename: req.filename.clone(),
                mime_type: req.mime_type.clone(),
                file_size_bytes: req.data.len() as i64,
                chunk_size_bytes: self.cfg.chunk_size_bytes as i64,
            })
            .await
            .map_err(UploadAbort::Rejected)
    }

    async fn drive(
        &self,
        req: &UploadRequest,
        handle: &SessionHandle,
        ctl: &Arc<SessionControl>,
    ) -> Result<CompletedUpload, UploadAbort> {
        let total = handle.total_chunks;
        let mut done: BTreeSet<u64> = handle.received_indices.iter().copied().collect();
        let mut persisted_at = done.len() as u64;

        loop {
            match ctl.snapshot() {
                ControlState::Cancelled => return Err(UploadAbort::Cancelled),
                ControlState::Paused { reason, auto } => {
                    if auto {
                        self.schedule_auto_resume(ctl);
                    }
                    warn!(
                        session_id = %handle.session_id,
                        reason = %reason,
                        "upload paused"
                    );
                    self.wait_while_paused(ctl).await?;
                    continue;
                }
                ControlState::Running => {}
            }

            let pending: Vec<u64> = (0..total).filter(|i| !done.contains(i)).collect();
            if pending.is_empty() {
                break;
            }

            match self
                .send_wave(req, handle, &pending, ctl, &mut done, &mut persisted_at)
                .await?
            {
                WaveEnd::Drained => continue,
                WaveEnd::Cancelled => return Err(UploadAbort::Cancelled),
            }
        }

        self.persist(req, handle, &done).await;
        self.finalize_and_poll(handle, ctl).await?;

        if let Err(err) = self.progress.remove(&handle.session_id).await {
            debug!(session_id = %handle.session_id, "could not remove progress record: {}", err);
        }
        info!(session_id = %handle.session_id, total_chunks = total, "upload complete");
        Ok(CompletedUpload {
            session_id: handle.session_id.clone(),
            total_chunks: total,
        })
    }

    /// Dispatch pending chunk sends, at most `K` in flight. Returns once
    /// every dispatched send has landed, unless the session is cancelled,
    /// in which case in-flight sends are abandoned rather than awaited.
    async fn send_wave(
        &self,
        req: &UploadRequest,
        handle: &SessionHandle,
        pending: &[u64],
        ctl: &Arc<SessionControl>,
        done: &mut BTreeSet<u64>,
        persisted_at: &mut u64,
    ) -> Result<WaveEnd, UploadAbort> {
        let k = self.cfg.concurrency.max(1);
        let sem = Arc::new(Semaphore::new(k));
        let state = Arc::new(StdMutex::new(WaveState::default()));

        for &index in pending {
            // Checked before every dequeue: cancellation and pause both stop
            // further sends cooperatively.
            if ctl.is_cancelled() || ctl.is_paused() || state.lock().unwrap().doomed() {
                break;
            }

            // Waiting here is what bounds concurrency; the permit travels
            // into the worker and is released when the send finishes.
            let permit = Arc::clone(&sem).acquire_owned().await.expect("semaphore open");
            self.harvest(req, handle, &state, done, persisted_at).await;

            let bytes = codec::chunk_slice(&req.data, handle.chunk_size_bytes, index)
                .unwrap_or_else(Bytes::new);
            tokio::spawn(send_one(
                Arc::clone(&self.transport),
                self.cfg.retry.clone(),
                handle.session_id.clone(),
                index,
                bytes,
                Arc::clone(ctl),
                Arc::clone(&state),
                permit,
            ));
        }

        if ctl.is_cancelled() {
            // Abandon in-flight sends; they observe the flag between retries.
            return Ok(WaveEnd::Cancelled);
        }

        // Barrier: every worker holds a permit until it finishes.
        let _all = sem
            .acquire_many(k as u32)
            .await
            .expect("semaphore open");
        drop(_all);
        self.harvest(req, handle, &state, done, persisted_at).await;

        let mut state = state.lock().unwrap();
        if let Some(err) = state.permanent.take() {
            return Err(UploadAbort::Rejected(err));
        }
        if ctl.is_cancelled() {
            return Ok(WaveEnd::Cancelled);
        }
        if let Some(reason) = state.exhausted.take() {
            // Auto-pause the session rather than failing the upload.
            ctl.set_paused(&reason, true);
        }
        Ok(WaveEnd::Drained)
    }

    /// Fold freshly acknowledged chunks into `done` and persist every `M`.
    async fn harvest(
        &self,
        req: &UploadRequest,
        handle: &SessionHandle,
        state: &Arc<StdMutex<WaveState>>,
        done: &mut BTreeSet<u64>,
        persisted_at: &mut u64,
    ) {
        {
            let mut state = state.lock().unwrap();
            for index in state.acked.drain(..) {
                done.insert(index);
            }
        }
        if done.len() as u64 >= *persisted_at + self.cfg.persist_every {
            self.persist(req, handle, done).await;
            *persisted_at = done.len() as u64;
        }
    }

    /// Progress persistence is best-effort by design: the server's received
    /// set is the source of truth, a lost record only costs re-sends.
    async fn persist(&self, req: &UploadRequest, handle: &SessionHandle, done: &BTreeSet<u64>) {
        let record = ClientUploadRecord {
            session_id: handle.session_id.clone(),
            filename: req.filename.clone(),
            file_size_bytes: req.data.len() as i64,
            uploaded_chunk_indices: done.iter().copied().collect(),
            created_at: Utc::now(),
        };
        if let Err(err) = self.progress.save(&record).await {
            warn!(session_id = %handle.session_id, "could not persist progress: {}", err);
        }
    }

    /// One cooldown timer per paused session; a manual resume aborts it.
    fn schedule_auto_resume(&self, ctl: &Arc<SessionControl>) {
        let cooldown = self.cfg.auto_resume_cooldown;
        let ctl_task = Arc::clone(ctl);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(cooldown).await;
            ctl_task.resume_if_auto_paused();
        });
        let mut slot = ctl.auto_resume.lock().unwrap();
        if let Some(previous) = slot.replace(handle.abort_handle()) {
            previous.abort();
        }
    }

    async fn wait_while_paused(&self, ctl: &Arc<SessionControl>) -> Result<(), UploadAbort> {
        let mut rx = ctl.state.subscribe();
        let state = rx
            .wait_for(|state| !matches!(state, ControlState::Paused { .. }))
            .await
            .map_err(|_| UploadAbort::Cancelled)?;
        if *state == ControlState::Cancelled {
            return Err(UploadAbort::Cancelled);
        }
        Ok(())
    }

    /// Finalize, then poll: assembly of a large file is asynchronous from
    /// the client's perspective.
    async fn finalize_and_poll(
        &self,
        handle: &SessionHandle,
        ctl: &Arc<SessionControl>,
    ) -> Result<(), UploadAbort> {
        let mut attempt = 1;
        loop {
            if ctl.is_cancelled() {
                return Err(UploadAbort::Cancelled);
            }
            match self.transport.finalize(&handle.session_id).await {
                Ok(_) => break,
                Err(err) if err.is_transient() && !self.cfg.retry.exhausted(attempt) => {
                    tokio::time::sleep(self.cfg.retry.delay_for(attempt)).await;
                    attempt += 1;
                }
                Err(err) => return Err(UploadAbort::Rejected(err)),
            }
        }

        loop {
            if ctl.is_cancelled() {
                return Err(UploadAbort::Cancelled);
            }
            match self.transport.finalize_status(&handle.session_id).await {
                Ok(status) => match status.phase {
                    AssemblyPhase::Complete => return Ok(()),
                    AssemblyPhase::Failed => {
                        return Err(UploadAbort::FinalizeFailed {
                            session_id: handle.session_id.clone(),
                        });
                    }
                    _ => {
                        debug!(
                            session_id = %handle.session_id,
                            progress = status.progress,
                            total = status.total_chunks,
                            "assembly in progress"
                        );
                    }
                },
                // A dropped poll is harmless; the next one answers.
                Err(err) if err.is_transient() => {
                    debug!(session_id = %handle.session_id, "status poll failed: {}", err);
                }
                Err(err) => return Err(UploadAbort::Rejected(err)),
            }
            tokio::time::sleep(self.cfg.poll_interval).await;
        }
    }
}

/// Send one chunk, retrying transient failures with backoff. Runs detached;
/// the permit it holds is the concurrency bound, the shared wave state is
/// the result channel.
#[allow(clippy::too_many_arguments)]
async fn send_one(
    transport: Arc<dyn UploadTransport>,
    policy: RetryPolicy,
    session_id: String,
    index: u64,
    bytes: Bytes,
    ctl: Arc<SessionControl>,
    state: Arc<StdMutex<WaveState>>,
    permit: OwnedSemaphorePermit,
) {
    let _permit = permit;
    let mut attempt = 1;
    loop {
        if ctl.is_cancelled() {
            return;
        }
        match transport.upload_chunk(&session_id, index, bytes.clone()).await {
            Ok(()) => {
                state.lock().unwrap().acked.push(index);
                return;
            }
            Err(err) if err.is_transient() => {
                if policy.exhausted(attempt) {
                    let reason =
                        format!("chunk {index} failed after {attempt} attempts: {err}");
                    state.lock().unwrap().exhausted.get_or_insert(reason);
                    return;
                }
                let delay = policy.delay_for(attempt);
                debug!(
                    session_id = %session_id,
                    index,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "chunk send failed, backing off: {}",
                    err
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                // Permanent: abandon immediately, spend no retry budget.
                state.lock().unwrap().permanent.get_or_insert(err);
                return;
            }
        }
    }
}
