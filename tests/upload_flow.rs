//! End-to-end exercises of the upload engine: the full client → chunk store
//! → finalize → assembled object path through the library surface, and the
//! HTTP surface via the router.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use bytes::Bytes;
use http_body_util::BodyExt;
use sqlx::sqlite::SqlitePoolOptions;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;
use uplink::client::{JsonFileProgressStore, LocalTransport, RetryPolicy, UploadRequest, Uploader, UploaderConfig};
use uplink::models::SessionStatus;
use uplink::services::{
    AppState, AssemblyConfig, AssemblyPipeline, ChunkStore, LoggingRecordCreator, SessionService,
    apply_migrations,
};
use uplink::storage::{BlobError, BlobReader, BlobResult, BlobStore, BlobWriter, FsBlobStore, PutOutcome};

/// Blob store decorator that fails `get` for keys ending in a suffix, a
/// configured number of times, then recovers. Stands in for a storage
/// hiccup during one assembly batch.
struct FlakyBlobStore {
    inner: Arc<dyn BlobStore>,
    fail_suffix: String,
    remaining: Mutex<u32>,
}

#[async_trait]
impl BlobStore for FlakyBlobStore {
    async fn put(&self, key: &str, bytes: Bytes, content_type: Option<&str>) -> BlobResult<PutOutcome> {
        self.inner.put(key, bytes, content_type).await
    }

    async fn get(&self, key: &str) -> BlobResult<Bytes> {
        if key.ends_with(&self.fail_suffix) {
            let mut remaining = self.remaining.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(BlobError::Io(std::io::Error::other("injected storage fault")));
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

    async fn writer(&self, key: &str, content_type: Option<&str>) -> BlobResult<Box<dyn BlobWriter>> {
        self.inner.writer(key, content_type).await
    }

    fn download_url(&self, key: &str) -> String {
        self.inner.download_url(key)
    }
}

struct TestApp {
    _dir: TempDir,
    state: AppState,
}

async fn test_app(blobs: impl FnOnce(Arc<dyn BlobStore>) -> Arc<dyn BlobStore>) -> TestApp {
    let dir = TempDir::new().unwrap();
    let db = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    apply_migrations(&db).await.unwrap();
    let db = Arc::new(db);

    let fs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(dir.path().join("blobs"), "/blobs"));
    let blobs = blobs(fs);
    let sessions = SessionService::new(Arc::clone(&db), chrono::Duration::hours(24));
    let chunks = ChunkStore::new(Arc::clone(&blobs));
    let assembly = AssemblyPipeline::new(
        sessions.clone(),
        chunks.clone(),
        Arc::clone(&blobs),
        Arc::new(LoggingRecordCreator),
        AssemblyConfig {
            batch_size: 10,
            chunk_fetch_backoff: Duration::from_millis(1),
            ..AssemblyConfig::default()
        },
    );

    let state = AppState {
        db,
        sessions,
        chunks,
        assembly,
        blobs,
        storage_dir: dir.path().join("blobs"),
        default_chunk_size_bytes: 512,
    };
    TestApp { _dir: dir, state }
}

fn patterned(len: usize) -> Bytes {
    Bytes::from((0..len).map(|i| (i % 249) as u8).collect::<Vec<u8>>())
}

/// The 259MB-with-5MB-chunks scenario from the design, scaled down to 512B
/// chunks with the same counts: 52 chunks, batch size 10, six batches, a
/// transient storage fault on a batch-3 chunk that recovers within the
/// retry budget. Driven end-to-end through the client orchestrator.
#[tokio::test]
async fn fifty_two_chunk_upload_survives_batch_fault() {
    let app = test_app(|fs| {
        Arc::new(FlakyBlobStore {
            inner: fs,
            // Chunk 25 sits in the third assembly batch (indices 20..30).
            fail_suffix: "/000025".into(),
            remaining: Mutex::new(2),
        })
    })
    .await;

    // 51 full chunks plus a 200-byte tail = 52 chunks.
    let data = patterned(51 * 512 + 200);
    let transport = LocalTransport::new(
        app.state.sessions.clone(),
        app.state.chunks.clone(),
        app.state.assembly.clone(),
    );
    let progress_dir = TempDir::new().unwrap();
    let uploader = Uploader::new(
        Arc::new(transport),
        Arc::new(JsonFileProgressStore::new(progress_dir.path())),
        UploaderConfig {
            concurrency: 4,
            retry: RetryPolicy {
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(4),
                max_attempts: 3,
            },
            auto_resume_cooldown: Duration::from_millis(10),
            persist_every: 5,
            poll_interval: Duration::from_millis(5),
            chunk_size_bytes: 512,
            ..UploaderConfig::default()
        },
    );

    let done = uploader
        .upload(UploadRequest {
            owner_id: "owner-1".into(),
            filename: "large.mp4".into(),
            mime_type: "video/mp4".into(),
            data: data.clone(),
            resume_session_id: None,
        })
        .await
        .unwrap();
    assert_eq!(done.total_chunks, 52);

    let session = app.state.sessions.fetch(&done.session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.assembly_progress, 52);

    // Byte-identical final object despite the injected batch fault.
    let key = session.final_object_key.unwrap();
    let assembled = app.state.blobs.get(&key).await.unwrap();
    assert_eq!(&assembled[..], &data[..]);

    // Chunks were garbage-collected after assembly.
    for index in 0..52 {
        assert!(app.state.chunks.get(&done.session_id, index).await.is_err());
    }
}

/// Cancelling one session must not disturb another mid-upload, and the
/// cancelled session must reject further chunks.
#[tokio::test]
async fn cancel_isolates_sessions() {
    let app = test_app(|fs| fs).await;
    let sessions = &app.state.sessions;
    let chunks = &app.state.chunks;

    let data = patterned(52 * 512);
    let a = sessions
        .create(uplink::services::NewSession {
            owner_id: "owner-a".into(),
            filename: "a.mp4".into(),
            mime_type: "video/mp4".into(),
            file_size_bytes: data.len() as i64,
            chunk_size_bytes: 512,
        })
        .await
        .unwrap();
    let b = sessions
        .create(uplink::services::NewSession {
            owner_id: "owner-b".into(),
            filename: "b.mp4".into(),
            mime_type: "video/mp4".into(),
            file_size_bytes: data.len() as i64,
            chunk_size_bytes: 512,
        })
        .await
        .unwrap();

    for index in 0..10u64 {
        let chunk = uplink::codec::chunk_slice(&data, 512, index).unwrap();
        let outcome = chunks.put(&a.id, a.total_chunks, index, chunk.clone()).await.unwrap();
        sessions
            .record_chunk_received(&a, index, &outcome.key, chunk.len() as i64)
            .await
            .unwrap();
        let outcome = chunks.put(&b.id, b.total_chunks, index, chunk.clone()).await.unwrap();
        sessions
            .record_chunk_received(&b, index, &outcome.key, chunk.len() as i64)
            .await
            .unwrap();
    }

    let cancelled = sessions.cancel(&a.id).await.unwrap();
    assert_eq!(cancelled.status, SessionStatus::Expired);

    // Session A rejects further uploads.
    let err = sessions
        .record_chunk_received(&cancelled, 10, "k", 512)
        .await
        .unwrap_err();
    assert!(matches!(err, uplink::services::UploadError::SessionExpired(_)));

    // Session B is untouched and keeps going.
    assert_eq!(sessions.received_count(&b.id).await.unwrap(), 10);
    let chunk = uplink::codec::chunk_slice(&data, 512, 10).unwrap();
    let outcome = chunks.put(&b.id, b.total_chunks, 10, chunk.clone()).await.unwrap();
    let count = sessions
        .record_chunk_received(&b, 10, &outcome.key, chunk.len() as i64)
        .await
        .unwrap();
    assert_eq!(count, 11);
}

async fn send(app: &TestApp, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Bytes) {
    let router = uplink::routes::routes::routes().with_state(app.state.clone());
    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, headers, body)
}

fn json_of(body: &Bytes) -> serde_json::Value {
    serde_json::from_slice(body).unwrap()
}

/// Drive the whole lifecycle over HTTP: create, upload with ranges served
/// mid-flight, finalize with polling, then redirect + download of the
/// assembled object.
#[tokio::test]
async fn http_surface_round_trip() {
    let app = test_app(|fs| fs).await;
    let data = patterned(3 * 512 + 100); // 4 chunks, last partial

    // Create the session.
    let (status, _, body) = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/uploads")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                serde_json::json!({
                    "owner_id": "owner-1",
                    "filename": "clip.mp4",
                    "mime_type": "video/mp4",
                    "file_size_bytes": data.len(),
                })
                .to_string(),
            ))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let session = json_of(&body);
    let id = session["id"].as_str().unwrap().to_string();
    assert_eq!(session["total_chunks"], 4);
    assert_eq!(session["status"], "active");

    // Upload chunks 0 and 1.
    for index in 0..2u64 {
        let chunk = uplink::codec::chunk_slice(&data, 512, index).unwrap();
        let (status, _, body) = send(
            &app,
            Request::builder()
                .method("PUT")
                .uri(format!("/uploads/{id}/chunks/{index}"))
                .body(Body::from(chunk))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_of(&body)["received_chunks"], index as i64 + 1);
    }

    // HEAD advertises size and range support without touching chunks.
    let (status, headers, _) = send(
        &app,
        Request::builder()
            .method("HEAD")
            .uri(format!("/uploads/{id}/content"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::ACCEPT_RANGES], "bytes");
    assert_eq!(headers[header::CONTENT_TYPE], "video/mp4");
    assert_eq!(
        headers[header::CONTENT_LENGTH],
        data.len().to_string().as_str()
    );

    // A range spanning chunks 0 and 1 is served pre-assembly.
    let (status, headers, body) = send(
        &app,
        Request::builder()
            .uri(format!("/uploads/{id}/content"))
            .header(header::RANGE, "bytes=500-600")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        headers[header::CONTENT_RANGE],
        format!("bytes 500-600/{}", data.len()).as_str()
    );
    assert_eq!(&body[..], &data[500..=600]);

    // A range over a chunk that has not arrived is explicitly retryable.
    let (status, headers, body) = send(
        &app,
        Request::builder()
            .uri(format!("/uploads/{id}/content"))
            .header(header::RANGE, "bytes=1500-1600")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(headers[header::RETRY_AFTER], "2");
    assert_eq!(json_of(&body)["code"], "range_not_yet_available");

    // Finalize before all chunks are in is a conflict.
    let (status, _, _) = send(
        &app,
        Request::builder()
            .method("POST")
            .uri(format!("/uploads/{id}/finalize"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    // Upload the rest (re-sending chunk 1 on the way: idempotent).
    for index in 1..4u64 {
        let chunk = uplink::codec::chunk_slice(&data, 512, index).unwrap();
        let (status, _, _) = send(
            &app,
            Request::builder()
                .method("PUT")
                .uri(format!("/uploads/{id}/chunks/{index}"))
                .body(Body::from(chunk))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }
    let (_, _, body) = send(
        &app,
        Request::builder()
            .uri(format!("/uploads/{id}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(json_of(&body)["received_chunks"], 4);

    // Finalize now begins assembly.
    let (status, _, _) = send(
        &app,
        Request::builder()
            .method("POST")
            .uri(format!("/uploads/{id}/finalize"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    // Poll until assembly completes.
    let mut phase = String::new();
    for _ in 0..200 {
        let (status, _, body) = send(
            &app,
            Request::builder()
                .uri(format!("/uploads/{id}/finalize"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        phase = json_of(&body)["phase"].as_str().unwrap().to_string();
        if phase == "complete" || phase == "failed" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(phase, "complete");

    // Content now redirects to the assembled object...
    let (status, headers, _) = send(
        &app,
        Request::builder()
            .uri(format!("/uploads/{id}/content"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::TEMPORARY_REDIRECT);
    let location = headers[header::LOCATION].to_str().unwrap().to_string();
    assert!(location.starts_with("/blobs/"), "unexpected location {location}");

    // ...and the object downloads byte-identical.
    let (status, _, body) = send(
        &app,
        Request::builder()
            .uri(location.as_str())
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], &data[..]);
}

/// DELETE cancels over HTTP; the session is gone for upload purposes.
#[tokio::test]
async fn http_cancel_rejects_further_chunks() {
    let app = test_app(|fs| fs).await;
    let data = patterned(1024);

    let (_, _, body) = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/uploads")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                serde_json::json!({
                    "owner_id": "owner-1",
                    "filename": "clip.mp4",
                    "mime_type": "video/mp4",
                    "file_size_bytes": data.len(),
                })
                .to_string(),
            ))
            .unwrap(),
    )
    .await;
    let id = json_of(&body)["id"].as_str().unwrap().to_string();

    let (status, _, _) = send(
        &app,
        Request::builder()
            .method("DELETE")
            .uri(format!("/uploads/{id}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let chunk = uplink::codec::chunk_slice(&data, 512, 0).unwrap();
    let (status, _, _) = send(
        &app,
        Request::builder()
            .method("PUT")
            .uri(format!("/uploads/{id}/chunks/0"))
            .body(Body::from(chunk))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::GONE);
}
