//! Byte-range serving of uploads, before and after assembly.
//!
//! While a session is still chunked, a requested range is mapped onto the
//! chunks that cover it and the sub-slices are streamed back as `206`.
//! Once the final object exists it is the source of truth, and both `GET`
//! and `HEAD` redirect to its URL instead.

use crate::{
    errors::AppError,
    models::UploadSession,
    range::{self, ByteRange, DEFAULT_RANGE_WINDOW},
    services::AppState,
};
use axum::{
    Json,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Redirect, Response},
};
use serde_json::json;
use std::{collections::HashMap, io};

/// HEAD `/uploads/{id}/content` — size and type without touching chunk data.
pub async fn head_content(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let session = state.sessions.fetch_current(&id).await?;
    if let Some(url) = &session.final_object_url {
        return Ok(Redirect::temporary(url).into_response());
    }

    let mut response = Response::new(Body::empty());
    set_content_headers(response.headers_mut(), &session, None);
    Ok(response)
}

/// GET `/uploads/{id}/content` — serve bytes by range.
///
/// Open-ended ranges (and rangeless requests) are capped at a 2MB window;
/// a range whose covering chunks have not all arrived yet answers with an
/// explicit not-yet-available condition the client can retry.
pub async fn get_content(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let session = state.sessions.fetch_current(&id).await?;
    if let Some(url) = &session.final_object_url {
        return Ok(Redirect::temporary(url).into_response());
    }

    let file_size = session.file_size_bytes.max(0) as u64;
    if file_size == 0 {
        let mut response = Response::new(Body::empty());
        set_content_headers(response.headers_mut(), &session, None);
        return Ok(response);
    }

    let range = match headers.get(header::RANGE) {
        Some(value) => {
            let value = value
                .to_str()
                .map_err(|_| AppError::new(StatusCode::BAD_REQUEST, "unreadable Range header"))?;
            range::parse_range_header(value, file_size, DEFAULT_RANGE_WINDOW)?
        }
        None => ByteRange {
            start: 0,
            end: file_size.min(DEFAULT_RANGE_WINDOW) - 1,
        },
    };

    let slices = range::covering_chunks(range, session.chunk_size_bytes.max(1) as u64);

    // Presence and bounds check from recorded chunk metadata alone, before
    // any payload fetch.
    let sizes: HashMap<u64, i64> = state
        .sessions
        .chunk_records(&id)
        .await?
        .into_iter()
        .map(|record| (record.chunk_index as u64, record.size_bytes))
        .collect();
    for slice in &slices {
        match sizes.get(&slice.index) {
            None => return Ok(not_yet_available(&id, slice.index)),
            Some(&size) if (slice.offset + slice.len) as i64 > size => {
                return Err(AppError::internal(format!(
                    "chunk {} shorter than its recorded span",
                    slice.index
                )));
            }
            Some(_) => {}
        }
    }

    let mut parts = Vec::with_capacity(slices.len());
    for slice in &slices {
        let bytes = match state.chunks.get(&id, slice.index).await {
            Ok(bytes) => bytes,
            // Lost a race with GC or expiry between the check and the read.
            Err(_) => return Ok(not_yet_available(&id, slice.index)),
        };
        let start = slice.offset as usize;
        let end = start + slice.len as usize;
        if end > bytes.len() {
            return Err(AppError::internal(format!(
                "chunk {} payload shorter than its record",
                slice.index
            )));
        }
        parts.push(Ok::<_, io::Error>(bytes.slice(start..end)));
    }

    let mut response = Response::new(Body::from_stream(futures::stream::iter(parts)));
    *response.status_mut() = StatusCode::PARTIAL_CONTENT;
    set_content_headers(response.headers_mut(), &session, Some(range));
    Ok(response)
}

/// GET `/blobs/{*key}` — stream an assembled object (or any stored blob).
pub async fn download_blob(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Response, AppError> {
    let reader = state.blobs.open(&key).await?;

    let mut response = Response::new(Body::from_stream(reader.stream));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&reader.size_bytes.to_string())
            .unwrap_or_else(|_| HeaderValue::from_static("0")),
    );
    Ok(response)
}

fn set_content_headers(headers: &mut HeaderMap, session: &UploadSession, range: Option<ByteRange>) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&session.mime_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(
        header::ACCEPT_RANGES,
        HeaderValue::from_static("bytes"),
    );

    let file_size = session.file_size_bytes.max(0);
    match range {
        Some(range) => {
            headers.insert(
                header::CONTENT_LENGTH,
                HeaderValue::from_str(&range.len().to_string())
                    .unwrap_or_else(|_| HeaderValue::from_static("0")),
            );
            let content_range = format!("bytes {}-{}/{}", range.start, range.end, file_size);
            if let Ok(value) = HeaderValue::from_str(&content_range) {
                headers.insert(header::CONTENT_RANGE, value);
            }
        }
        None => {
            headers.insert(
                header::CONTENT_LENGTH,
                HeaderValue::from_str(&file_size.to_string())
                    .unwrap_or_else(|_| HeaderValue::from_static("0")),
            );
        }
    }
}

/// Explicitly retryable condition, distinct from a generic error: the range
/// is valid, its chunks just have not arrived yet.
fn not_yet_available(session_id: &str, index: u64) -> Response {
    let body = Json(json!({
        "error": format!("chunk {index} of session `{session_id}` is not yet available"),
        "code": "range_not_yet_available",
        "status": StatusCode::SERVICE_UNAVAILABLE.as_u16(),
    }));
    let mut response = (StatusCode::SERVICE_UNAVAILABLE, body).into_response();
    response
        .headers_mut()
        .insert(header::RETRY_AFTER, HeaderValue::from_static("2"));
    response
}
