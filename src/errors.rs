use crate::range::RangeError;
use crate::services::UploadError;
use crate::storage::BlobError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

/// Map service failures onto HTTP statuses. Retryable conditions get codes
/// a client is expected to retry (503); terminal ones get 4xx.
impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        let status = match &err {
            UploadError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            UploadError::SessionExpired(_) => StatusCode::GONE,
            UploadError::InvalidTransition { .. } | UploadError::IncompleteUpload { .. } => {
                StatusCode::CONFLICT
            }
            UploadError::ChunkIndexOutOfRange { .. } | UploadError::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            UploadError::ChunkNotAvailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            UploadError::AssemblyFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            UploadError::Blob(BlobError::NotFound(_)) => StatusCode::NOT_FOUND,
            UploadError::Blob(BlobError::InvalidKey) => StatusCode::BAD_REQUEST,
            UploadError::Blob(_) | UploadError::Sqlx(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError::new(status, err.to_string())
    }
}

impl From<BlobError> for AppError {
    fn from(err: BlobError) -> Self {
        match &err {
            BlobError::NotFound(_) => AppError::not_found(err.to_string()),
            BlobError::InvalidKey => AppError::new(StatusCode::BAD_REQUEST, err.to_string()),
            BlobError::Io(_) => AppError::internal(err.to_string()),
        }
    }
}

impl From<RangeError> for AppError {
    fn from(err: RangeError) -> Self {
        let status = match err {
            RangeError::Malformed => StatusCode::BAD_REQUEST,
            RangeError::Unsatisfiable => StatusCode::RANGE_NOT_SATISFIABLE,
        };
        AppError::new(status, err.to_string())
    }
}
