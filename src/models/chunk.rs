//! Represents a single received chunk of an upload session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One received chunk, keyed by `(session_id, chunk_index)`.
///
/// Re-uploading the same index overwrites the stored bytes and this row
/// rather than duplicating either, so chunk retries are idempotent. The
/// recorded size lets the range server compute global byte offsets without
/// fetching chunk payloads.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct ChunkRecord {
    /// Parent session token.
    pub session_id: String,

    /// 0-based index within the file.
    pub chunk_index: i64,

    /// Deterministic blob key the payload lives under.
    pub storage_key: String,

    /// Size in bytes of the stored payload.
    pub size_bytes: i64,

    /// Timestamp when this chunk (last) arrived.
    pub received_at: DateTime<Utc>,
}
