//! Core data models for the resumable upload service.
//!
//! These entities represent upload sessions and the chunks received for
//! them. They map cleanly to database tables via `sqlx::FromRow` and
//! serialize naturally as JSON via `serde`.

pub mod chunk;
pub mod session;

pub use chunk::ChunkRecord;
pub use session::{AssemblyPhase, FinalizeStatus, SessionStatus, UploadSession};
