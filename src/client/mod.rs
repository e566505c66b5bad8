//! Client-side upload machinery: chunk production, bounded-concurrency
//! sends with retry/backoff, auto-pause/auto-resume, and local progress
//! persistence for resume-after-reload.
//!
//! Everything is transport-agnostic behind [`UploadTransport`]; the bundled
//! [`LocalTransport`] drives the in-process services directly, which is also
//! how the integration tests exercise the full engine without HTTP.

pub mod backoff;
pub mod orchestrator;
pub mod progress;
pub mod transport;

pub use backoff::RetryPolicy;
pub use orchestrator::{CompletedUpload, UploadAbort, UploadRequest, Uploader, UploaderConfig};
pub use progress::{ClientUploadRecord, JsonFileProgressStore, ProgressStore};
pub use transport::{LocalTransport, SessionHandle, TransportError, UploadTransport};
