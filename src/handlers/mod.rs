//! HTTP handlers, grouped by concern: session lifecycle + chunk ingest,
//! range/stream serving, and health probes.

pub mod health_handlers;
pub mod session_handlers;
pub mod stream_handlers;
