//! Resumable chunked-upload engine.
//!
//! Large media files upload over unreliable networks by splitting into
//! fixed-size chunks, sending each chunk independently (and idempotently),
//! and letting the server assemble the chunks into one durable blob-store
//! object on finalize. The pieces:
//!
//! - [`codec`] — pure chunk/batch arithmetic
//! - [`storage`] — blob store seam + local-disk implementation
//! - [`services`] — session lifecycle, chunk storage, batched assembly
//! - [`range`] — byte-range → chunk-slice resolution
//! - [`client`] — the upload orchestrator (queueing, retry, auto-pause)
//! - [`handlers`] / [`routes`] — the axum surface the binary serves

pub mod client;
pub mod codec;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod range;
pub mod routes;
pub mod services;
pub mod storage;
