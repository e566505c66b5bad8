//! Chunk arithmetic shared by the client splitter, the assembly pipeline,
//! and the range server.
//!
//! All functions here are pure: the same `(file_size, chunk_size, index)`
//! always maps to the same byte span, so a retried or re-uploaded chunk is
//! byte-identical to the original.

use bytes::Bytes;
use std::ops::Range;

/// Number of chunks a file of `file_size` bytes splits into at `chunk_size`.
///
/// Zero-length files produce zero chunks.
pub fn total_chunks(file_size: u64, chunk_size: u64) -> u64 {
    assert!(chunk_size > 0, "chunk size must be non-zero");
    file_size.div_ceil(chunk_size)
}

/// Byte span `[start, start + len)` of chunk `index`, or `None` when the
/// index falls past the end of the file.
///
/// Every chunk has length `chunk_size` except the last, which carries the
/// remainder (`file_size % chunk_size`, or a full chunk on exact multiples).
pub fn chunk_span(file_size: u64, chunk_size: u64, index: u64) -> Option<Range<u64>> {
    if index >= total_chunks(file_size, chunk_size) {
        return None;
    }
    let start = index * chunk_size;
    let end = (start + chunk_size).min(file_size);
    Some(start..end)
}

/// Slice chunk `index` out of an in-memory source. `Bytes::slice` is a
/// refcount bump, not a copy.
pub fn chunk_slice(data: &Bytes, chunk_size: u64, index: u64) -> Option<Bytes> {
    let span = chunk_span(data.len() as u64, chunk_size, index)?;
    Some(data.slice(span.start as usize..span.end as usize))
}

/// Iterator over `(index, bytes)` pairs of an in-memory source, in order.
pub struct ChunkReader {
    data: Bytes,
    chunk_size: u64,
    next_index: u64,
}

impl ChunkReader {
    pub fn new(data: Bytes, chunk_size: u64) -> Self {
        assert!(chunk_size > 0, "chunk size must be non-zero");
        Self {
            data,
            chunk_size,
            next_index: 0,
        }
    }

    /// Total number of chunks this reader will yield.
    pub fn total(&self) -> u64 {
        total_chunks(self.data.len() as u64, self.chunk_size)
    }
}

impl Iterator for ChunkReader {
    type Item = (u64, Bytes);

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.next_index;
        let chunk = chunk_slice(&self.data, self.chunk_size, index)?;
        self.next_index += 1;
        Some((index, chunk))
    }
}

/// Contiguous index ranges covering `[0, total_chunks)` exactly once each,
/// `batch_size` indices per range except possibly the last.
///
/// The assembly pipeline consumes these strictly in order; the plan itself
/// never reorders or overlaps.
pub fn batch_plan(total_chunks: u64, batch_size: u64) -> Vec<Range<u64>> {
    assert!(batch_size > 0, "batch size must be non-zero");
    let mut batches = Vec::with_capacity(total_chunks.div_ceil(batch_size) as usize);
    let mut start = 0;
    while start < total_chunks {
        let end = (start + batch_size).min(total_chunks);
        batches.push(start..end);
        start = end;
    }
    batches
}
