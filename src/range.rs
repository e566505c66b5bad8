//! HTTP byte-range resolution against a chunked upload.
//!
//! Playback clients ask for byte ranges before assembly has produced a
//! final object, so a range must be translated into the chunk indices that
//! cover it plus the sub-slice of each chunk to serve. All of this is pure
//! arithmetic; fetching lives in the stream handlers.

use thiserror::Error;

/// Open-ended ranges are capped at this window so a `bytes=0-` request on a
/// multi-gigabyte upload does not stream the whole file.
pub const DEFAULT_RANGE_WINDOW: u64 = 2 * 1024 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RangeError {
    #[error("malformed Range header")]
    Malformed,
    #[error("range not satisfiable")]
    Unsatisfiable,
}

/// Inclusive byte range, the way `Content-Range` speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Number of bytes spanned; inclusive ranges are never empty.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// The part of one chunk that falls inside a requested range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSlice {
    pub index: u64,
    /// Offset of the slice relative to the chunk's own start.
    pub offset: u64,
    pub len: u64,
}

/// Parse a `Range: bytes=...` header value against a file of `file_size`
/// bytes, capping open-ended and oversized requests at `max_window` bytes.
///
/// Supported forms: `bytes=start-end`, `bytes=start-`, `bytes=-suffix`.
pub fn parse_range_header(
    header: &str,
    file_size: u64,
    max_window: u64,
) -> Result<ByteRange, RangeError> {
    let spec = header.strip_prefix("bytes=").ok_or(RangeError::Malformed)?;
    let (start_s, end_s) = spec.split_once('-').ok_or(RangeError::Malformed)?;

    if file_size == 0 {
        return Err(RangeError::Unsatisfiable);
    }

    let start = if start_s.is_empty() {
        // Suffix form: last `end_s` bytes.
        let suffix: u64 = end_s.parse().map_err(|_| RangeError::Malformed)?;
        if suffix == 0 {
            return Err(RangeError::Unsatisfiable);
        }
        return clamp_range(file_size.saturating_sub(suffix), None, file_size, max_window);
    } else {
        start_s.parse::<u64>().map_err(|_| RangeError::Malformed)?
    };

    let end = if end_s.is_empty() {
        None
    } else {
        Some(end_s.parse::<u64>().map_err(|_| RangeError::Malformed)?)
    };

    if let Some(end) = end {
        if end < start {
            return Err(RangeError::Malformed);
        }
    }
    clamp_range(start, end, file_size, max_window)
}

fn clamp_range(
    start: u64,
    end: Option<u64>,
    file_size: u64,
    max_window: u64,
) -> Result<ByteRange, RangeError> {
    if start >= file_size {
        return Err(RangeError::Unsatisfiable);
    }
    let hard_cap = (file_size - 1).min(start + max_window.saturating_sub(1));
    let end = match end {
        Some(end) => end.min(hard_cap),
        None => hard_cap,
    };
    Ok(ByteRange { start, end })
}

/// Chunk indices `floor(start/chunk_size) ..= floor(end/chunk_size)` and the
/// sub-slice of each, relative to that chunk's global offset
/// (`index * chunk_size`).
pub fn covering_chunks(range: ByteRange, chunk_size: u64) -> Vec<ChunkSlice> {
    assert!(chunk_size > 0, "chunk size must be non-zero");
    let first = range.start / chunk_size;
    let last = range.end / chunk_size;
    let mut slices = Vec::with_capacity((last - first + 1) as usize);
    for index in first..=last {
        let chunk_start = index * chunk_size;
        let chunk_end = chunk_start + chunk_size - 1;
        let slice_start = range.start.max(chunk_start);
        let slice_end = range.end.min(chunk_end);
        slices.push(ChunkSlice {
            index,
            offset: slice_start - chunk_start,
            len: slice_end - slice_start + 1,
        });
    }
    slices
}
