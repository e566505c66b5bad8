//! Durable blob storage behind a narrow trait seam.
//!
//! The rest of the crate only ever talks to [`BlobStore`]: put/get by key,
//! idempotent delete, and a streaming [`BlobWriter`] for assembling large
//! objects without holding them in memory. The bundled [`FsBlobStore`]
//! keeps payloads on local disk, sharded two levels deep beneath
//! `base_path/{shard}/{shard}/{key}` to bound per-directory file counts;
//! an S3-compatible backend can be slotted in behind the same trait.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use md5::Context;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

const MAX_KEY_LEN: usize = 1024;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob `{0}` not found")]
    NotFound(String),
    #[error("invalid blob key")]
    InvalidKey,
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type BlobResult<T> = Result<T, BlobError>;

/// Result of a completed blob write.
#[derive(Debug, Clone)]
pub struct PutOutcome {
    pub key: String,
    pub url: String,
    pub size_bytes: u64,
    /// MD5 of the written payload, computed while streaming.
    pub etag: String,
}

/// A streaming blob read: body plus total size.
pub struct BlobReader {
    pub stream: BoxStream<'static, io::Result<Bytes>>,
    pub size_bytes: u64,
}

/// Incremental writer for a single blob.
///
/// Bytes are appended in call order; nothing is visible under the key until
/// `finish` returns. `abort` discards everything written so far.
#[async_trait]
pub trait BlobWriter: Send {
    async fn write(&mut self, bytes: &[u8]) -> BlobResult<()>;
    async fn finish(self: Box<Self>) -> BlobResult<PutOutcome>;
    async fn abort(self: Box<Self>);
}

/// Core blob storage operations, implemented by all storage backends.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store a whole payload under `key`, overwriting any previous value.
    async fn put(&self, key: &str, bytes: Bytes, content_type: Option<&str>)
    -> BlobResult<PutOutcome>;

    /// Fetch a whole payload.
    async fn get(&self, key: &str) -> BlobResult<Bytes>;

    /// Open a payload for streaming reads.
    async fn open(&self, key: &str) -> BlobResult<BlobReader>;

    /// Delete a payload. Absent keys are not an error.
    async fn delete(&self, key: &str) -> BlobResult<()>;

    /// Begin a streaming write under `key`.
    async fn writer(&self, key: &str, content_type: Option<&str>)
    -> BlobResult<Box<dyn BlobWriter>>;

    /// Public download URL for `key`.
    fn download_url(&self, key: &str) -> String;
}

/// Local-disk blob store.
#[derive(Clone)]
pub struct FsBlobStore {
    base_path: PathBuf,
    public_base_url: String,
}

impl FsBlobStore {
    pub fn new(base_path: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Self {
        Self {
            base_path: base_path.into(),
            public_base_url: public_base_url.into(),
        }
    }

    /// Basic key validation to avoid trivial path traversal vectors.
    ///
    /// Rejects keys that begin with `/` or contain `..`, control bytes, or
    /// backslashes.
    fn ensure_key_safe(key: &str) -> BlobResult<()> {
        if key.is_empty() || key.len() > MAX_KEY_LEN {
            return Err(BlobError::InvalidKey);
        }
        if key.starts_with('/') || key.contains("..") {
            return Err(BlobError::InvalidKey);
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(BlobError::InvalidKey);
        }
        Ok(())
    }

    /// Generate two-level shard identifiers for a key.
    ///
    /// Uses MD5(key) and returns the first two bytes as lowercase
    /// hexadecimal strings (00–ff).
    fn shards(key: &str) -> (String, String) {
        let digest = md5::compute(key);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    /// Fully-qualified payload path: `base_path/{shard}/{shard}/{key}`.
    fn blob_path(&self, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::shards(key);
        let mut path = self.base_path.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    /// Recursively remove empty directories up to the store root, so a
    /// deleted session leaves no shard litter behind.
    async fn prune_empty_dirs(&self, start: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(&self.base_path) && current != self.base_path {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(
        &self,
        key: &str,
        bytes: Bytes,
        content_type: Option<&str>,
    ) -> BlobResult<PutOutcome> {
        let mut writer = self.writer(key, content_type).await?;
        if let Err(err) = writer.write(&bytes).await {
            writer.abort().await;
            return Err(err);
        }
        writer.finish().await
    }

    async fn get(&self, key: &str) -> BlobResult<Bytes> {
        Self::ensure_key_safe(key)?;
        match fs::read(self.blob_path(key)).await {
            Ok(bytes) => Ok(Bytes::from(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(BlobError::NotFound(key.to_string()))
            }
            Err(err) => Err(BlobError::Io(err)),
        }
    }

    async fn open(&self, key: &str) -> BlobResult<BlobReader> {
        Self::ensure_key_safe(key)?;
        let path = self.blob_path(key);
        let file = File::open(&path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                BlobError::NotFound(key.to_string())
            } else {
                BlobError::Io(err)
            }
        })?;
        let size_bytes = file.metadata().await?.len();
        Ok(BlobReader {
            stream: Box::pin(ReaderStream::new(file)),
            size_bytes,
        })
    }

    async fn delete(&self, key: &str) -> BlobResult<()> {
        Self::ensure_key_safe(key)?;
        let path = self.blob_path(key);
        match fs::remove_file(&path).await {
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(BlobError::Io(err)),
        }
        if let Some(parent) = path.parent() {
            self.prune_empty_dirs(parent).await;
        }
        Ok(())
    }

    async fn writer(
        &self,
        key: &str,
        _content_type: Option<&str>,
    ) -> BlobResult<Box<dyn BlobWriter>> {
        Self::ensure_key_safe(key)?;
        let final_path = self.blob_path(key);
        let parent = final_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or(BlobError::InvalidKey)?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let file = File::create(&tmp_path).await?;
        Ok(Box::new(FsBlobWriter {
            file,
            tmp_path,
            final_path,
            key: key.to_string(),
            url: self.download_url(key),
            digest: Context::new(),
            size_bytes: 0,
        }))
    }

    fn download_url(&self, key: &str) -> String {
        format!("{}/{}", self.public_base_url.trim_end_matches('/'), key)
    }
}

/// Writes to a `.tmp-{uuid}` sibling, fsyncs, then renames into place, so
/// readers never observe a partially-written blob.
struct FsBlobWriter {
    file: File,
    tmp_path: PathBuf,
    final_path: PathBuf,
    key: String,
    url: String,
    digest: Context,
    size_bytes: u64,
}

#[async_trait]
impl BlobWriter for FsBlobWriter {
    async fn write(&mut self, bytes: &[u8]) -> BlobResult<()> {
        self.digest.consume(bytes);
        self.size_bytes += bytes.len() as u64;
        self.file.write_all(bytes).await?;
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> BlobResult<PutOutcome> {
        if let Err(err) = async {
            self.file.flush().await?;
            self.file.sync_all().await
        }
        .await
        {
            let _ = fs::remove_file(&self.tmp_path).await;
            return Err(BlobError::Io(err));
        }

        if let Err(err) = fs::rename(&self.tmp_path, &self.final_path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(&self.final_path).await?;
                fs::rename(&self.tmp_path, &self.final_path).await?;
            } else {
                let _ = fs::remove_file(&self.tmp_path).await;
                return Err(BlobError::Io(err));
            }
        }

        Ok(PutOutcome {
            key: self.key,
            url: self.url,
            size_bytes: self.size_bytes,
            etag: format!("{:x}", self.digest.compute()),
        })
    }

    async fn abort(self: Box<Self>) {
        let _ = fs::remove_file(&self.tmp_path).await;
    }
}
