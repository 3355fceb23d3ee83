//! Object storage backend consumed by recording ingestion.

use crate::errors::RuntimeError;
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

/// Storage-level failures. Callers see these as `RuntimeError::Backend`.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown multipart upload: {0}")]
    UnknownUpload(String),

    #[error("part {part_number} is {size} bytes, below the {minimum} byte minimum")]
    PartTooSmall {
        part_number: u32,
        size: u64,
        minimum: usize,
    },

    #[error("invalid part list: {0}")]
    InvalidParts(String),

    #[error("invalid object key: {0}")]
    InvalidKey(String),

    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
}

impl From<StorageError> for RuntimeError {
    fn from(err: StorageError) -> Self {
        RuntimeError::Backend(err.to_string())
    }
}

/// One uploaded part as reported back to `complete_multipart`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub tag: String,
    pub size: usize,
}

/// Multipart object storage.
///
/// Every part but the last must be at least the backend's minimum part
/// size, or `complete_multipart` fails.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Start a multipart upload, returning the backend upload id.
    async fn create_multipart(&self, key: &str, content_type: &str)
        -> Result<String, StorageError>;

    /// Store one part, returning its tag.
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> Result<String, StorageError>;

    /// Assemble the parts into the final object, returning its public URL.
    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<String, StorageError>;

    /// Discard an upload and any parts stored for it.
    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<(), StorageError>;

    /// Write a whole object in one call, returning its public URL.
    async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<String, StorageError>;
}

/// Filesystem backend.
///
/// Parts are staged under `<root>/.multipart/<upload_id>/` and concatenated
/// into `<root>/<key>` on completion.
#[derive(Debug, Clone)]
pub struct FsObjectStorage {
    root: PathBuf,
    public_url: String,
    min_part_size: usize,
}

impl FsObjectStorage {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, public_url: impl Into<String>, min_part_size: usize) -> Self {
        Self {
            root: root.into(),
            public_url: public_url.into().trim_end_matches('/').to_string(),
            min_part_size,
        }
    }

    fn object_path(&self, key: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(key);
        let clean = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !clean || key.starts_with(".multipart") {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }

    fn staging_dir(&self, upload_id: &str) -> Result<PathBuf, StorageError> {
        Uuid::parse_str(upload_id)
            .map_err(|_| StorageError::UnknownUpload(upload_id.to_string()))?;
        Ok(self.root.join(".multipart").join(upload_id))
    }

    fn part_path(dir: &Path, part_number: u32) -> PathBuf {
        dir.join(format!("{part_number:06}.part"))
    }

    fn url(&self, key: &str) -> String {
        format!("{}/{key}", self.public_url)
    }

    async fn existing_staging_dir(&self, upload_id: &str) -> Result<PathBuf, StorageError> {
        let dir = self.staging_dir(upload_id)?;
        if tokio::fs::try_exists(&dir).await? {
            Ok(dir)
        } else {
            Err(StorageError::UnknownUpload(upload_id.to_string()))
        }
    }

    async fn create_parent(path: &Path) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStorage for FsObjectStorage {
    async fn create_multipart(
        &self,
        key: &str,
        _content_type: &str,
    ) -> Result<String, StorageError> {
        self.object_path(key)?;
        let upload_id = Uuid::new_v4().to_string();
        tokio::fs::create_dir_all(self.staging_dir(&upload_id)?).await?;
        debug!(target: "rt.recording", key, upload_id = %upload_id, "Multipart upload created");
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        _key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> Result<String, StorageError> {
        if part_number == 0 {
            return Err(StorageError::InvalidParts(
                "part numbers start at 1".to_string(),
            ));
        }
        let dir = self.existing_staging_dir(upload_id).await?;
        tokio::fs::write(Self::part_path(&dir, part_number), &body).await?;
        Ok(format!("{part_number}-{}", body.len()))
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<String, StorageError> {
        let path = self.object_path(key)?;
        let dir = self.existing_staging_dir(upload_id).await?;
        if parts.is_empty() {
            return Err(StorageError::InvalidParts("no parts".to_string()));
        }
        if parts.windows(2).any(|w| match w {
            [a, b] => a.part_number >= b.part_number,
            _ => false,
        }) {
            return Err(StorageError::InvalidParts(
                "part numbers must be strictly increasing".to_string(),
            ));
        }

        let last = parts.len() - 1;
        let mut sources = Vec::with_capacity(parts.len());
        for (i, part) in parts.iter().enumerate() {
            let source = Self::part_path(&dir, part.part_number);
            let size = tokio::fs::metadata(&source)
                .await
                .map_err(|_| StorageError::InvalidParts(format!("part {} missing", part.part_number)))?
                .len();
            if part.tag != format!("{}-{size}", part.part_number) {
                return Err(StorageError::InvalidParts(format!(
                    "part {} tag mismatch",
                    part.part_number
                )));
            }
            if i < last && size < self.min_part_size as u64 {
                return Err(StorageError::PartTooSmall {
                    part_number: part.part_number,
                    size,
                    minimum: self.min_part_size,
                });
            }
            sources.push(source);
        }

        Self::create_parent(&path).await?;
        let mut out = tokio::fs::File::create(&path).await?;
        for source in &sources {
            let mut input = tokio::fs::File::open(source).await?;
            tokio::io::copy(&mut input, &mut out).await?;
        }
        out.flush().await?;
        tokio::fs::remove_dir_all(&dir).await?;

        debug!(target: "rt.recording", key, parts = parts.len(), "Multipart upload completed");
        Ok(self.url(key))
    }

    async fn abort_multipart(&self, _key: &str, upload_id: &str) -> Result<(), StorageError> {
        let dir = self.existing_staging_dir(upload_id).await?;
        tokio::fs::remove_dir_all(dir).await?;
        Ok(())
    }

    async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        _content_type: &str,
    ) -> Result<String, StorageError> {
        let path = self.object_path(key)?;
        Self::create_parent(&path).await?;
        tokio::fs::write(&path, &body).await?;
        Ok(self.url(key))
    }
}
