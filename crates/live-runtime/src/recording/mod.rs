//! Recording Ingestion Pipeline.
//!
//! Browsers upload a recording as a stream of small, irregular chunks. The
//! ingestor holds them in an [`UploadBuffer`] until at least
//! `min_part_size` bytes have accumulated, then ships the whole accumulator
//! as one multipart part. Finalize ships the remainder as the last (possibly
//! small) part and completes the upload, or falls back to a single
//! `put_object` when no part was ever produced.
//!
//! Buffer state changes happen under the buffer's own lock, and `closed` is
//! set by whichever of finalize, a failed flush or the sweep gets there
//! first. A chunk or finalize that arrives after that sees `NotFound`.

pub mod buffer;
pub mod routes;
pub mod storage;
pub mod sweep;

pub use buffer::{UploadBuffer, UploadMode};
pub use storage::{CompletedPart, FsObjectStorage, ObjectStorage, StorageError};

use crate::config::{
    Config, DEFAULT_RECORDING_MAX_CHUNK_BYTES, DEFAULT_RECORDING_MIN_PART_BYTES,
    DEFAULT_RECORDING_STALE_SECONDS,
};
use crate::errors::RuntimeError;
use crate::model::{RecordingState, RecordingStatus};
use crate::observability::metrics as prom;
use crate::permissions::{self, Action};
use crate::store::SessionStore;

use bytes::Bytes;
use common::types::{SessionId, UploadId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

const MAX_CONTENT_TYPE_LENGTH: usize = 100;

/// Ingestion tunables taken from [`Config`].
#[derive(Debug, Clone, Copy)]
pub struct IngestSettings {
    pub min_part_size: usize,
    pub stale_after: Duration,
    pub max_chunk_bytes: usize,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            min_part_size: DEFAULT_RECORDING_MIN_PART_BYTES,
            stale_after: Duration::from_secs(DEFAULT_RECORDING_STALE_SECONDS),
            max_chunk_bytes: DEFAULT_RECORDING_MAX_CHUNK_BYTES,
        }
    }
}

impl From<&Config> for IngestSettings {
    fn from(config: &Config) -> Self {
        Self {
            min_part_size: config.recording_min_part_bytes,
            stale_after: Duration::from_secs(config.recording_stale_seconds),
            max_chunk_bytes: config.recording_max_chunk_bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadStarted {
    pub upload_id: UploadId,
    pub mode: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkReceipt {
    pub received_bytes: u64,
    pub parts: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizedRecording {
    pub url: String,
}

type SharedBuffer = Arc<Mutex<UploadBuffer>>;

pub struct RecordingIngestor {
    store: Arc<dyn SessionStore>,
    storage: Arc<dyn ObjectStorage>,
    settings: IngestSettings,
    uploads: Mutex<HashMap<UploadId, SharedBuffer>>,
}

impl RecordingIngestor {
    pub fn new(
        store: Arc<dyn SessionStore>,
        storage: Arc<dyn ObjectStorage>,
        settings: IngestSettings,
    ) -> Self {
        Self {
            store,
            storage,
            settings,
            uploads: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn settings(&self) -> IngestSettings {
        self.settings
    }

    pub async fn active_uploads(&self) -> usize {
        self.uploads.lock().await.len()
    }

    /// Start an upload for `session_id` on behalf of `identity`.
    ///
    /// A backend that cannot create a multipart upload puts the upload in
    /// simple mode instead of failing.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown session, `Forbidden` unless the caller is
    /// the organizer and recording is allowed, `Validation` for a bad
    /// content type, `Backend` if the store write fails.
    #[instrument(skip_all, name = "rt.recording.init", fields(session_id = %session_id))]
    pub async fn init(
        &self,
        identity: &str,
        session_id: SessionId,
        content_type: &str,
    ) -> Result<UploadStarted, RuntimeError> {
        let session = self
            .store
            .find_by_id(session_id)
            .await?
            .ok_or_else(|| RuntimeError::NotFound("Session".to_string()))?;
        permissions::require(
            session.role_for(identity),
            Action::RecordingControl,
            session.is_organizer(identity),
        )?;
        if !session.settings.recording_allowed {
            return Err(RuntimeError::Forbidden(
                "Recording is not allowed for this session".to_string(),
            ));
        }
        let content_type = validate_content_type(content_type)?;

        let upload_id = UploadId::new();
        let key = format!(
            "recordings/{session_id}/{upload_id}.{}",
            extension_for(&content_type)
        );
        let mode = match self.storage.create_multipart(&key, &content_type).await {
            Ok(backend_upload_id) => UploadMode::Multipart { backend_upload_id },
            Err(e) => {
                warn!(
                    target: "rt.recording",
                    upload_id = %upload_id,
                    error = %e,
                    "Multipart creation failed, using simple mode"
                );
                UploadMode::Simple
            }
        };

        let buffer = UploadBuffer::new(upload_id, session_id, identity, key, content_type, mode);
        if let Err(e) = self
            .store
            .set_recording(
                session_id,
                RecordingState {
                    status: RecordingStatus::InProgress,
                    url: None,
                },
            )
            .await
        {
            self.abort_backend(&buffer).await;
            return Err(e.into());
        }

        let started = UploadStarted {
            upload_id,
            mode: buffer.mode.as_str().to_string(),
        };
        self.uploads
            .lock()
            .await
            .insert(upload_id, Arc::new(Mutex::new(buffer)));
        info!(target: "rt.recording", upload_id = %upload_id, mode = %started.mode, "Upload started");
        Ok(started)
    }

    /// Append one chunk, flushing a part once the accumulator reaches the
    /// minimum part size.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown or closed upload, `Forbidden` for another
    /// identity's upload, `Validation` for an empty or oversized chunk.
    /// A failed part upload aborts the whole upload and returns `Backend`.
    #[instrument(skip_all, name = "rt.recording.chunk", fields(upload_id = %upload_id, bytes = chunk.len()))]
    pub async fn chunk(
        &self,
        identity: &str,
        upload_id: UploadId,
        chunk: Bytes,
    ) -> Result<ChunkReceipt, RuntimeError> {
        if chunk.is_empty() {
            return Err(RuntimeError::Validation("Chunk is empty".to_string()));
        }
        if chunk.len() > self.settings.max_chunk_bytes {
            return Err(RuntimeError::Validation(format!(
                "Chunk exceeds {} bytes",
                self.settings.max_chunk_bytes
            )));
        }

        let shared = self.buffer(upload_id).await?;
        let mut buffer = shared.lock().await;
        check_open(&buffer, identity)?;

        buffer.append(&chunk);
        if buffer.ready_to_flush(self.settings.min_part_size) {
            if let Err(e) = self.flush(&mut buffer).await {
                self.fail(&shared, &mut buffer, "flush_failed").await;
                return Err(e);
            }
        }

        Ok(ChunkReceipt {
            received_bytes: buffer.received_bytes,
            parts: buffer.parts.len(),
        })
    }

    /// Commit the upload and persist its URL onto the session.
    ///
    /// # Errors
    ///
    /// `NotFound`/`Forbidden` as for [`Self::chunk`]; `Validation` if no
    /// bytes were received (the upload stays open). Storage failures abort
    /// the upload and return `Backend`.
    #[instrument(skip_all, name = "rt.recording.finalize", fields(upload_id = %upload_id))]
    pub async fn finalize(
        &self,
        identity: &str,
        upload_id: UploadId,
    ) -> Result<FinalizedRecording, RuntimeError> {
        let shared = self.buffer(upload_id).await?;
        let mut buffer = shared.lock().await;
        check_open(&buffer, identity)?;
        if buffer.received_bytes == 0 {
            return Err(RuntimeError::Validation(
                "No recording data received".to_string(),
            ));
        }

        buffer.closed = true;
        self.forget(upload_id, &shared).await;

        let (url, mode) = match self.commit(&mut buffer).await {
            Ok(done) => done,
            Err(e) => {
                self.fail(&shared, &mut buffer, "finalize_failed").await;
                return Err(e);
            }
        };

        self.store
            .set_recording(
                buffer.session_id,
                RecordingState {
                    status: RecordingStatus::Completed,
                    url: Some(url.clone()),
                },
            )
            .await?;
        prom::record_recording_finalized(mode);
        info!(
            target: "rt.recording",
            upload_id = %upload_id,
            session_id = %buffer.session_id,
            mode,
            bytes = buffer.received_bytes,
            parts = buffer.parts.len(),
            "Recording finalized"
        );
        Ok(FinalizedRecording { url })
    }

    /// Abort and discard every upload idle for longer than the staleness
    /// window. Buffers locked by an in-flight chunk or finalize are skipped.
    pub async fn sweep_stale(&self) -> usize {
        let candidates: Vec<(UploadId, SharedBuffer)> = self
            .uploads
            .lock()
            .await
            .iter()
            .map(|(id, shared)| (*id, Arc::clone(shared)))
            .collect();

        let mut swept = 0;
        for (upload_id, shared) in candidates {
            let Ok(mut buffer) = shared.try_lock() else {
                debug!(target: "rt.recording.sweep", upload_id = %upload_id, "Upload busy, skipped");
                continue;
            };
            if buffer.closed || buffer.idle_for(Instant::now()) < self.settings.stale_after {
                continue;
            }
            info!(
                target: "rt.recording.sweep",
                upload_id = %upload_id,
                session_id = %buffer.session_id,
                idle_secs = buffer.idle_for(Instant::now()).as_secs(),
                "Discarding stale upload"
            );
            self.fail(&shared, &mut buffer, "stale").await;
            swept += 1;
        }

        if swept > 0 {
            prom::record_recording_swept(swept);
        }
        swept
    }

    async fn buffer(&self, upload_id: UploadId) -> Result<SharedBuffer, RuntimeError> {
        self.uploads
            .lock()
            .await
            .get(&upload_id)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound("Upload".to_string()))
    }

    async fn forget(&self, upload_id: UploadId, shared: &SharedBuffer) {
        let mut uploads = self.uploads.lock().await;
        if uploads
            .get(&upload_id)
            .is_some_and(|current| Arc::ptr_eq(current, shared))
        {
            uploads.remove(&upload_id);
        }
    }

    async fn flush(&self, buffer: &mut UploadBuffer) -> Result<(), RuntimeError> {
        let backend_upload_id = match &buffer.mode {
            UploadMode::Multipart { backend_upload_id } => backend_upload_id.clone(),
            UploadMode::Simple => return Ok(()),
        };
        let part = buffer.take_pending();
        let size = part.len();
        let started = std::time::Instant::now();
        let tag = self
            .storage
            .upload_part(&buffer.key, &backend_upload_id, buffer.next_part, part)
            .await?;
        prom::record_recording_part(size, started.elapsed());
        debug!(
            target: "rt.recording",
            upload_id = %buffer.upload_id,
            part_number = buffer.next_part,
            size,
            "Part uploaded"
        );
        buffer.push_part(tag, size);
        Ok(())
    }

    async fn commit(
        &self,
        buffer: &mut UploadBuffer,
    ) -> Result<(String, &'static str), RuntimeError> {
        let UploadMode::Multipart { backend_upload_id } = buffer.mode.clone() else {
            let body = buffer.take_pending();
            let url = self
                .storage
                .put_object(&buffer.key, body, &buffer.content_type)
                .await?;
            return Ok((url, "simple"));
        };

        if buffer.parts.is_empty() {
            let body = buffer.take_pending();
            let url = self
                .storage
                .put_object(&buffer.key, body, &buffer.content_type)
                .await?;
            self.abort_backend(buffer).await;
            return Ok((url, "single_object"));
        }

        if buffer.pending_len() > 0 {
            self.flush(buffer).await?;
        }
        let url = self
            .storage
            .complete_multipart(&buffer.key, &backend_upload_id, &buffer.parts)
            .await?;
        Ok((url, "multipart"))
    }

    /// Close the buffer, release the backend upload and mark the session's
    /// recording failed. Never fails.
    async fn fail(&self, shared: &SharedBuffer, buffer: &mut UploadBuffer, reason: &'static str) {
        buffer.closed = true;
        self.forget(buffer.upload_id, shared).await;
        self.abort_backend(buffer).await;
        prom::record_recording_aborted(reason);
        if let Err(e) = self
            .store
            .set_recording(
                buffer.session_id,
                RecordingState {
                    status: RecordingStatus::Failed,
                    url: None,
                },
            )
            .await
        {
            warn!(target: "rt.recording", upload_id = %buffer.upload_id, error = %e, "Recording status update failed");
        }
        warn!(target: "rt.recording", upload_id = %buffer.upload_id, reason, "Upload aborted");
    }

    async fn abort_backend(&self, buffer: &UploadBuffer) {
        if let UploadMode::Multipart { backend_upload_id } = &buffer.mode {
            if let Err(e) = self
                .storage
                .abort_multipart(&buffer.key, backend_upload_id)
                .await
            {
                warn!(target: "rt.recording", upload_id = %buffer.upload_id, error = %e, "Multipart abort failed");
            }
        }
    }
}

fn check_open(buffer: &UploadBuffer, identity: &str) -> Result<(), RuntimeError> {
    if buffer.closed {
        return Err(RuntimeError::NotFound("Upload".to_string()));
    }
    if buffer.owner != identity {
        return Err(RuntimeError::Forbidden(
            "Upload belongs to another user".to_string(),
        ));
    }
    Ok(())
}

fn validate_content_type(content_type: &str) -> Result<String, RuntimeError> {
    let content_type = content_type.trim().to_ascii_lowercase();
    let valid = content_type.len() <= MAX_CONTENT_TYPE_LENGTH
        && (content_type.starts_with("video/") || content_type.starts_with("audio/"));
    if valid {
        Ok(content_type)
    } else {
        Err(RuntimeError::Validation(
            "Content type must be a video or audio type".to_string(),
        ))
    }
}

fn extension_for(content_type: &str) -> &'static str {
    let base = content_type.split(';').next().unwrap_or_default().trim();
    match base {
        "video/webm" | "audio/webm" => "webm",
        "video/mp4" => "mp4",
        "audio/mp4" => "m4a",
        "audio/ogg" | "video/ogg" => "ogg",
        _ => "bin",
    }
}
