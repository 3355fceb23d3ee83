//! Per-upload accumulator.

use super::storage::CompletedPart;
use bytes::{Bytes, BytesMut};
use common::types::{SessionId, UploadId};
use std::time::Duration;
use tokio::time::Instant;

/// How an upload reaches storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadMode {
    /// Parts are streamed into a backend multipart upload.
    Multipart { backend_upload_id: String },
    /// Multipart creation failed at init; everything is written in one put.
    Simple,
}

impl UploadMode {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            UploadMode::Multipart { .. } => "multipart",
            UploadMode::Simple => "simple",
        }
    }
}

/// In-flight recording state.
///
/// `parts` is strictly increasing in part number and every part in it is at
/// least the minimum part size; only the part flushed by finalize may be
/// smaller.
#[derive(Debug)]
pub struct UploadBuffer {
    pub upload_id: UploadId,
    pub session_id: SessionId,
    pub owner: String,
    pub key: String,
    pub content_type: String,
    pub mode: UploadMode,
    pub parts: Vec<CompletedPart>,
    pub next_part: u32,
    pending: BytesMut,
    pub received_bytes: u64,
    pub created_at: Instant,
    pub last_activity: Instant,
    /// Set once finalize, abort or the sweep has taken the buffer.
    pub closed: bool,
}

impl UploadBuffer {
    #[must_use]
    pub fn new(
        upload_id: UploadId,
        session_id: SessionId,
        owner: impl Into<String>,
        key: impl Into<String>,
        content_type: impl Into<String>,
        mode: UploadMode,
    ) -> Self {
        let now = Instant::now();
        Self {
            upload_id,
            session_id,
            owner: owner.into(),
            key: key.into(),
            content_type: content_type.into(),
            mode,
            parts: Vec::new(),
            next_part: 1,
            pending: BytesMut::new(),
            received_bytes: 0,
            created_at: now,
            last_activity: now,
            closed: false,
        }
    }

    pub fn append(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
        self.received_bytes += chunk.len() as u64;
        self.last_activity = Instant::now();
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Whether the accumulator has reached `min_part_size` and should be
    /// flushed. Simple uploads never flush.
    #[must_use]
    pub fn ready_to_flush(&self, min_part_size: usize) -> bool {
        matches!(self.mode, UploadMode::Multipart { .. }) && self.pending.len() >= min_part_size
    }

    /// Takes the whole accumulator, leaving it empty.
    pub fn take_pending(&mut self) -> Bytes {
        self.pending.split().freeze()
    }

    /// Records a stored part and advances the part counter.
    pub fn push_part(&mut self, tag: String, size: usize) {
        self.parts.push(CompletedPart {
            part_number: self.next_part,
            tag,
            size,
        });
        self.next_part += 1;
    }

    #[must_use]
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }
}
