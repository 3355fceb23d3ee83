//! Recording ingestion against a storage backend that enforces the 5 MiB
//! minimum part size.
//!
//! Covers:
//! - Small chunks coalescing into one large part
//! - A small final part after full-size parts
//! - Single-object fallback when no part was produced
//! - Simple mode when multipart creation fails
//! - Part failure aborting the upload
//! - Staleness sweep
//! - Empty finalize leaving the upload to the sweep

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::types::SessionId;
use live_runtime::errors::RuntimeError;
use live_runtime::model::{RecordingState, RecordingStatus};
use live_runtime::recording::{IngestSettings, RecordingIngestor};
use live_runtime::store::{MemorySessionStore, SessionStore};
use live_test_utils::{MockObjectStorage, SessionFixture};

const MIB: usize = 1024 * 1024;
const MIN_PART: usize = 5 * MIB;
const ORGANIZER: &str = "organizer-1";

struct Harness {
    ingestor: RecordingIngestor,
    storage: MockObjectStorage,
    store: Arc<MemorySessionStore>,
    session_id: SessionId,
}

async fn harness(storage: MockObjectStorage) -> Harness {
    let store = Arc::new(MemorySessionStore::new());
    let session = SessionFixture::new(ORGANIZER)
        .live()
        .insert(store.as_ref())
        .await;
    let ingestor = RecordingIngestor::new(
        Arc::clone(&store) as Arc<dyn SessionStore>,
        Arc::new(storage.clone()),
        IngestSettings {
            min_part_size: MIN_PART,
            stale_after: Duration::from_secs(60),
            max_chunk_bytes: 8 * MIB,
        },
    );
    Harness {
        ingestor,
        storage,
        store,
        session_id: session.id,
    }
}

impl Harness {
    async fn recording(&self) -> RecordingState {
        self.store
            .find_by_id(self.session_id)
            .await
            .unwrap()
            .unwrap()
            .recording
    }
}

fn chunk(len: usize) -> Bytes {
    Bytes::from(vec![7u8; len])
}

#[tokio::test]
async fn test_small_chunks_coalesce_into_one_part() {
    let h = harness(MockObjectStorage::new(MIN_PART)).await;
    let started = h
        .ingestor
        .init(ORGANIZER, h.session_id, "video/webm")
        .await
        .unwrap();
    assert_eq!(started.mode, "multipart");
    let backend = h.storage.open_uploads().remove(0);

    let first = h
        .ingestor
        .chunk(ORGANIZER, started.upload_id, chunk(3 * MIB))
        .await
        .unwrap();
    assert_eq!(first.parts, 0);
    assert!(h.storage.part_sizes(&backend).is_empty());

    let second = h
        .ingestor
        .chunk(ORGANIZER, started.upload_id, chunk(3 * MIB))
        .await
        .unwrap();
    assert_eq!(second.parts, 1);
    assert_eq!(second.received_bytes, (6 * MIB) as u64);
    assert_eq!(h.storage.part_sizes(&backend), vec![6 * MIB]);

    let done = h
        .ingestor
        .finalize(ORGANIZER, started.upload_id)
        .await
        .unwrap();

    let (key, body) = h.storage.only_object();
    assert_eq!(body.len(), 6 * MIB);
    assert_eq!(h.storage.completed(), vec![key]);
    assert_eq!(h.storage.put_calls(), 0);
    assert!(h.storage.aborted().is_empty());

    let state = h.recording().await;
    assert_eq!(state.status, RecordingStatus::Completed);
    assert_eq!(state.url, Some(done.url));
}

#[tokio::test]
async fn test_final_part_may_be_small() {
    let h = harness(MockObjectStorage::new(MIN_PART)).await;
    let started = h
        .ingestor
        .init(ORGANIZER, h.session_id, "video/webm")
        .await
        .unwrap();
    let backend = h.storage.open_uploads().remove(0);

    for len in [4 * MIB, 2 * MIB, 100] {
        h.ingestor
            .chunk(ORGANIZER, started.upload_id, chunk(len))
            .await
            .unwrap();
    }
    assert_eq!(h.storage.part_sizes(&backend), vec![6 * MIB]);

    h.ingestor
        .finalize(ORGANIZER, started.upload_id)
        .await
        .unwrap();

    let (_, body) = h.storage.only_object();
    assert_eq!(body.len(), 6 * MIB + 100);
    assert_eq!(h.recording().await.status, RecordingStatus::Completed);
}

#[tokio::test]
async fn test_short_recording_falls_back_to_single_object() {
    let h = harness(MockObjectStorage::new(MIN_PART)).await;
    let started = h
        .ingestor
        .init(ORGANIZER, h.session_id, "audio/webm")
        .await
        .unwrap();
    let backend = h.storage.open_uploads().remove(0);

    h.ingestor
        .chunk(ORGANIZER, started.upload_id, chunk(64 * 1024))
        .await
        .unwrap();
    let done = h
        .ingestor
        .finalize(ORGANIZER, started.upload_id)
        .await
        .unwrap();

    assert_eq!(h.storage.put_calls(), 1);
    assert!(h.storage.completed().is_empty());
    assert_eq!(h.storage.aborted(), vec![backend]);
    assert!(h.storage.open_uploads().is_empty());

    let (key, body) = h.storage.only_object();
    assert_eq!(body.len(), 64 * 1024);
    assert!(done.url.ends_with(&key));
    assert_eq!(h.recording().await.url, Some(done.url));
}

#[tokio::test]
async fn test_create_failure_uses_simple_mode() {
    let h = harness(MockObjectStorage::new(MIN_PART).fail_create()).await;
    let started = h
        .ingestor
        .init(ORGANIZER, h.session_id, "video/mp4")
        .await
        .unwrap();
    assert_eq!(started.mode, "simple");

    // Simple mode never ships parts, however much arrives.
    for _ in 0..2 {
        let receipt = h
            .ingestor
            .chunk(ORGANIZER, started.upload_id, chunk(3 * MIB))
            .await
            .unwrap();
        assert_eq!(receipt.parts, 0);
    }
    let done = h
        .ingestor
        .finalize(ORGANIZER, started.upload_id)
        .await
        .unwrap();

    assert_eq!(h.storage.put_calls(), 1);
    let (key, body) = h.storage.only_object();
    assert!(key.ends_with(".mp4"));
    assert_eq!(body.len(), 6 * MIB);
    assert_eq!(h.recording().await.url, Some(done.url));
}

#[tokio::test]
async fn test_part_failure_aborts_upload() {
    let h = harness(MockObjectStorage::new(MIN_PART).fail_part(1)).await;
    let started = h
        .ingestor
        .init(ORGANIZER, h.session_id, "video/webm")
        .await
        .unwrap();
    let backend = h.storage.open_uploads().remove(0);

    let err = h
        .ingestor
        .chunk(ORGANIZER, started.upload_id, chunk(MIN_PART))
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Backend(_)));

    assert_eq!(h.storage.aborted(), vec![backend]);
    assert_eq!(h.recording().await.status, RecordingStatus::Failed);
    assert_eq!(h.ingestor.active_uploads().await, 0);

    let err = h
        .ingestor
        .chunk(ORGANIZER, started.upload_id, chunk(10))
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::NotFound(_)));
}

#[tokio::test]
async fn test_single_object_put_failure_marks_recording_failed() {
    let h = harness(MockObjectStorage::new(MIN_PART).fail_put()).await;
    let started = h
        .ingestor
        .init(ORGANIZER, h.session_id, "video/webm")
        .await
        .unwrap();
    let backend = h.storage.open_uploads().remove(0);
    h.ingestor
        .chunk(ORGANIZER, started.upload_id, chunk(10))
        .await
        .unwrap();

    let err = h
        .ingestor
        .finalize(ORGANIZER, started.upload_id)
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Backend(_)));
    assert_eq!(h.storage.aborted(), vec![backend]);
    assert_eq!(h.recording().await.status, RecordingStatus::Failed);
}

#[tokio::test]
async fn test_only_organizer_may_record() {
    let h = harness(MockObjectStorage::new(MIN_PART)).await;
    let err = h
        .ingestor
        .init("alice", h.session_id, "video/webm")
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Forbidden(_)));
    assert!(h.storage.open_uploads().is_empty());
    assert_eq!(h.recording().await.status, RecordingStatus::None);
}

#[tokio::test(start_paused = true)]
async fn test_sweep_discards_idle_upload() {
    let h = harness(MockObjectStorage::new(MIN_PART)).await;
    let idle = h
        .ingestor
        .init(ORGANIZER, h.session_id, "video/webm")
        .await
        .unwrap();
    h.ingestor
        .chunk(ORGANIZER, idle.upload_id, chunk(1024))
        .await
        .unwrap();

    tokio::time::advance(Duration::from_secs(30)).await;
    assert_eq!(h.ingestor.sweep_stale().await, 0);

    tokio::time::advance(Duration::from_secs(31)).await;
    assert_eq!(h.ingestor.sweep_stale().await, 1);

    assert_eq!(h.storage.aborted().len(), 1);
    assert_eq!(h.ingestor.active_uploads().await, 0);
    assert_eq!(h.recording().await.status, RecordingStatus::Failed);

    let err = h
        .ingestor
        .finalize(ORGANIZER, idle.upload_id)
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::NotFound(_)));
}

#[tokio::test(start_paused = true)]
async fn test_empty_finalize_keeps_upload_until_swept() {
    let h = harness(MockObjectStorage::new(MIN_PART)).await;
    let started = h
        .ingestor
        .init(ORGANIZER, h.session_id, "video/webm")
        .await
        .unwrap();

    let err = h
        .ingestor
        .finalize(ORGANIZER, started.upload_id)
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Validation(_)));
    assert_eq!(h.ingestor.active_uploads().await, 1);
    assert_eq!(h.storage.open_uploads().len(), 1);
    assert!(h.storage.aborted().is_empty());
    assert_eq!(h.recording().await.status, RecordingStatus::InProgress);

    tokio::time::advance(Duration::from_secs(61)).await;
    assert_eq!(h.ingestor.sweep_stale().await, 1);

    assert_eq!(h.ingestor.active_uploads().await, 0);
    assert_eq!(h.storage.aborted().len(), 1);
    assert_eq!(h.recording().await.status, RecordingStatus::Failed);
    assert_eq!(h.storage.put_calls(), 0);
}
