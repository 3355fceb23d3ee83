//! Background reclamation of abandoned uploads.

use super::RecordingIngestor;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Run [`RecordingIngestor::sweep_stale`] every `interval` until cancelled.
pub fn spawn_sweep(
    ingestor: Arc<RecordingIngestor>,
    interval: Duration,
    cancel_token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately.
        ticker.tick().await;

        info!(
            target: "rt.recording.sweep",
            interval_secs = interval.as_secs(),
            "Upload sweep started"
        );
        loop {
            tokio::select! {
                () = cancel_token.cancelled() => break,
                _ = ticker.tick() => {
                    let swept = ingestor.sweep_stale().await;
                    debug!(target: "rt.recording.sweep", swept, "Sweep pass complete");
                }
            }
        }
        info!(target: "rt.recording.sweep", "Upload sweep stopped");
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::super::{FsObjectStorage, IngestSettings};
    use super::*;
    use crate::model::{RecordingStatus, Session};
    use crate::store::{MemorySessionStore, SessionStore};
    use bytes::Bytes;

    async fn ingestor() -> (Arc<RecordingIngestor>, Arc<MemorySessionStore>, common::types::SessionId) {
        let store = Arc::new(MemorySessionStore::new());
        let mut session = Session::new("sweep-room", "org", "Sweep");
        session.settings.recording_allowed = true;
        let session_id = session.id;
        store.insert(session).await.unwrap();

        let root = std::env::temp_dir().join(format!("rt-sweep-{}", uuid::Uuid::new_v4()));
        let ingestor = Arc::new(RecordingIngestor::new(
            Arc::clone(&store) as Arc<dyn SessionStore>,
            Arc::new(FsObjectStorage::new(root, "http://cdn", 8)),
            IngestSettings {
                min_part_size: 8,
                stale_after: Duration::from_secs(60),
                max_chunk_bytes: 64,
            },
        ));
        (ingestor, store, session_id)
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_spares_recently_active_upload() {
        let (ingestor, store, session_id) = ingestor().await;
        let idle = ingestor.init("org", session_id, "video/webm").await.unwrap();
        let active = ingestor.init("org", session_id, "video/webm").await.unwrap();

        tokio::time::advance(Duration::from_secs(45)).await;
        ingestor
            .chunk("org", active.upload_id, Bytes::from_static(b"abc"))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;

        assert_eq!(ingestor.sweep_stale().await, 1);
        assert_eq!(ingestor.active_uploads().await, 1);
        assert!(ingestor.finalize("org", idle.upload_id).await.is_err());
        assert_eq!(
            store.find_by_id(session_id).await.unwrap().unwrap().recording.status,
            RecordingStatus::Failed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_sweep_stops_on_cancel() {
        let (ingestor, _store, session_id) = ingestor().await;
        ingestor.init("org", session_id, "video/webm").await.unwrap();

        let cancel = CancellationToken::new();
        let task = spawn_sweep(Arc::clone(&ingestor), Duration::from_secs(10), cancel.clone());

        tokio::time::sleep(Duration::from_secs(75)).await;
        assert_eq!(ingestor.active_uploads().await, 0);

        cancel.cancel();
        task.await.unwrap();
    }
}
