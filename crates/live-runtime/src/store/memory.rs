//! In-memory session store.
//!
//! Each document sits behind its own async mutex, so `update` serializes
//! mutations per session while different sessions proceed independently.
//! Used when no `DATABASE_URL` is configured and throughout the tests.

use super::{Applied, CheckOut, Mutation, SessionStore, StoreError, Updated};
use crate::errors::RuntimeError;
use crate::model::{RecordingState, Session};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::types::SessionId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

#[derive(Default)]
struct Index {
    documents: HashMap<SessionId, Arc<Mutex<Session>>>,
    by_code: HashMap<String, SessionId>,
}

/// In-memory [`SessionStore`].
#[derive(Default)]
pub struct MemorySessionStore {
    index: RwLock<Index>,
    check_outs: Mutex<Vec<CheckOut>>,
}

impl MemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Check-outs recorded so far, oldest first.
    pub async fn check_outs(&self) -> Vec<CheckOut> {
        self.check_outs.lock().await.clone()
    }

    async fn document(&self, id: SessionId) -> Option<Arc<Mutex<Session>>> {
        self.index.read().await.documents.get(&id).cloned()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn insert(&self, session: Session) -> Result<(), StoreError> {
        let mut index = self.index.write().await;
        if index.by_code.contains_key(&session.room_code) {
            return Err(StoreError::Duplicate(session.room_code));
        }
        if index.documents.contains_key(&session.id) {
            return Err(StoreError::Duplicate(session.id.to_string()));
        }
        index.by_code.insert(session.room_code.clone(), session.id);
        index
            .documents
            .insert(session.id, Arc::new(Mutex::new(session)));
        Ok(())
    }

    async fn find_by_id(&self, id: SessionId) -> Result<Option<Session>, StoreError> {
        match self.document(id).await {
            Some(doc) => Ok(Some(doc.lock().await.clone())),
            None => Ok(None),
        }
    }

    async fn find_by_room_code(&self, room_code: &str) -> Result<Option<Session>, StoreError> {
        let id = self.index.read().await.by_code.get(room_code).copied();
        match id {
            Some(id) => self.find_by_id(id).await,
            None => Ok(None),
        }
    }

    async fn find_by_participant(
        &self,
        participant_id: Uuid,
    ) -> Result<Option<Session>, StoreError> {
        let documents: Vec<_> = self.index.read().await.documents.values().cloned().collect();
        for doc in documents {
            let session = doc.lock().await;
            if session
                .participants
                .iter()
                .any(|p| p.participant_id == participant_id)
            {
                return Ok(Some(session.clone()));
            }
        }
        Ok(None)
    }

    async fn update(&self, id: SessionId, mutation: Mutation) -> Result<Updated, RuntimeError> {
        let doc = self
            .document(id)
            .await
            .ok_or_else(|| RuntimeError::NotFound("Session".to_string()))?;

        let mut current = doc.lock().await;
        // Edit a copy so a rejected mutation leaves no partial write.
        let mut draft = current.clone();
        let applied = mutation(&mut draft)?;
        if applied == Applied::Changed {
            *current = draft;
        }

        Ok(Updated {
            session: current.clone(),
            applied,
        })
    }

    async fn touch_participant(
        &self,
        id: SessionId,
        identity: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if let Some(doc) = self.document(id).await {
            if let Some(p) = doc.lock().await.participant_mut(identity) {
                p.last_active_at = at;
            }
        }
        Ok(())
    }

    async fn record_check_out(&self, check_out: CheckOut) -> Result<(), StoreError> {
        self.check_outs.lock().await.push(check_out);
        Ok(())
    }

    async fn set_recording(
        &self,
        id: SessionId,
        recording: RecordingState,
    ) -> Result<(), StoreError> {
        if let Some(doc) = self.document(id).await {
            doc.lock().await.recording = recording;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::model::{MembershipStatus, Participant, RecordingStatus, Role};

    fn session() -> Session {
        Session::new("abc-defg-hij", "org", "All hands")
    }

    #[tokio::test]
    async fn test_insert_and_lookup_by_id_and_code() {
        let store = MemorySessionStore::new();
        let s = session();
        let id = s.id;
        store.insert(s).await.unwrap();

        assert_eq!(store.find_by_id(id).await.unwrap().unwrap().id, id);
        assert_eq!(
            store.find_by_room_code("abc-defg-hij").await.unwrap().unwrap().id,
            id
        );
        assert!(store.find_by_room_code("zzz").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_room_code_rejected() {
        let store = MemorySessionStore::new();
        store.insert(session()).await.unwrap();
        let result = store.insert(session()).await;
        assert!(matches!(result, Err(StoreError::Duplicate(_))));
    }

    #[tokio::test]
    async fn test_find_by_participant() {
        let store = MemorySessionStore::new();
        let mut s = session();
        let p = Participant::new("a", None, Role::Attendee, MembershipStatus::Active, Utc::now());
        let pid = p.participant_id;
        s.participants.push(p);
        let id = s.id;
        store.insert(s).await.unwrap();

        assert_eq!(store.find_by_participant(pid).await.unwrap().unwrap().id, id);
        assert!(store
            .find_by_participant(Uuid::new_v4())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_update_missing_session_is_not_found() {
        let store = MemorySessionStore::new();
        let result = store
            .update(SessionId::new(), Box::new(|_| Ok(Applied::Changed)))
            .await;
        assert!(matches!(result, Err(RuntimeError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_rejected_mutation_writes_nothing() {
        let store = MemorySessionStore::new();
        let s = session();
        let id = s.id;
        store.insert(s).await.unwrap();

        let result = store
            .update(
                id,
                Box::new(|s| {
                    s.title = "changed".to_string();
                    Err(RuntimeError::Validation("nope".to_string()))
                }),
            )
            .await;

        assert!(matches!(result, Err(RuntimeError::Validation(_))));
        assert_eq!(store.find_by_id(id).await.unwrap().unwrap().title, "All hands");
    }

    #[tokio::test]
    async fn test_unchanged_mutation_skips_write() {
        let store = MemorySessionStore::new();
        let s = session();
        let id = s.id;
        store.insert(s).await.unwrap();

        let updated = store
            .update(
                id,
                Box::new(|s| {
                    s.title = "draft only".to_string();
                    Ok(Applied::Unchanged)
                }),
            )
            .await
            .unwrap();

        assert!(!updated.changed());
        assert_eq!(updated.session.title, "All hands");
    }

    #[tokio::test]
    async fn test_concurrent_appends_do_not_lose_updates() {
        let store = Arc::new(MemorySessionStore::new());
        let s = session();
        let id = s.id;
        store.insert(s).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..50 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .update(
                        id,
                        Box::new(move |s| {
                            s.participants.push(Participant::new(
                                format!("user-{i}"),
                                None,
                                Role::Attendee,
                                MembershipStatus::Active,
                                Utc::now(),
                            ));
                            Ok(Applied::Changed)
                        }),
                    )
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let s = store.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(s.participants.len(), 50);
        assert_eq!(s.active_count(), 50);
    }

    #[tokio::test]
    async fn test_narrow_updates() {
        let store = MemorySessionStore::new();
        let mut s = session();
        let joined = Utc::now() - chrono::Duration::minutes(5);
        s.participants.push(Participant::new(
            "a",
            None,
            Role::Attendee,
            MembershipStatus::Active,
            joined,
        ));
        let id = s.id;
        store.insert(s).await.unwrap();

        let now = Utc::now();
        store.touch_participant(id, "a", now).await.unwrap();
        store
            .set_recording(
                id,
                RecordingState {
                    status: RecordingStatus::InProgress,
                    url: None,
                },
            )
            .await
            .unwrap();

        let s = store.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(s.participant("a").unwrap().last_active_at, now);
        assert_eq!(s.recording.status, RecordingStatus::InProgress);
    }
}
