//! Postgres session store.
//!
//! One row per session with the whole document in a JSONB column. `update`
//! locks the row inside a transaction for the fetch-modify-save cycle; the
//! narrow updates use `jsonb_set` so they never rewrite the document.
//!
//! All queries are parameterized.

use super::{Applied, CheckOut, Mutation, SessionStore, StoreError, Updated};
use crate::errors::RuntimeError;
use crate::model::{RecordingState, Session};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::types::SessionId;
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::instrument;
use uuid::Uuid;

#[derive(sqlx::FromRow)]
struct DocumentRow {
    document: Json<Session>,
}

/// [`SessionStore`] backed by a sqlx `PgPool`.
#[derive(Clone)]
pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the bundled migrations.
    ///
    /// # Errors
    ///
    /// Returns the migration failure.
    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    #[instrument(skip_all, fields(session_id = %session.id))]
    async fn insert(&self, session: Session) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO live_sessions (id, room_code, organizer_id, document)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(session.id.0)
        .bind(&session.room_code)
        .bind(&session.organizer_id)
        .bind(Json(&session))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::Duplicate(session.room_code))
            }
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip_all, fields(session_id = %id))]
    async fn find_by_id(&self, id: SessionId) -> Result<Option<Session>, StoreError> {
        let row: Option<DocumentRow> =
            sqlx::query_as("SELECT document FROM live_sessions WHERE id = $1")
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|r| r.document.0))
    }

    #[instrument(skip_all)]
    async fn find_by_room_code(&self, room_code: &str) -> Result<Option<Session>, StoreError> {
        let row: Option<DocumentRow> =
            sqlx::query_as("SELECT document FROM live_sessions WHERE room_code = $1")
                .bind(room_code)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|r| r.document.0))
    }

    #[instrument(skip_all, fields(participant_id = %participant_id))]
    async fn find_by_participant(
        &self,
        participant_id: Uuid,
    ) -> Result<Option<Session>, StoreError> {
        let row: Option<DocumentRow> = sqlx::query_as(
            r#"
            SELECT document
            FROM live_sessions
            WHERE document -> 'participants'
                  @> jsonb_build_array(jsonb_build_object('participant_id', $1::text))
            "#,
        )
        .bind(participant_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.document.0))
    }

    #[instrument(skip_all, fields(session_id = %id))]
    async fn update(&self, id: SessionId, mutation: Mutation) -> Result<Updated, RuntimeError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::from)?;

        let row: Option<DocumentRow> =
            sqlx::query_as("SELECT document FROM live_sessions WHERE id = $1 FOR UPDATE")
                .bind(id.0)
                .fetch_optional(&mut *tx)
                .await
                .map_err(StoreError::from)?;

        let mut session = row
            .ok_or_else(|| RuntimeError::NotFound("Session".to_string()))?
            .document
            .0;

        // Dropping `tx` on the error path rolls back and releases the lock.
        let snapshot = session.clone();
        let applied = mutation(&mut session)?;

        if applied == Applied::Changed {
            sqlx::query(
                r#"
                UPDATE live_sessions
                SET document = $2, updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(id.0)
            .bind(Json(&session))
            .execute(&mut *tx)
            .await
            .map_err(StoreError::from)?;
        } else {
            session = snapshot;
        }

        tx.commit().await.map_err(StoreError::from)?;

        Ok(Updated { session, applied })
    }

    #[instrument(skip_all, fields(session_id = %id))]
    async fn touch_participant(
        &self,
        id: SessionId,
        identity: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE live_sessions s
            SET document = jsonb_set(
                    s.document,
                    ARRAY['participants', p.idx::text, 'last_active_at'],
                    to_jsonb($3::timestamptz)
                )
            FROM (
                SELECT (arr.ord - 1) AS idx
                FROM live_sessions ls,
                     jsonb_array_elements(ls.document -> 'participants')
                         WITH ORDINALITY AS arr(elem, ord)
                WHERE ls.id = $1 AND arr.elem ->> 'identity' = $2
            ) p
            WHERE s.id = $1
            "#,
        )
        .bind(id.0)
        .bind(identity)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip_all, fields(session_id = %check_out.session_id))]
    async fn record_check_out(&self, check_out: CheckOut) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO attendance_check_outs (session_id, identity, checked_out_at)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(check_out.session_id.0)
        .bind(&check_out.identity)
        .bind(check_out.at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip_all, fields(session_id = %id))]
    async fn set_recording(
        &self,
        id: SessionId,
        recording: RecordingState,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE live_sessions
            SET document = jsonb_set(document, '{recording}', $2),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .bind(Json(&recording))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Store tests against a real database, one fresh schema per test.
#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod integration_tests {
    use super::*;
    use crate::model::{MembershipStatus, Participant, RecordingStatus, Role};
    use chrono::TimeZone;

    fn session_with(identities: &[&str]) -> Session {
        let mut session = Session::new("abc-defg-hij", "org", "All hands");
        let now = Utc::now();
        for identity in identities {
            session.participants.push(Participant::new(
                *identity,
                None,
                Role::Attendee,
                MembershipStatus::Active,
                now,
            ));
        }
        session
    }

    async fn seeded(pool: PgPool, session: &Session) -> PgSessionStore {
        let store = PgSessionStore::new(pool);
        store
            .insert(session.clone())
            .await
            .expect("Failed to insert session");
        store
    }

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_insert_and_lookup(pool: PgPool) {
        let session = session_with(&[]);
        let store = seeded(pool, &session).await;

        let by_id = store.find_by_id(session.id).await.unwrap().unwrap();
        assert_eq!(by_id, session);
        let by_code = store.find_by_room_code("abc-defg-hij").await.unwrap().unwrap();
        assert_eq!(by_code.id, session.id);
        assert!(store.find_by_room_code("zzz").await.unwrap().is_none());

        let duplicate = store.insert(session_with(&[])).await;
        assert!(matches!(duplicate, Err(StoreError::Duplicate(code)) if code == "abc-defg-hij"));
    }

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_update_persists_changes(pool: PgPool) {
        let session = session_with(&["alice"]);
        let store = seeded(pool, &session).await;

        let updated = store
            .update(
                session.id,
                Box::new(|s: &mut Session| {
                    s.title = "Renamed".to_string();
                    Ok(Applied::Changed)
                }),
            )
            .await
            .unwrap();
        assert!(updated.changed());
        assert_eq!(updated.session.title, "Renamed");

        let stored = store.find_by_id(session.id).await.unwrap().unwrap();
        assert_eq!(stored.title, "Renamed");
        assert_eq!(stored.participants, session.participants);
    }

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_update_discards_unchanged_and_failed_mutations(pool: PgPool) {
        let session = session_with(&[]);
        let store = seeded(pool, &session).await;

        // A mutation that reports no change has its edits thrown away.
        let unchanged = store
            .update(
                session.id,
                Box::new(|s: &mut Session| {
                    s.title = "Scratch".to_string();
                    Ok(Applied::Unchanged)
                }),
            )
            .await
            .unwrap();
        assert!(!unchanged.changed());
        assert_eq!(unchanged.session.title, "All hands");

        let err = store
            .update(
                session.id,
                Box::new(|s: &mut Session| {
                    s.title = "Half done".to_string();
                    Err(RuntimeError::Validation("nope".to_string()))
                }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Validation(_)));

        let stored = store.find_by_id(session.id).await.unwrap().unwrap();
        assert_eq!(stored.title, "All hands");

        let err = store
            .update(SessionId::new(), Box::new(|_: &mut Session| Ok(Applied::Changed)))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::NotFound(_)));
    }

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_concurrent_updates_are_serialized(pool: PgPool) {
        let session = session_with(&[]);
        let store = seeded(pool, &session).await;

        let writers: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                let id = session.id;
                tokio::spawn(async move {
                    store
                        .update(
                            id,
                            Box::new(move |s: &mut Session| {
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
                })
            })
            .collect();
        for result in futures::future::join_all(writers).await {
            result.unwrap().unwrap();
        }

        let stored = store.find_by_id(session.id).await.unwrap().unwrap();
        assert_eq!(stored.participants.len(), 8);
        assert_eq!(stored.active_count(), 8);
    }

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_touch_participant_sets_only_target(pool: PgPool) {
        let session = session_with(&["alice", "bob"]);
        let store = seeded(pool, &session).await;
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 30, 0).unwrap();

        store.touch_participant(session.id, "bob", at).await.unwrap();
        // Unknown identities are ignored.
        store.touch_participant(session.id, "carol", at).await.unwrap();

        let stored = store.find_by_id(session.id).await.unwrap().unwrap();
        assert_eq!(stored.participant("bob").unwrap().last_active_at, at);
        assert_eq!(
            stored.participant("alice").unwrap().last_active_at,
            session.participant("alice").unwrap().last_active_at
        );
        assert_eq!(stored.participants.len(), 2);
    }

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_find_by_participant(pool: PgPool) {
        let session = session_with(&["alice", "bob"]);
        let bob = session.participant("bob").unwrap().participant_id;
        let store = seeded(pool, &session).await;

        let found = store.find_by_participant(bob).await.unwrap().unwrap();
        assert_eq!(found.id, session.id);
        assert!(store
            .find_by_participant(Uuid::new_v4())
            .await
            .unwrap()
            .is_none());
    }

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_set_recording_leaves_rest_of_document(pool: PgPool) {
        let session = session_with(&["alice"]);
        let store = seeded(pool, &session).await;

        store
            .set_recording(
                session.id,
                RecordingState {
                    status: RecordingStatus::Completed,
                    url: Some("https://recordings.example/abc.webm".to_string()),
                },
            )
            .await
            .unwrap();

        let stored = store.find_by_id(session.id).await.unwrap().unwrap();
        assert_eq!(stored.recording.status, RecordingStatus::Completed);
        assert_eq!(
            stored.recording.url.as_deref(),
            Some("https://recordings.example/abc.webm")
        );
        assert_eq!(stored.participants, session.participants);
        assert_eq!(stored.title, session.title);
    }

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_record_check_out_appends_row(pool: PgPool) {
        let session = session_with(&["alice"]);
        let store = seeded(pool.clone(), &session).await;
        let at = Utc::now();

        for _ in 0..2 {
            store
                .record_check_out(CheckOut {
                    session_id: session.id,
                    identity: "alice".to_string(),
                    at,
                })
                .await
                .unwrap();
        }

        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM attendance_check_outs WHERE session_id = $1 AND identity = $2",
        )
        .bind(session.id.0)
        .bind("alice")
        .fetch_one(&pool)
        .await
        .expect("Failed to count check-outs");
        assert_eq!(count, 2);
    }
}
