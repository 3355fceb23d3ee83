//! Session State Store.
//!
//! The persisted session document is the source of truth; the room registry
//! is only a cache of who is connected. Handlers never read-modify-write a
//! document themselves. They hand a [`Mutation`] to [`SessionStore::update`],
//! which applies it atomically against the current document (per-document
//! lock in memory, `SELECT ... FOR UPDATE` in Postgres) and returns the
//! post-write state that broadcasts are derived from.

pub mod memory;
pub mod postgres;

pub use memory::MemorySessionStore;
pub use postgres::PgSessionStore;

use crate::errors::RuntimeError;
use crate::model::{RecordingState, Session};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::types::SessionId;
use thiserror::Error;
use uuid::Uuid;

/// Outcome reported by a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// Document changed and must be written.
    Changed,
    /// Nothing to write (idempotent repeat).
    Unchanged,
}

/// A document edit applied under the store's per-document atomicity.
///
/// Returning `Err` aborts the update with no write.
pub type Mutation = Box<dyn FnOnce(&mut Session) -> Result<Applied, RuntimeError> + Send>;

/// Post-write state returned by [`SessionStore::update`].
#[derive(Debug, Clone)]
pub struct Updated {
    pub session: Session,
    pub applied: Applied,
}

impl Updated {
    #[must_use]
    pub fn changed(&self) -> bool {
        self.applied == Applied::Changed
    }
}

/// Store-level failures. Callers see these as `RuntimeError::Backend`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("document encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("duplicate session: {0}")]
    Duplicate(String),
}

impl From<StoreError> for RuntimeError {
    fn from(err: StoreError) -> Self {
        RuntimeError::Backend(err.to_string())
    }
}

/// A recorded attendance check-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOut {
    pub session_id: SessionId,
    pub identity: String,
    pub at: DateTime<Utc>,
}

/// Persisted session state consumed by the runtime.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a new session document. Sessions are created by the
    /// surrounding platform; the runtime only calls this from fixtures.
    async fn insert(&self, session: Session) -> Result<(), StoreError>;

    async fn find_by_id(&self, id: SessionId) -> Result<Option<Session>, StoreError>;

    async fn find_by_room_code(&self, room_code: &str) -> Result<Option<Session>, StoreError>;

    /// Find the session embedding the participant with `participant_id`.
    async fn find_by_participant(&self, participant_id: Uuid)
        -> Result<Option<Session>, StoreError>;

    /// Atomic fetch-modify-save of one session document.
    ///
    /// Fails with `NotFound` if the session does not exist, with the
    /// mutation's own error if it rejects, or with `Backend`.
    async fn update(&self, id: SessionId, mutation: Mutation) -> Result<Updated, RuntimeError>;

    /// Narrow update of one participant's `last_active_at`.
    async fn touch_participant(
        &self,
        id: SessionId,
        identity: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Append an attendance check-out record.
    async fn record_check_out(&self, check_out: CheckOut) -> Result<(), StoreError>;

    /// Narrow update of the session's recording status/URL.
    async fn set_recording(&self, id: SessionId, recording: RecordingState)
        -> Result<(), StoreError>;
}
