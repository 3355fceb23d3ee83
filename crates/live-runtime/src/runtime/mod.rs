//! Session runtime: lifecycle, interaction and signaling handlers.
//!
//! Every mutating handler follows the same path:
//!
//! 1. look up the caller's room membership (room-cached role and status)
//! 2. consult [`permissions::require`]
//! 3. validate the payload
//! 4. hand a mutation to [`SessionStore::update`]
//! 5. broadcast a delta built from the post-write document
//!
//! Steps 1-3 never touch the store, so a denied or invalid request leaves
//! no trace beyond the error returned to the caller. Counts in broadcasts
//! always come from the committed document.

mod chat;
mod lifecycle;
mod media;
mod polls;
mod questions;
mod signaling;

pub use lifecycle::{Admission, JoinOutcome};

use crate::actors::{ConnectionActorHandle, DispatcherHandle, RoomActorHandle, RoomMember, RoomRegistryHandle};
use crate::config::{Config, RejoinMediaPolicy, DEFAULT_CHAT_MAX_LENGTH};
use crate::errors::RuntimeError;
use crate::model::{MembershipStatus, Role, Session};
use crate::permissions::{self, Action};
use crate::protocol::{ServerEvent, SessionRef};
use crate::store::{Mutation, SessionStore, Updated};

use chrono::Utc;
use common::types::{ConnectionId, SessionId};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::warn;

/// Longest accepted reaction, in characters.
pub const MAX_REACTION_LENGTH: usize = 16;

/// Lock stripes for membership transitions.
const MEMBERSHIP_STRIPES: usize = 64;

/// Handler tunables taken from [`Config`].
#[derive(Debug, Clone, Copy)]
pub struct RuntimeSettings {
    pub chat_max_length: usize,
    pub rejoin_media: RejoinMediaPolicy,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            chat_max_length: DEFAULT_CHAT_MAX_LENGTH,
            rejoin_media: RejoinMediaPolicy::default(),
        }
    }
}

impl From<&Config> for RuntimeSettings {
    fn from(config: &Config) -> Self {
        Self {
            chat_max_length: config.chat_max_length,
            rejoin_media: config.rejoin_media_policy,
        }
    }
}

/// The authenticated connection a request arrived on.
#[derive(Debug, Clone)]
pub struct Caller {
    pub connection: ConnectionActorHandle,
    /// Display name from the identity token.
    pub display_name: Option<String>,
}

impl Caller {
    #[must_use]
    pub fn new(connection: ConnectionActorHandle, display_name: Option<String>) -> Self {
        Self {
            connection,
            display_name,
        }
    }

    #[must_use]
    pub fn identity(&self) -> &str {
        self.connection.identity()
    }

    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.connection.connection_id()
    }
}

/// A session the connection has joined, as tracked by the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinedRoom {
    pub session_id: SessionId,
    pub room_code: String,
}

impl JoinedRoom {
    /// Whether a client-supplied reference names this session.
    #[must_use]
    pub fn matches(&self, session: &SessionRef) -> bool {
        match session {
            SessionRef::Id(id) => *id == self.session_id,
            SessionRef::Code(code) => *code == self.room_code,
        }
    }
}

/// Shared handler state. One instance serves every connection.
pub struct SessionRuntime {
    store: Arc<dyn SessionStore>,
    rooms: RoomRegistryHandle,
    dispatcher: DispatcherHandle,
    settings: RuntimeSettings,
    /// Held across commit and broadcast of a join or departure.
    membership: Vec<Mutex<()>>,
}

impl SessionRuntime {
    #[must_use]
    pub fn new(
        store: Arc<dyn SessionStore>,
        rooms: RoomRegistryHandle,
        dispatcher: DispatcherHandle,
        settings: RuntimeSettings,
    ) -> Self {
        Self {
            store,
            rooms,
            dispatcher,
            settings,
            membership: (0..MEMBERSHIP_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    #[must_use]
    pub fn rooms(&self) -> &RoomRegistryHandle {
        &self.rooms
    }

    #[must_use]
    pub fn dispatcher(&self) -> &DispatcherHandle {
        &self.dispatcher
    }

    #[must_use]
    pub fn settings(&self) -> RuntimeSettings {
        self.settings
    }

    /// Resolve a session by internal id or room code.
    pub(crate) async fn resolve(&self, session: &SessionRef) -> Result<Session, RuntimeError> {
        let found = match session {
            SessionRef::Id(id) => self.store.find_by_id(*id).await?,
            SessionRef::Code(code) => self.store.find_by_room_code(code).await?,
        };
        found.ok_or_else(|| RuntimeError::NotFound("Session".to_string()))
    }

    /// The caller's room entry, whatever its status.
    pub(crate) async fn member(
        &self,
        caller: &Caller,
        joined: &JoinedRoom,
    ) -> Result<(RoomActorHandle, RoomMember), RuntimeError> {
        let room = self
            .rooms
            .lookup(joined.room_code.as_str())
            .await?
            .ok_or_else(not_a_member)?;
        let member = room
            .member(caller.connection_id())
            .await?
            .ok_or_else(not_a_member)?;
        Ok((room, member))
    }

    /// The caller's room entry, which must be admitted.
    pub(crate) async fn active_member(
        &self,
        caller: &Caller,
        joined: &JoinedRoom,
    ) -> Result<(RoomActorHandle, RoomMember), RuntimeError> {
        let (room, member) = self.member(caller, joined).await?;
        if member.status != MembershipStatus::Active {
            return Err(RuntimeError::Forbidden(
                "Waiting for organizer approval".to_string(),
            ));
        }
        Ok((room, member))
    }

    /// Serialize membership transitions for one session, so `active_count`
    /// values reach the room in commit order. Sessions may share a stripe.
    pub(crate) async fn membership_guard(
        &self,
        session_id: SessionId,
    ) -> Result<MutexGuard<'_, ()>, RuntimeError> {
        let mut hasher = DefaultHasher::new();
        session_id.hash(&mut hasher);
        let stripe = usize::try_from(hasher.finish() % MEMBERSHIP_STRIPES as u64).unwrap_or(0);
        let lock = self
            .membership
            .get(stripe)
            .ok_or_else(|| RuntimeError::Internal("membership stripe out of range".to_string()))?;
        Ok(lock.lock().await)
    }

    /// Apply a mutation and, when it changed the document, push fresh stats
    /// to the organizer.
    pub(crate) async fn commit(
        &self,
        session_id: SessionId,
        mutation: Mutation,
    ) -> Result<Updated, RuntimeError> {
        let updated = self.store.update(session_id, mutation).await?;
        if updated.changed() {
            self.dispatcher
                .push_stats(updated.session.organizer_id.clone(), updated.session.stats());
        }
        Ok(updated)
    }

    /// Broadcast after a committed write. A failure here leaves the
    /// persisted state in place; the room is only a cache.
    pub(crate) async fn broadcast(
        &self,
        room: &RoomActorHandle,
        event: ServerEvent,
        exclude: Option<ConnectionId>,
    ) {
        if let Err(e) = room.broadcast(event, exclude).await {
            warn!(
                target: "rt.lifecycle",
                room_code = %room.room_code(),
                error = %e,
                "Broadcast failed after commit"
            );
        }
    }

    /// Record activity for the caller.
    pub(crate) fn touch(&self, caller: &Caller, joined: &JoinedRoom) {
        self.dispatcher
            .touch(joined.session_id, caller.identity(), Utc::now());
    }
}

/// Permission check against the room-cached role. Only the organizer holds
/// the organizer role, so the role doubles as the ownership flag.
pub(crate) fn authorize(member: &RoomMember, action: Action) -> Result<(), RuntimeError> {
    permissions::require(member.role, action, member.role == Role::Organizer)
}

fn not_a_member() -> RuntimeError {
    RuntimeError::Forbidden("Not a member of this session".to_string())
}

/// Shared validation for free-text fields.
pub(crate) fn validate_text(
    field: &str,
    content: &str,
    max_chars: usize,
) -> Result<String, RuntimeError> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(RuntimeError::Validation(format!("{field} cannot be empty")));
    }
    if trimmed.chars().count() > max_chars {
        return Err(RuntimeError::Validation(format!(
            "{field} exceeds {max_chars} characters"
        )));
    }
    Ok(trimmed.to_string())
}

/// Rejects mutations on ended or cancelled sessions.
pub(crate) fn ensure_open(session: &Session) -> Result<(), RuntimeError> {
    if session.status.is_terminal() {
        Err(RuntimeError::Conflict("Session has ended".to_string()))
    } else {
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Runtime wired over the in-memory store for handler tests.

    use super::*;
    use crate::actors::connection::spawn_test_connection;
    use crate::actors::ActorMetrics;
    use crate::model::SessionSettings;
    use crate::store::MemorySessionStore;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    pub const ORGANIZER: &str = "organizer-1";

    pub struct Harness {
        pub runtime: SessionRuntime,
        pub store: Arc<MemorySessionStore>,
        pub session_id: SessionId,
        pub room_code: String,
    }

    pub struct Client {
        pub caller: Caller,
        pub events: mpsc::Receiver<Arc<ServerEvent>>,
        pub joined: JoinedRoom,
    }

    impl Client {
        /// Drain events already delivered.
        pub async fn drain(&mut self) -> Vec<ServerEvent> {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                out.push((*event).clone());
            }
            out
        }
    }

    pub async fn harness(settings: SessionSettings) -> Harness {
        harness_with(settings, RuntimeSettings::default(), |_| {}).await
    }

    pub async fn harness_with(
        settings: SessionSettings,
        runtime_settings: RuntimeSettings,
        edit: impl FnOnce(&mut Session),
    ) -> Harness {
        let store = Arc::new(MemorySessionStore::new());
        let mut session = Session::new("abc-defg-hij", ORGANIZER, "Quarterly update");
        session.settings = settings;
        edit(&mut session);
        let session_id = session.id;
        let room_code = session.room_code.clone();
        store.insert(session).await.unwrap();

        let metrics = ActorMetrics::new();
        let rooms = RoomRegistryHandle::new(Arc::clone(&metrics));
        let dispatcher = DispatcherHandle::new(
            Arc::clone(&store) as Arc<dyn SessionStore>,
            metrics,
            256,
            CancellationToken::new(),
        );
        let runtime = SessionRuntime::new(
            Arc::clone(&store) as Arc<dyn SessionStore>,
            rooms,
            dispatcher,
            runtime_settings,
        );
        Harness {
            runtime,
            store,
            session_id,
            room_code,
        }
    }

    impl Harness {
        /// Open a connection for `identity` and subscribe its private channel.
        pub async fn connect(&self, identity: &str) -> (Caller, mpsc::Receiver<Arc<ServerEvent>>) {
            let (connection, rx) = spawn_test_connection(identity);
            self.runtime
                .dispatcher()
                .subscribe(connection.clone())
                .await
                .unwrap();
            (Caller::new(connection, Some(identity.to_uppercase())), rx)
        }

        pub async fn join(&self, identity: &str) -> Client {
            let (caller, events) = self.connect(identity).await;
            let outcome = self
                .runtime
                .join(&caller, &SessionRef::Id(self.session_id))
                .await
                .unwrap();
            Client {
                caller,
                events,
                joined: outcome.room,
            }
        }

        pub async fn session(&self) -> Session {
            self.store.find_by_id(self.session_id).await.unwrap().unwrap()
        }
    }

    pub fn open_settings() -> SessionSettings {
        SessionSettings {
            chat_enabled: true,
            polls_enabled: true,
            qa_enabled: true,
            recording_allowed: true,
            require_approval: false,
            max_participants: None,
        }
    }
}
