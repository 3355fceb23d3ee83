//! Mailbox message types for the runtime actors.

use super::connection::ConnectionActorHandle;
use super::room::RoomActorHandle;
use crate::errors::RuntimeError;
use crate::model::{MembershipStatus, Role, SessionStats};
use crate::permissions::{actions_for, Action};
use crate::protocol::ServerEvent;
use crate::store::CheckOut;
use chrono::{DateTime, Utc};
use common::types::{ConnectionId, SessionId};
use std::sync::Arc;
use tokio::sync::oneshot;

/// A connection's membership in a live room, with the role, permission set
/// and status cached at join time.
#[derive(Debug, Clone)]
pub struct RoomMember {
    pub connection: ConnectionActorHandle,
    pub identity: String,
    pub display_name: Option<String>,
    pub role: Role,
    pub permissions: &'static [Action],
    pub status: MembershipStatus,
}

impl RoomMember {
    #[must_use]
    pub fn new(
        connection: ConnectionActorHandle,
        display_name: Option<String>,
        role: Role,
        status: MembershipStatus,
    ) -> Self {
        Self {
            identity: connection.identity().to_string(),
            connection,
            display_name,
            role,
            permissions: actions_for(role),
            status,
        }
    }

    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.connection.connection_id()
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == MembershipStatus::Active
    }
}

/// Messages to a `ConnectionActor`.
#[derive(Debug)]
pub enum ConnectionMessage {
    /// Forward an event to the client transport.
    Deliver { event: Arc<ServerEvent> },

    /// Close the outbound stream.
    Close { reason: String },

    /// Liveness check.
    Ping { respond_to: oneshot::Sender<()> },
}

/// Result of removing one connection from a room.
#[derive(Debug, Clone)]
pub struct Unregistered {
    /// The removed member entry.
    pub member: RoomMember,
    /// Whether another connection for the same identity is still a member.
    pub identity_still_connected: bool,
    /// Members left in the room.
    pub remaining: usize,
}

/// Result of removing every connection of one identity from a room.
#[derive(Debug, Clone, Default)]
pub struct Evicted {
    pub members: Vec<RoomMember>,
    /// Members left in the room.
    pub remaining: usize,
}

impl Evicted {
    #[must_use]
    pub fn was_active(&self) -> bool {
        self.members.iter().any(RoomMember::is_active)
    }
}

/// Room membership summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomSnapshot {
    pub members: usize,
    pub active: usize,
    pub pending: usize,
}

/// Messages to a `RoomActor`.
#[derive(Debug)]
pub enum RoomMessage {
    Register {
        member: RoomMember,
        respond_to: oneshot::Sender<usize>,
    },

    Unregister {
        connection_id: ConnectionId,
        respond_to: oneshot::Sender<Option<Unregistered>>,
    },

    /// Remove every connection of an identity.
    EvictIdentity {
        identity: String,
        respond_to: oneshot::Sender<Evicted>,
    },

    /// Set the cached status of every connection of an identity.
    SetStatus {
        identity: String,
        status: MembershipStatus,
        respond_to: oneshot::Sender<usize>,
    },

    /// Deliver to every active member except `exclude`.
    Broadcast {
        event: Arc<ServerEvent>,
        exclude: Option<ConnectionId>,
    },

    /// Deliver to one connection. Replies whether it was a member.
    SendToConnection {
        connection_id: ConnectionId,
        event: Arc<ServerEvent>,
        respond_to: oneshot::Sender<bool>,
    },

    /// Deliver to every connection of an identity, pending or active.
    SendToIdentity {
        identity: String,
        event: Arc<ServerEvent>,
    },

    Member {
        connection_id: ConnectionId,
        respond_to: oneshot::Sender<Option<RoomMember>>,
    },

    Snapshot {
        respond_to: oneshot::Sender<RoomSnapshot>,
    },

    /// Drop every member and exit.
    Close {
        respond_to: oneshot::Sender<usize>,
    },
}

/// Registry status.
#[derive(Debug, Clone, Copy)]
pub struct RegistryStatus {
    pub room_count: usize,
    pub connection_count: usize,
    pub is_draining: bool,
    pub mailbox_depth: usize,
}

/// Messages to the `RoomRegistryActor`.
#[derive(Debug)]
pub enum RegistryMessage {
    /// Register a member, creating the room on first use.
    Register {
        room_code: String,
        session_id: SessionId,
        member: RoomMember,
        respond_to: oneshot::Sender<Result<RoomActorHandle, RuntimeError>>,
    },

    /// Remove a connection, retiring the room when it empties.
    Unregister {
        room_code: String,
        connection_id: ConnectionId,
        respond_to: oneshot::Sender<Result<Option<Unregistered>, RuntimeError>>,
    },

    /// Remove every connection of an identity, retiring the room when it
    /// empties.
    EvictIdentity {
        room_code: String,
        identity: String,
        respond_to: oneshot::Sender<Result<Evicted, RuntimeError>>,
    },

    Lookup {
        room_code: String,
        respond_to: oneshot::Sender<Option<RoomActorHandle>>,
    },

    /// Drop all members of a room and retire it.
    CloseRoom {
        room_code: String,
        respond_to: oneshot::Sender<usize>,
    },

    GetStatus {
        respond_to: oneshot::Sender<RegistryStatus>,
    },

    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

/// Fire-and-forget work for the dispatcher.
#[derive(Debug)]
pub enum SideEffect {
    /// Deliver an event on an identity's private channel.
    Notify {
        identity: String,
        event: Arc<ServerEvent>,
    },

    /// Push a stats snapshot to the session organizer.
    Stats {
        organizer_id: String,
        stats: SessionStats,
    },

    /// Record an attendance check-out.
    CheckOut(CheckOut),

    /// Refresh a participant's `last_active_at`.
    Touch {
        session_id: SessionId,
        identity: String,
        at: DateTime<Utc>,
    },
}

impl SideEffect {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            SideEffect::Notify { .. } => "notify",
            SideEffect::Stats { .. } => "stats",
            SideEffect::CheckOut(_) => "check_out",
            SideEffect::Touch { .. } => "touch",
        }
    }
}

/// Messages to the `DispatcherActor`.
#[derive(Debug)]
pub enum DispatchMessage {
    Effect(SideEffect),

    /// Attach a connection to its identity's private channel.
    Subscribe {
        connection: ConnectionActorHandle,
        respond_to: oneshot::Sender<()>,
    },

    Unsubscribe {
        identity: String,
        connection_id: ConnectionId,
    },
}
