//! `RoomActor` - live membership of one session room.
//!
//! The room holds no session state beyond who is connected. Each member
//! entry caches the role, permission set and membership status decided at
//! join time. Broadcasts reach active members only; pending members are
//! addressed individually.
//!
//! Events enter the room through one mailbox and are fanned out in arrival
//! order, so two events broadcast by the same sender reach every member in
//! the order they were sent.

use crate::errors::RuntimeError;
use crate::model::MembershipStatus;
use crate::protocol::ServerEvent;

use super::messages::{Evicted, RoomMember, RoomMessage, RoomSnapshot, Unregistered};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};

use common::types::{ConnectionId, SessionId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// Default channel buffer size for the room mailbox.
const ROOM_CHANNEL_BUFFER: usize = 500;

/// Handle to a `RoomActor`.
#[derive(Clone, Debug)]
pub struct RoomActorHandle {
    sender: mpsc::Sender<RoomMessage>,
    cancel_token: CancellationToken,
    room_code: Arc<str>,
    session_id: SessionId,
}

fn send_failed(e: impl std::fmt::Display) -> RuntimeError {
    RuntimeError::Internal(format!("channel send failed: {e}"))
}

fn receive_failed(e: impl std::fmt::Display) -> RuntimeError {
    RuntimeError::Internal(format!("response receive failed: {e}"))
}

impl RoomActorHandle {
    #[must_use]
    pub fn room_code(&self) -> &str {
        &self.room_code
    }

    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Add or replace a member entry. Returns the member count.
    pub async fn register(&self, member: RoomMember) -> Result<usize, RuntimeError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RoomMessage::Register {
                member,
                respond_to: tx,
            })
            .await
            .map_err(send_failed)?;
        rx.await.map_err(receive_failed)
    }

    pub async fn unregister(
        &self,
        connection_id: ConnectionId,
    ) -> Result<Option<Unregistered>, RuntimeError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RoomMessage::Unregister {
                connection_id,
                respond_to: tx,
            })
            .await
            .map_err(send_failed)?;
        rx.await.map_err(receive_failed)
    }

    /// Remove every connection of `identity`. Callers outside the registry
    /// go through [`super::RoomRegistryHandle::evict_identity`] so an emptied
    /// room is retired.
    pub async fn evict_identity(
        &self,
        identity: impl Into<String>,
    ) -> Result<Evicted, RuntimeError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RoomMessage::EvictIdentity {
                identity: identity.into(),
                respond_to: tx,
            })
            .await
            .map_err(send_failed)?;
        rx.await.map_err(receive_failed)
    }

    /// Update the cached status of an identity's connections.
    pub async fn set_status(
        &self,
        identity: impl Into<String>,
        status: MembershipStatus,
    ) -> Result<usize, RuntimeError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RoomMessage::SetStatus {
                identity: identity.into(),
                status,
                respond_to: tx,
            })
            .await
            .map_err(send_failed)?;
        rx.await.map_err(receive_failed)
    }

    pub async fn broadcast(
        &self,
        event: ServerEvent,
        exclude: Option<ConnectionId>,
    ) -> Result<(), RuntimeError> {
        self.sender
            .send(RoomMessage::Broadcast {
                event: Arc::new(event),
                exclude,
            })
            .await
            .map_err(send_failed)
    }

    /// Deliver to one active member connection. Returns false if it is not
    /// a member or is still in the lobby.
    pub async fn send_to_connection(
        &self,
        connection_id: ConnectionId,
        event: ServerEvent,
    ) -> Result<bool, RuntimeError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RoomMessage::SendToConnection {
                connection_id,
                event: Arc::new(event),
                respond_to: tx,
            })
            .await
            .map_err(send_failed)?;
        rx.await.map_err(receive_failed)
    }

    pub async fn send_to_identity(
        &self,
        identity: impl Into<String>,
        event: ServerEvent,
    ) -> Result<(), RuntimeError> {
        self.sender
            .send(RoomMessage::SendToIdentity {
                identity: identity.into(),
                event: Arc::new(event),
            })
            .await
            .map_err(send_failed)
    }

    pub async fn member(
        &self,
        connection_id: ConnectionId,
    ) -> Result<Option<RoomMember>, RuntimeError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RoomMessage::Member {
                connection_id,
                respond_to: tx,
            })
            .await
            .map_err(send_failed)?;
        rx.await.map_err(receive_failed)
    }

    pub async fn snapshot(&self) -> Result<RoomSnapshot, RuntimeError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RoomMessage::Snapshot { respond_to: tx })
            .await
            .map_err(send_failed)?;
        rx.await.map_err(receive_failed)
    }

    /// Drop every member and stop the actor. Returns how many were dropped.
    pub async fn close(&self) -> Result<usize, RuntimeError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RoomMessage::Close { respond_to: tx })
            .await
            .map_err(send_failed)?;
        rx.await.map_err(receive_failed)
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// The `RoomActor` implementation.
pub struct RoomActor {
    room_code: Arc<str>,
    session_id: SessionId,
    receiver: mpsc::Receiver<RoomMessage>,
    cancel_token: CancellationToken,
    members: HashMap<ConnectionId, RoomMember>,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl RoomActor {
    pub fn spawn(
        room_code: impl Into<Arc<str>>,
        session_id: SessionId,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (RoomActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(ROOM_CHANNEL_BUFFER);
        let room_code = room_code.into();

        let actor = Self {
            room_code: Arc::clone(&room_code),
            session_id,
            receiver,
            cancel_token: cancel_token.clone(),
            members: HashMap::new(),
            metrics,
            mailbox: MailboxMonitor::new(ActorType::Room, room_code.to_string()),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = RoomActorHandle {
            sender,
            cancel_token,
            room_code,
            session_id,
        };

        (handle, task_handle)
    }

    #[instrument(
        skip_all,
        name = "rt.actor.room",
        fields(room_code = %self.room_code, session_id = %self.session_id)
    )]
    async fn run(mut self) {
        info!(
            target: "rt.actor.room",
            room_code = %self.room_code,
            session_id = %self.session_id,
            "RoomActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "rt.actor.room",
                        room_code = %self.room_code,
                        "RoomActor received cancellation signal"
                    );
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_enqueue();
                            let should_exit = self.handle_message(message);
                            self.mailbox.record_dequeue();
                            self.metrics.record_message_processed();

                            if should_exit {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        info!(
            target: "rt.actor.room",
            room_code = %self.room_code,
            members_remaining = self.members.len(),
            messages_processed = self.mailbox.messages_processed(),
            "RoomActor stopped"
        );
    }

    /// Handle a single message. Returns true if the actor should exit.
    fn handle_message(&mut self, message: RoomMessage) -> bool {
        match message {
            RoomMessage::Register { member, respond_to } => {
                debug!(
                    target: "rt.actor.room",
                    room_code = %self.room_code,
                    connection_id = %member.connection_id(),
                    identity = %member.identity,
                    role = member.role.as_str(),
                    "Member registered"
                );
                self.members.insert(member.connection_id(), member);
                let _ = respond_to.send(self.members.len());
            }

            RoomMessage::Unregister {
                connection_id,
                respond_to,
            } => {
                let result = self.members.remove(&connection_id).map(|member| {
                    let identity_still_connected = self
                        .members
                        .values()
                        .any(|m| m.identity == member.identity);
                    Unregistered {
                        member,
                        identity_still_connected,
                        remaining: self.members.len(),
                    }
                });
                let _ = respond_to.send(result);
            }

            RoomMessage::EvictIdentity {
                identity,
                respond_to,
            } => {
                let ids: Vec<ConnectionId> = self
                    .members
                    .iter()
                    .filter(|(_, m)| m.identity == identity)
                    .map(|(id, _)| *id)
                    .collect();
                let members = ids
                    .iter()
                    .filter_map(|id| self.members.remove(id))
                    .collect();
                let _ = respond_to.send(Evicted {
                    members,
                    remaining: self.members.len(),
                });
            }

            RoomMessage::SetStatus {
                identity,
                status,
                respond_to,
            } => {
                let mut updated = 0;
                for member in self.members.values_mut().filter(|m| m.identity == identity) {
                    member.status = status;
                    updated += 1;
                }
                let _ = respond_to.send(updated);
            }

            RoomMessage::Broadcast { event, exclude } => {
                let mut reached = 0usize;
                for member in self
                    .members
                    .values()
                    .filter(|m| m.is_active() && Some(m.connection_id()) != exclude)
                {
                    if member.connection.deliver(Arc::clone(&event)) {
                        reached += 1;
                    }
                }
                debug!(
                    target: "rt.actor.room",
                    room_code = %self.room_code,
                    reached,
                    "Broadcast delivered"
                );
            }

            RoomMessage::SendToConnection {
                connection_id,
                event,
                respond_to,
            } => {
                // Lobby connections are addressed by identity only.
                let found = match self.members.get(&connection_id) {
                    Some(member) if member.is_active() => {
                        member.connection.deliver(event);
                        true
                    }
                    _ => false,
                };
                let _ = respond_to.send(found);
            }

            RoomMessage::SendToIdentity { identity, event } => {
                for member in self.members.values().filter(|m| m.identity == identity) {
                    member.connection.deliver(Arc::clone(&event));
                }
            }

            RoomMessage::Member {
                connection_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.members.get(&connection_id).cloned());
            }

            RoomMessage::Snapshot { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }

            RoomMessage::Close { respond_to } => {
                let dropped = self.members.len();
                self.members.clear();
                let _ = respond_to.send(dropped);
                return true;
            }
        }
        false
    }

    fn snapshot(&self) -> RoomSnapshot {
        let active = self.members.values().filter(|m| m.is_active()).count();
        let pending = self
            .members
            .values()
            .filter(|m| m.status == MembershipStatus::Pending)
            .count();
        RoomSnapshot {
            members: self.members.len(),
            active,
            pending,
        }
    }
}
