//! `RoomRegistryActor` - singleton map from room code to live room.
//!
//! - A room is created on the first registration for its code
//! - A room is retired when its last connection unregisters or is evicted
//! - Owns the root `CancellationToken`; each room gets a child token
//! - Detects room actors that exit unexpectedly via their `JoinHandle`

use crate::errors::RuntimeError;

use super::messages::{Evicted, RegistryMessage, RegistryStatus, RoomMember, Unregistered};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::room::{RoomActor, RoomActorHandle};

use chrono::{DateTime, Utc};
use common::types::{ConnectionId, SessionId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the registry mailbox.
const REGISTRY_CHANNEL_BUFFER: usize = 1000;

/// How long a retired room gets to finish before it is abandoned.
const ROOM_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to the `RoomRegistryActor`.
#[derive(Clone, Debug)]
pub struct RoomRegistryHandle {
    sender: mpsc::Sender<RegistryMessage>,
    cancel_token: CancellationToken,
}

impl RoomRegistryHandle {
    /// Spawn the registry actor and return a handle to it.
    #[must_use]
    pub fn new(metrics: Arc<ActorMetrics>) -> Self {
        let (sender, receiver) = mpsc::channel(REGISTRY_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();

        let actor = RoomRegistryActor {
            receiver,
            cancel_token: cancel_token.clone(),
            rooms: HashMap::new(),
            accepting_new: true,
            metrics,
            mailbox: MailboxMonitor::new(ActorType::Registry, "registry"),
        };

        tokio::spawn(actor.run());

        Self {
            sender,
            cancel_token,
        }
    }

    /// Register a member in the room for `room_code`, creating the room if
    /// needed. Returns the room handle.
    pub async fn register(
        &self,
        room_code: impl Into<String>,
        session_id: SessionId,
        member: RoomMember,
    ) -> Result<RoomActorHandle, RuntimeError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RegistryMessage::Register {
                room_code: room_code.into(),
                session_id,
                member,
                respond_to: tx,
            })
            .await
            .map_err(|e| RuntimeError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RuntimeError::Internal(format!("response receive failed: {e}")))?
    }

    /// Remove a connection from a room. `Ok(None)` if it was not a member.
    pub async fn unregister(
        &self,
        room_code: impl Into<String>,
        connection_id: ConnectionId,
    ) -> Result<Option<Unregistered>, RuntimeError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RegistryMessage::Unregister {
                room_code: room_code.into(),
                connection_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| RuntimeError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RuntimeError::Internal(format!("response receive failed: {e}")))?
    }

    /// Remove every connection of `identity` from a room. An unknown room
    /// yields an empty result.
    pub async fn evict_identity(
        &self,
        room_code: impl Into<String>,
        identity: impl Into<String>,
    ) -> Result<Evicted, RuntimeError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RegistryMessage::EvictIdentity {
                room_code: room_code.into(),
                identity: identity.into(),
                respond_to: tx,
            })
            .await
            .map_err(|e| RuntimeError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RuntimeError::Internal(format!("response receive failed: {e}")))?
    }

    pub async fn lookup(
        &self,
        room_code: impl Into<String>,
    ) -> Result<Option<RoomActorHandle>, RuntimeError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RegistryMessage::Lookup {
                room_code: room_code.into(),
                respond_to: tx,
            })
            .await
            .map_err(|e| RuntimeError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RuntimeError::Internal(format!("response receive failed: {e}")))
    }

    /// Drop every member of a room and retire it. Returns members dropped.
    pub async fn close_room(&self, room_code: impl Into<String>) -> Result<usize, RuntimeError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RegistryMessage::CloseRoom {
                room_code: room_code.into(),
                respond_to: tx,
            })
            .await
            .map_err(|e| RuntimeError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RuntimeError::Internal(format!("response receive failed: {e}")))
    }

    pub async fn get_status(&self) -> Result<RegistryStatus, RuntimeError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RegistryMessage::GetStatus { respond_to: tx })
            .await
            .map_err(|e| RuntimeError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RuntimeError::Internal(format!("response receive failed: {e}")))
    }

    /// Stop accepting registrations and cancel every room.
    pub async fn shutdown(&self) -> Result<(), RuntimeError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RegistryMessage::Shutdown { respond_to: tx })
            .await
            .map_err(|e| RuntimeError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RuntimeError::Internal(format!("response receive failed: {e}")))
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Token for actors that must stop with the registry.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

struct ManagedRoom {
    handle: RoomActorHandle,
    task_handle: JoinHandle<()>,
    created_at: DateTime<Utc>,
}

/// The `RoomRegistryActor` implementation.
pub struct RoomRegistryActor {
    receiver: mpsc::Receiver<RegistryMessage>,
    cancel_token: CancellationToken,
    rooms: HashMap<String, ManagedRoom>,
    accepting_new: bool,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl RoomRegistryActor {
    #[instrument(skip_all, name = "rt.actor.registry")]
    async fn run(mut self) {
        info!(target: "rt.actor.registry", "RoomRegistryActor started");

        loop {
            self.check_room_health().await;

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "rt.actor.registry",
                        "RoomRegistryActor received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_enqueue();
                            self.handle_message(message).await;
                            self.mailbox.record_dequeue();
                            self.metrics.record_message_processed();
                        }
                        None => {
                            info!(
                                target: "rt.actor.registry",
                                "RoomRegistryActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "rt.actor.registry",
            rooms_remaining = self.rooms.len(),
            messages_processed = self.mailbox.messages_processed(),
            "RoomRegistryActor stopped"
        );
    }

    async fn handle_message(&mut self, message: RegistryMessage) {
        match message {
            RegistryMessage::Register {
                room_code,
                session_id,
                member,
                respond_to,
            } => {
                let result = self.register(room_code, session_id, member).await;
                let _ = respond_to.send(result);
            }

            RegistryMessage::Unregister {
                room_code,
                connection_id,
                respond_to,
            } => {
                let result = self.unregister(&room_code, connection_id).await;
                let _ = respond_to.send(result);
            }

            RegistryMessage::EvictIdentity {
                room_code,
                identity,
                respond_to,
            } => {
                let result = self.evict_identity(&room_code, &identity).await;
                let _ = respond_to.send(result);
            }

            RegistryMessage::Lookup {
                room_code,
                respond_to,
            } => {
                let room = self.rooms.get(&room_code).map(|m| m.handle.clone());
                let _ = respond_to.send(room);
            }

            RegistryMessage::CloseRoom {
                room_code,
                respond_to,
            } => {
                let dropped = self.close_room(&room_code).await;
                let _ = respond_to.send(dropped);
            }

            RegistryMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(RegistryStatus {
                    room_count: self.rooms.len(),
                    connection_count: self.metrics.connection_count(),
                    is_draining: !self.accepting_new,
                    mailbox_depth: self.mailbox.current_depth(),
                });
            }

            RegistryMessage::Shutdown { respond_to } => {
                info!(
                    target: "rt.actor.registry",
                    room_count = self.rooms.len(),
                    "Initiating graceful shutdown"
                );
                self.accepting_new = false;
                self.cancel_token.cancel();
                let _ = respond_to.send(());
            }
        }
    }

    async fn register(
        &mut self,
        room_code: String,
        session_id: SessionId,
        member: RoomMember,
    ) -> Result<RoomActorHandle, RuntimeError> {
        if !self.accepting_new {
            return Err(RuntimeError::Conflict(
                "Runtime is shutting down".to_string(),
            ));
        }

        if !self.rooms.contains_key(&room_code) {
            let (handle, task_handle) = RoomActor::spawn(
                room_code.clone(),
                session_id,
                self.cancel_token.child_token(),
                Arc::clone(&self.metrics),
            );
            self.rooms.insert(
                room_code.clone(),
                ManagedRoom {
                    handle,
                    task_handle,
                    created_at: Utc::now(),
                },
            );
            self.metrics.room_created();
            info!(
                target: "rt.actor.registry",
                room_code = %room_code,
                session_id = %session_id,
                total_rooms = self.rooms.len(),
                "Room created"
            );
        }

        let handle = self
            .rooms
            .get(&room_code)
            .map(|m| m.handle.clone())
            .ok_or_else(|| RuntimeError::Internal("room vanished during register".to_string()))?;
        handle.register(member).await?;
        Ok(handle)
    }

    async fn unregister(
        &mut self,
        room_code: &str,
        connection_id: ConnectionId,
    ) -> Result<Option<Unregistered>, RuntimeError> {
        let Some(managed) = self.rooms.get(room_code) else {
            return Ok(None);
        };

        let result = managed.handle.unregister(connection_id).await?;
        if matches!(&result, Some(u) if u.remaining == 0) {
            self.retire_room(room_code);
        }
        Ok(result)
    }

    async fn evict_identity(
        &mut self,
        room_code: &str,
        identity: &str,
    ) -> Result<Evicted, RuntimeError> {
        let Some(managed) = self.rooms.get(room_code) else {
            return Ok(Evicted::default());
        };

        let evicted = managed.handle.evict_identity(identity).await?;
        if evicted.remaining == 0 {
            self.retire_room(room_code);
        }
        Ok(evicted)
    }

    async fn close_room(&mut self, room_code: &str) -> usize {
        let Some(managed) = self.rooms.get(room_code) else {
            return 0;
        };
        let dropped = match managed.handle.close().await {
            Ok(dropped) => dropped,
            Err(e) => {
                warn!(
                    target: "rt.actor.registry",
                    room_code = %room_code,
                    error = %e,
                    "Room close failed"
                );
                0
            }
        };
        self.retire_room(room_code);
        dropped
    }

    /// Remove a room and wait for its task in the background.
    fn retire_room(&mut self, room_code: &str) {
        let Some(managed) = self.rooms.remove(room_code) else {
            return;
        };
        managed.handle.cancel();
        self.metrics.room_removed();

        let lifetime = Utc::now() - managed.created_at;
        info!(
            target: "rt.actor.registry",
            room_code = %room_code,
            lifetime_seconds = lifetime.num_seconds(),
            total_rooms = self.rooms.len(),
            "Room retired"
        );

        let room_code = room_code.to_string();
        tokio::spawn(async move {
            match tokio::time::timeout(ROOM_STOP_TIMEOUT, managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "rt.actor.registry",
                        room_code = %room_code,
                        "Room actor task completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "rt.actor.registry",
                        room_code = %room_code,
                        error = ?e,
                        "Room actor task panicked during removal"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "rt.actor.registry",
                        room_code = %room_code,
                        "Room actor task cleanup timed out"
                    );
                }
            }
        });
    }

    async fn graceful_shutdown(&mut self) {
        self.accepting_new = false;

        for managed in self.rooms.values() {
            managed.handle.cancel();
        }

        for (room_code, managed) in self.rooms.drain() {
            self.metrics.room_removed();
            if let Err(e) = tokio::time::timeout(ROOM_STOP_TIMEOUT, managed.task_handle).await {
                warn!(
                    target: "rt.actor.registry",
                    room_code = %room_code,
                    error = %e,
                    "Room actor shutdown timed out"
                );
            }
        }

        info!(target: "rt.actor.registry", "Graceful shutdown complete");
    }

    async fn check_room_health(&mut self) {
        let finished: Vec<String> = self
            .rooms
            .iter()
            .filter(|(_, managed)| managed.task_handle.is_finished())
            .map(|(code, _)| code.clone())
            .collect();

        for room_code in finished {
            if let Some(managed) = self.rooms.remove(&room_code) {
                self.metrics.room_removed();
                match managed.task_handle.await {
                    Ok(()) => {
                        info!(
                            target: "rt.actor.registry",
                            room_code = %room_code,
                            "Room actor exited on its own"
                        );
                    }
                    Err(join_error) if join_error.is_panic() => {
                        error!(
                            target: "rt.actor.registry",
                            room_code = %room_code,
                            error = ?join_error,
                            "Room actor panicked - members must rejoin"
                        );
                        self.metrics.record_panic(ActorType::Room);
                    }
                    Err(_) => {}
                }
            }
        }
    }
}
