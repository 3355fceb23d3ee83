//! `ConnectionActor` - per-client outbound relay.
//!
//! Each `ConnectionActor`:
//! - Owns the bounded outbound queue of exactly one client connection
//! - Receives events from rooms, the dispatcher, and direct replies
//! - Forwards them in order to the transport writer
//!
//! Delivery never blocks the sender. When the mailbox is full the event is
//! dropped and counted; a slow peer only loses its own events.
//!
//! # Lifecycle
//!
//! 1. Spawned by the gateway once the identity token is verified
//! 2. Runs until closed, cancelled, or the transport writer goes away
//! 3. Dropping the outbound sender on exit ends the writer's stream

use crate::errors::RuntimeError;
use crate::protocol::ServerEvent;

use super::messages::ConnectionMessage;
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};

use common::types::ConnectionId;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// Default channel buffer size for the connection mailbox.
pub const CONNECTION_CHANNEL_BUFFER: usize = 200;

/// Handle to a `ConnectionActor`.
#[derive(Clone, Debug)]
pub struct ConnectionActorHandle {
    sender: mpsc::Sender<ConnectionMessage>,
    cancel_token: CancellationToken,
    connection_id: ConnectionId,
    identity: Arc<str>,
    mailbox: Arc<MailboxMonitor>,
    metrics: Arc<ActorMetrics>,
}

impl ConnectionActorHandle {
    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Verified identity that owns this connection.
    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Queue an event without waiting.
    ///
    /// Returns false if the event was dropped (mailbox full or actor gone).
    pub fn deliver(&self, event: Arc<ServerEvent>) -> bool {
        match self.sender.try_send(ConnectionMessage::Deliver { event }) {
            Ok(()) => {
                self.mailbox.record_enqueue();
                true
            }
            Err(TrySendError::Full(_)) => {
                self.mailbox.record_drop();
                self.metrics.record_event_dropped();
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(
                    target: "rt.actor.connection",
                    connection_id = %self.connection_id,
                    "Delivery to closed connection skipped"
                );
                false
            }
        }
    }

    /// Events dropped on this connection so far.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.mailbox.messages_dropped()
    }

    /// Close the outbound stream after queued events drain.
    pub async fn close(&self, reason: impl Into<String>) -> Result<(), RuntimeError> {
        self.sender
            .send(ConnectionMessage::Close {
                reason: reason.into(),
            })
            .await
            .map_err(|e| RuntimeError::Internal(format!("channel send failed: {e}")))
    }

    pub async fn ping(&self) -> Result<(), RuntimeError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(ConnectionMessage::Ping { respond_to: tx })
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
}

/// The `ConnectionActor` implementation.
pub struct ConnectionActor {
    connection_id: ConnectionId,
    identity: Arc<str>,
    receiver: mpsc::Receiver<ConnectionMessage>,
    /// Transport writer side.
    outbound: mpsc::Sender<Arc<ServerEvent>>,
    cancel_token: CancellationToken,
    metrics: Arc<ActorMetrics>,
    mailbox: Arc<MailboxMonitor>,
}

impl ConnectionActor {
    /// Spawn a connection actor feeding `outbound`.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        connection_id: ConnectionId,
        identity: impl Into<Arc<str>>,
        outbound: mpsc::Sender<Arc<ServerEvent>>,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (ConnectionActorHandle, JoinHandle<()>) {
        Self::spawn_with_buffer(
            connection_id,
            identity,
            outbound,
            cancel_token,
            metrics,
            CONNECTION_CHANNEL_BUFFER,
        )
    }

    /// [`ConnectionActor::spawn`] with an explicit mailbox size.
    pub fn spawn_with_buffer(
        connection_id: ConnectionId,
        identity: impl Into<Arc<str>>,
        outbound: mpsc::Sender<Arc<ServerEvent>>,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
        buffer: usize,
    ) -> (ConnectionActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(buffer);
        let identity = identity.into();
        let mailbox = Arc::new(MailboxMonitor::new(
            ActorType::Connection,
            connection_id.to_string(),
        ));

        metrics.connection_created();

        let actor = Self {
            connection_id,
            identity: Arc::clone(&identity),
            receiver,
            outbound,
            cancel_token: cancel_token.clone(),
            metrics: Arc::clone(&metrics),
            mailbox: Arc::clone(&mailbox),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = ConnectionActorHandle {
            sender,
            cancel_token,
            connection_id,
            identity,
            mailbox,
            metrics,
        };

        (handle, task_handle)
    }

    #[instrument(
        skip_all,
        name = "rt.actor.connection",
        fields(connection_id = %self.connection_id)
    )]
    async fn run(mut self) {
        debug!(
            target: "rt.actor.connection",
            connection_id = %self.connection_id,
            "ConnectionActor started"
        );

        let mut close_reason = "transport closed".to_string();

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    close_reason = "cancelled".to_string();
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(ConnectionMessage::Deliver { event }) => {
                            self.mailbox.record_dequeue();
                            self.metrics.record_message_processed();
                            if self.outbound.send(event).await.is_err() {
                                break;
                            }
                        }
                        Some(ConnectionMessage::Close { reason }) => {
                            close_reason = reason;
                            break;
                        }
                        Some(ConnectionMessage::Ping { respond_to }) => {
                            let _ = respond_to.send(());
                        }
                        None => break,
                    }
                }
            }
        }

        self.metrics.connection_closed();

        info!(
            target: "rt.actor.connection",
            connection_id = %self.connection_id,
            identity = %self.identity,
            reason = %close_reason,
            messages_processed = self.mailbox.messages_processed(),
            messages_dropped = self.mailbox.messages_dropped(),
            "ConnectionActor stopped"
        );
    }
}

/// Spawn a connection whose outbound side is returned to the test.
#[cfg(test)]
pub(crate) fn spawn_test_connection(
    identity: &str,
) -> (ConnectionActorHandle, mpsc::Receiver<Arc<ServerEvent>>) {
    let (tx, rx) = mpsc::channel(256);
    let (handle, _task) = ConnectionActor::spawn(
        ConnectionId::new(),
        identity,
        tx,
        CancellationToken::new(),
        ActorMetrics::new(),
    );
    (handle, rx)
}
