//! `DispatcherActor` - fire-and-forget side effects.
//!
//! Handlers hand off identity-targeted notifications, organizer stats
//! pushes, attendance check-outs and activity touches here after their
//! store write commits. Submission never blocks and never fails the
//! caller: a full mailbox drops the effect and counts it, and a failing
//! store write is logged and swallowed.
//!
//! The dispatcher also owns the private per-identity channels. Every
//! connection subscribes to its identity's channel when it opens, so a
//! notification reaches all of that identity's connections whether or not
//! they have joined a room.

use crate::errors::RuntimeError;
use crate::protocol::ServerEvent;
use crate::store::{CheckOut, SessionStore};

use super::connection::ConnectionActorHandle;
use super::messages::{DispatchMessage, SideEffect};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};

use chrono::{DateTime, Utc};
use common::types::{ConnectionId, SessionId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Handle to the `DispatcherActor`.
#[derive(Clone)]
pub struct DispatcherHandle {
    sender: mpsc::Sender<DispatchMessage>,
    cancel_token: CancellationToken,
    metrics: Arc<ActorMetrics>,
}

impl std::fmt::Debug for DispatcherHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherHandle")
            .field("capacity", &self.sender.capacity())
            .finish_non_exhaustive()
    }
}

impl DispatcherHandle {
    /// Spawn the dispatcher with a mailbox of `buffer` effects.
    #[must_use]
    pub fn new(
        store: Arc<dyn SessionStore>,
        metrics: Arc<ActorMetrics>,
        buffer: usize,
        cancel_token: CancellationToken,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(buffer);

        let actor = DispatcherActor {
            receiver,
            cancel_token: cancel_token.clone(),
            store,
            channels: HashMap::new(),
            metrics: Arc::clone(&metrics),
            mailbox: MailboxMonitor::new(ActorType::Dispatcher, "dispatcher"),
        };

        tokio::spawn(actor.run());

        Self {
            sender,
            cancel_token,
            metrics,
        }
    }

    /// Submit an effect without waiting. Returns false if it was dropped.
    pub fn dispatch(&self, effect: SideEffect) -> bool {
        let kind = effect.kind();
        match self.sender.try_send(DispatchMessage::Effect(effect)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.metrics.record_dispatch_dropped();
                warn!(
                    target: "rt.dispatch",
                    effect = kind,
                    "Dispatcher mailbox full, side effect dropped"
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(
                    target: "rt.dispatch",
                    effect = kind,
                    "Dispatcher stopped, side effect dropped"
                );
                false
            }
        }
    }

    pub fn notify(&self, identity: impl Into<String>, event: ServerEvent) -> bool {
        self.dispatch(SideEffect::Notify {
            identity: identity.into(),
            event: Arc::new(event),
        })
    }

    pub fn push_stats(&self, organizer_id: impl Into<String>, stats: crate::model::SessionStats) -> bool {
        self.dispatch(SideEffect::Stats {
            organizer_id: organizer_id.into(),
            stats,
        })
    }

    pub fn check_out(&self, session_id: SessionId, identity: impl Into<String>, at: DateTime<Utc>) -> bool {
        self.dispatch(SideEffect::CheckOut(CheckOut {
            session_id,
            identity: identity.into(),
            at,
        }))
    }

    pub fn touch(&self, session_id: SessionId, identity: impl Into<String>, at: DateTime<Utc>) -> bool {
        self.dispatch(SideEffect::Touch {
            session_id,
            identity: identity.into(),
            at,
        })
    }

    /// Attach a connection to its identity's private channel.
    ///
    /// Awaited so the subscription is in place before the caller proceeds.
    pub async fn subscribe(&self, connection: ConnectionActorHandle) -> Result<(), RuntimeError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(DispatchMessage::Subscribe {
                connection,
                respond_to: tx,
            })
            .await
            .map_err(|e| RuntimeError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RuntimeError::Internal(format!("response receive failed: {e}")))
    }

    pub async fn unsubscribe(
        &self,
        identity: impl Into<String>,
        connection_id: ConnectionId,
    ) -> Result<(), RuntimeError> {
        self.sender
            .send(DispatchMessage::Unsubscribe {
                identity: identity.into(),
                connection_id,
            })
            .await
            .map_err(|e| RuntimeError::Internal(format!("channel send failed: {e}")))
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }
}

/// The `DispatcherActor` implementation.
pub struct DispatcherActor {
    receiver: mpsc::Receiver<DispatchMessage>,
    cancel_token: CancellationToken,
    store: Arc<dyn SessionStore>,
    /// Private channels: identity to its open connections.
    channels: HashMap<String, Vec<ConnectionActorHandle>>,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl DispatcherActor {
    #[instrument(skip_all, name = "rt.actor.dispatcher")]
    async fn run(mut self) {
        info!(target: "rt.dispatch", "DispatcherActor started");

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => break,

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_enqueue();
                            self.handle_message(message);
                            self.mailbox.record_dequeue();
                            self.metrics.record_message_processed();
                        }
                        None => break,
                    }
                }
            }
        }

        info!(
            target: "rt.dispatch",
            channels = self.channels.len(),
            messages_processed = self.mailbox.messages_processed(),
            "DispatcherActor stopped"
        );
    }

    fn handle_message(&mut self, message: DispatchMessage) {
        match message {
            DispatchMessage::Subscribe {
                connection,
                respond_to,
            } => {
                self.channels
                    .entry(connection.identity().to_string())
                    .or_default()
                    .push(connection);
                let _ = respond_to.send(());
            }

            DispatchMessage::Unsubscribe {
                identity,
                connection_id,
            } => {
                if let Some(connections) = self.channels.get_mut(&identity) {
                    connections.retain(|c| c.connection_id() != connection_id);
                    if connections.is_empty() {
                        self.channels.remove(&identity);
                    }
                }
            }

            DispatchMessage::Effect(effect) => self.apply(effect),
        }
    }

    fn apply(&self, effect: SideEffect) {
        match effect {
            SideEffect::Notify { identity, event } => {
                self.deliver_private(&identity, &event);
            }

            SideEffect::Stats {
                organizer_id,
                stats,
            } => {
                let event = Arc::new(ServerEvent::StatsUpdate { stats });
                self.deliver_private(&organizer_id, &event);
            }

            SideEffect::CheckOut(check_out) => {
                let store = Arc::clone(&self.store);
                tokio::spawn(async move {
                    let session_id = check_out.session_id;
                    if let Err(e) = store.record_check_out(check_out).await {
                        warn!(
                            target: "rt.dispatch",
                            session_id = %session_id,
                            error = %e,
                            "Attendance check-out write failed"
                        );
                    }
                });
            }

            SideEffect::Touch {
                session_id,
                identity,
                at,
            } => {
                let store = Arc::clone(&self.store);
                tokio::spawn(async move {
                    if let Err(e) = store.touch_participant(session_id, &identity, at).await {
                        debug!(
                            target: "rt.dispatch",
                            session_id = %session_id,
                            error = %e,
                            "Activity touch failed"
                        );
                    }
                });
            }
        }
    }

    fn deliver_private(&self, identity: &str, event: &Arc<ServerEvent>) {
        match self.channels.get(identity) {
            Some(connections) => {
                for connection in connections {
                    connection.deliver(Arc::clone(event));
                }
            }
            None => {
                debug!(
                    target: "rt.dispatch",
                    identity = %identity,
                    "No open connection for notification"
                );
            }
        }
    }
}
