//! Connection endpoint that collects outbound events for assertions.
//!
//! Stands in for the WebSocket writer: the connection actor delivers into
//! a channel the test reads from.

use live_runtime::actors::{ActorMetrics, ConnectionActor, ConnectionActorHandle, DispatcherHandle};
use live_runtime::protocol::ServerEvent;
use live_runtime::runtime::Caller;
use common::types::ConnectionId;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// How long [`TestConnection::next_event`] waits.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(2);

/// A connection actor plus the receiving end of its outbound queue.
#[derive(Debug)]
pub struct TestConnection {
    pub handle: ConnectionActorHandle,
    display_name: Option<String>,
    events: mpsc::Receiver<Arc<ServerEvent>>,
}

impl TestConnection {
    /// Spawn a connection for `identity`.
    #[must_use]
    pub fn open(identity: &str) -> Self {
        Self::open_with(identity, ActorMetrics::new())
    }

    #[must_use]
    pub fn open_with(identity: &str, metrics: Arc<ActorMetrics>) -> Self {
        let (tx, events) = mpsc::channel(1024);
        let (handle, _task) = ConnectionActor::spawn(
            ConnectionId::new(),
            identity,
            tx,
            CancellationToken::new(),
            metrics,
        );
        Self {
            handle,
            display_name: None,
            events,
        }
    }

    /// Spawn and subscribe to the identity's private channel.
    pub async fn subscribed(identity: &str, dispatcher: &DispatcherHandle) -> Self {
        let connection = Self::open(identity);
        dispatcher.subscribe(connection.handle.clone()).await.unwrap();
        connection
    }

    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn caller(&self) -> Caller {
        Caller::new(self.handle.clone(), self.display_name.clone())
    }

    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.handle.connection_id()
    }

    /// Next event, failing the test after [`EVENT_TIMEOUT`].
    pub async fn next_event(&mut self) -> ServerEvent {
        let event = tokio::time::timeout(EVENT_TIMEOUT, self.events.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("connection closed");
        (*event).clone()
    }

    /// Skip events until one matches `predicate`.
    pub async fn wait_for(&mut self, predicate: impl Fn(&ServerEvent) -> bool) -> ServerEvent {
        loop {
            let event = self.next_event().await;
            if predicate(&event) {
                return event;
            }
        }
    }

    /// Everything delivered so far, after letting in-flight events land.
    pub async fn drain(&mut self) -> Vec<ServerEvent> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push((*event).clone());
        }
        out
    }

    /// Close the connection actor, as a socket close would.
    pub async fn close(&self) {
        let _ = self.handle.close("test closed").await;
    }
}
