//! WebRTC and file-transfer relay.
//!
//! Payloads are opaque and never persisted. A targeted message goes to one
//! connection; an untargeted one goes to every other admitted member. Both
//! travel through the room mailbox, so messages from one sender keep their
//! order per recipient.

use super::{Caller, JoinedRoom, SessionRuntime};
use crate::errors::RuntimeError;
use crate::protocol::{ServerEvent, SignalEnvelope, SignalKind};

use common::types::ConnectionId;
use tracing::trace;

impl SessionRuntime {
    pub async fn relay(
        &self,
        caller: &Caller,
        joined: &JoinedRoom,
        kind: SignalKind,
        target: Option<ConnectionId>,
        payload: serde_json::Value,
    ) -> Result<(), RuntimeError> {
        let (room, member) = self.active_member(caller, joined).await?;

        let event = ServerEvent::signal(
            kind,
            SignalEnvelope {
                session_id: joined.session_id,
                from_connection: caller.connection_id(),
                from_identity: member.identity,
                payload,
            },
        );

        match target {
            Some(target) => {
                if !room.send_to_connection(target, event).await? {
                    return Err(RuntimeError::NotFound("Target connection".to_string()));
                }
            }
            None => room.broadcast(event, Some(caller.connection_id())).await?,
        }

        trace!(
            target: "rt.signaling",
            kind = kind.as_str(),
            from = %caller.connection_id(),
            to = ?target,
            "Relayed"
        );
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::super::testing::{harness, open_settings, ORGANIZER};
    use super::*;
    use crate::model::SessionSettings;
    use serde_json::json;

    #[tokio::test]
    async fn test_targeted_relay_preserves_order() {
        let h = harness(open_settings()).await;
        let alice = h.join("alice").await;
        let mut bob = h.join("bob").await;
        bob.drain().await;

        let target = Some(bob.caller.connection_id());
        h.runtime
            .relay(&alice.caller, &alice.joined, SignalKind::WebrtcOffer, target, json!({"sdp": "o"}))
            .await
            .unwrap();
        for n in 0..3 {
            h.runtime
                .relay(
                    &alice.caller,
                    &alice.joined,
                    SignalKind::IceCandidate,
                    target,
                    json!({ "n": n }),
                )
                .await
                .unwrap();
        }

        let seen = bob.drain().await;
        assert_eq!(seen.len(), 4);
        let ServerEvent::WebrtcOffer(offer) = &seen[0] else {
            unreachable!("first relayed event is the offer");
        };
        assert_eq!(offer.from_identity, "alice");
        assert_eq!(offer.from_connection, alice.caller.connection_id());
        for (n, event) in seen[1..].iter().enumerate() {
            let ServerEvent::IceCandidate(env) = event else {
                unreachable!("remaining events are candidates");
            };
            assert_eq!(env.payload, json!({ "n": n }));
        }
    }

    #[tokio::test]
    async fn test_broadcast_relay_skips_sender() {
        let h = harness(open_settings()).await;
        let mut organizer = h.join(ORGANIZER).await;
        let mut alice = h.join("alice").await;
        organizer.drain().await;
        alice.drain().await;

        h.runtime
            .relay(&alice.caller, &alice.joined, SignalKind::FileTransfer, None, json!({"chunk": 1}))
            .await
            .unwrap();

        assert_eq!(organizer.drain().await.len(), 1);
        assert!(alice.drain().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_target() {
        let h = harness(open_settings()).await;
        let alice = h.join("alice").await;

        let err = h
            .runtime
            .relay(
                &alice.caller,
                &alice.joined,
                SignalKind::WebrtcAnswer,
                Some(ConnectionId::new()),
                json!({}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_pending_member_cannot_relay() {
        let settings = SessionSettings {
            require_approval: true,
            ..open_settings()
        };
        let h = harness(settings).await;
        let _organizer = h.join(ORGANIZER).await;
        let bob = h.join("bob").await;

        let err = h
            .runtime
            .relay(&bob.caller, &bob.joined, SignalKind::WebrtcOffer, None, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_targeted_relay_to_pending_member_is_not_found() {
        let settings = SessionSettings {
            require_approval: true,
            ..open_settings()
        };
        let h = harness(settings).await;
        let organizer = h.join(ORGANIZER).await;
        let mut bob = h.join("bob").await;
        bob.drain().await;

        let err = h
            .runtime
            .relay(
                &organizer.caller,
                &organizer.joined,
                SignalKind::WebrtcOffer,
                Some(bob.caller.connection_id()),
                json!({"sdp": "o"}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::NotFound(_)));
        assert!(bob.drain().await.is_empty());

        // Once approved the same connection is reachable.
        h.runtime
            .approve(&organizer.caller, &organizer.joined, "bob")
            .await
            .unwrap();
        bob.drain().await;
        h.runtime
            .relay(
                &organizer.caller,
                &organizer.joined,
                SignalKind::WebrtcOffer,
                Some(bob.caller.connection_id()),
                json!({"sdp": "o"}),
            )
            .await
            .unwrap();
        let seen = bob.drain().await;
        assert!(matches!(seen.as_slice(), [ServerEvent::WebrtcOffer(_)]));
    }
}
