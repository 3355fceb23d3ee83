//! End-to-end session flows over the in-memory store.
//!
//! Covers:
//! - Lobby approval with organizer notification and late broadcasts
//! - Silent permission denial
//! - Leave/disconnect idempotency and active-count consistency
//! - Rejoin media policy and attendance history
//! - End of session closing every open membership
//! - Room retirement once the last member departs
//! - Concurrent joins and departures on one session

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use std::collections::HashSet;
use std::sync::Arc;

use live_runtime::actors::{ActorMetrics, DispatcherHandle, RoomRegistryHandle};
use live_runtime::config::RejoinMediaPolicy;
use live_runtime::errors::RuntimeError;
use live_runtime::model::{MembershipStatus, Session};
use live_runtime::protocol::{MediaChange, ServerEvent, SessionRef};
use live_runtime::runtime::{Admission, JoinedRoom, RuntimeSettings, SessionRuntime};
use live_runtime::store::{MemorySessionStore, SessionStore};
use live_test_utils::{SessionFixture, TestConnection};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

const ORGANIZER: &str = "organizer-1";

struct World {
    runtime: Arc<SessionRuntime>,
    store: Arc<MemorySessionStore>,
    session: Session,
}

async fn world(fixture: SessionFixture, settings: RuntimeSettings) -> World {
    let store = Arc::new(MemorySessionStore::new());
    let session = fixture.insert(store.as_ref()).await;
    let metrics = ActorMetrics::new();
    let dispatcher = DispatcherHandle::new(
        Arc::clone(&store) as Arc<dyn SessionStore>,
        Arc::clone(&metrics),
        256,
        CancellationToken::new(),
    );
    let runtime = Arc::new(SessionRuntime::new(
        Arc::clone(&store) as Arc<dyn SessionStore>,
        RoomRegistryHandle::new(metrics),
        dispatcher,
        settings,
    ));
    World {
        runtime,
        store,
        session,
    }
}

impl World {
    async fn connect(&self, identity: &str) -> TestConnection {
        TestConnection::subscribed(identity, self.runtime.dispatcher()).await
    }

    fn code(&self) -> SessionRef {
        SessionRef::Code(self.session.room_code.clone())
    }

    async fn join(&self, conn: &TestConnection) -> JoinedRoom {
        self.runtime
            .join(&conn.caller(), &self.code())
            .await
            .unwrap()
            .room
    }

    async fn room_count(&self) -> usize {
        self.runtime.rooms().get_status().await.unwrap().room_count
    }

    async fn current(&self) -> Session {
        self.store
            .find_by_id(self.session.id)
            .await
            .unwrap()
            .unwrap()
    }
}

#[tokio::test]
async fn test_lobby_approval_flow() {
    let w = world(
        SessionFixture::new(ORGANIZER).require_approval(),
        RuntimeSettings::default(),
    )
    .await;
    let mut organizer = w.connect(ORGANIZER).await;
    let organizer_room = w.join(&organizer).await;

    let mut bob = w.connect("bob").await;
    let outcome = w.runtime.join(&bob.caller(), &w.code()).await.unwrap();
    assert_eq!(outcome.admission, Admission::Pending);
    let bob_room = outcome.room;

    let waiting = organizer
        .wait_for(|e| matches!(e, ServerEvent::ParticipantWaiting { .. }))
        .await;
    let ServerEvent::ParticipantWaiting {
        participant,
        pending_count,
        ..
    } = waiting
    else {
        unreachable!("matched above");
    };
    assert_eq!(participant.identity, "bob");
    assert_eq!(pending_count, 1);

    // Nothing reaches the lobby while pending.
    w.runtime
        .send_message(&organizer.caller(), &organizer_room, "welcome")
        .await
        .unwrap();
    assert!(!bob
        .drain()
        .await
        .iter()
        .any(|e| matches!(e, ServerEvent::NewMessage { .. })));

    w.runtime
        .approve(&organizer.caller(), &organizer_room, "bob")
        .await
        .unwrap();
    bob.wait_for(|e| matches!(e, ServerEvent::Approved { .. }))
        .await;
    let joined = organizer
        .wait_for(|e| matches!(e, ServerEvent::ParticipantJoined { .. }))
        .await;
    assert!(matches!(
        joined,
        ServerEvent::ParticipantJoined { active_count: 2, ref participant, .. }
            if participant.identity == "bob"
    ));

    // Approved members now get room broadcasts.
    w.runtime
        .send_message(&organizer.caller(), &organizer_room, "hello bob")
        .await
        .unwrap();
    bob.wait_for(|e| matches!(e, ServerEvent::NewMessage { .. }))
        .await;
    w.runtime
        .send_message(&bob.caller(), &bob_room, "thanks")
        .await
        .unwrap();

    let session = w.current().await;
    assert_eq!(
        session.participant("bob").unwrap().status,
        MembershipStatus::Active
    );
    assert_eq!(session.active_count(), 2);
}

#[tokio::test]
async fn test_denied_create_poll_is_silent() {
    let w = world(SessionFixture::new(ORGANIZER), RuntimeSettings::default()).await;
    let mut organizer = w.connect(ORGANIZER).await;
    w.join(&organizer).await;
    let alice = w.connect("alice").await;
    let alice_room = w.join(&alice).await;
    organizer.drain().await;

    let err = w
        .runtime
        .create_poll(
            &alice.caller(),
            &alice_room,
            "Best language?",
            &["Rust".to_string(), "Rust".to_string()],
            false,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, RuntimeError::Forbidden(_)));
    assert!(w.current().await.polls.is_empty());
    assert!(organizer.drain().await.is_empty());
}

#[tokio::test]
async fn test_leave_and_disconnect_are_idempotent() {
    let w = world(SessionFixture::new(ORGANIZER), RuntimeSettings::default()).await;
    let mut organizer = w.connect(ORGANIZER).await;
    w.join(&organizer).await;
    let alice_tab1 = w.connect("alice").await;
    let alice_tab2 = w.connect("alice").await;
    let room1 = w.join(&alice_tab1).await;
    let room2 = w.join(&alice_tab2).await;
    let carol = w.connect("carol").await;
    let carol_room = w.join(&carol).await;
    organizer.drain().await;

    // One tab closing leaves alice in the session.
    w.runtime
        .disconnect(&alice_tab1.handle, std::slice::from_ref(&room1))
        .await;
    assert!(w.current().await.participant("alice").unwrap().is_active());

    // The last tab closing marks her left, once.
    w.runtime
        .disconnect(&alice_tab2.handle, std::slice::from_ref(&room2))
        .await;
    w.runtime
        .disconnect(&alice_tab2.handle, std::slice::from_ref(&room2))
        .await;
    let after_disconnect = w.current().await;
    let left_at = after_disconnect.participant("alice").unwrap().left_at;
    assert!(left_at.is_some());

    // Explicit leave twice: second is a no-op.
    w.runtime.leave(&carol.caller(), &w.code()).await.unwrap();
    w.runtime.leave(&carol.caller(), &w.code()).await.unwrap();
    w.runtime
        .disconnect(&carol.handle, std::slice::from_ref(&carol_room))
        .await;

    let session = w.current().await;
    assert_eq!(session.participant("alice").unwrap().left_at, left_at);
    assert_eq!(session.active_count(), 1);

    let lefts: Vec<_> = organizer
        .drain()
        .await
        .into_iter()
        .filter_map(|e| match e {
            ServerEvent::ParticipantLeft {
                identity,
                active_count,
                ..
            } => Some((identity, active_count)),
            _ => None,
        })
        .collect();
    assert_eq!(
        lefts,
        vec![("alice".to_string(), 2), ("carol".to_string(), 1)]
    );
    assert_eq!(lefts.last().unwrap().1, session.active_count());
}

#[tokio::test]
async fn test_rejoin_resets_media_and_archives_cycle() {
    let w = world(
        SessionFixture::new(ORGANIZER).with_speaker("sam"),
        RuntimeSettings {
            rejoin_media: RejoinMediaPolicy::Reset,
            ..RuntimeSettings::default()
        },
    )
    .await;
    let sam = w.connect("sam").await;
    let room = w.join(&sam).await;
    w.runtime
        .update_media(
            &sam.caller(),
            &room,
            MediaChange {
                video_enabled: Some(true),
                hand_raised: Some(true),
                ..MediaChange::default()
            },
        )
        .await
        .unwrap();

    w.runtime.leave(&sam.caller(), &w.code()).await.unwrap();
    let first_left = w.current().await.participant("sam").unwrap().left_at;

    let sam_again = w.connect("sam").await;
    w.join(&sam_again).await;

    let session = w.current().await;
    let p = session.participant("sam").unwrap();
    assert!(p.is_active());
    assert!(p.left_at.is_none());
    assert!(!p.media.video_enabled);
    assert!(!p.media.hand_raised);
    assert_eq!(p.history.len(), 1);
    assert_eq!(Some(p.history[0].left_at), first_left);
}

#[tokio::test]
async fn test_rejoin_can_preserve_media() {
    let w = world(
        SessionFixture::new(ORGANIZER).with_speaker("sam"),
        RuntimeSettings {
            rejoin_media: RejoinMediaPolicy::Preserve,
            ..RuntimeSettings::default()
        },
    )
    .await;
    let sam = w.connect("sam").await;
    let room = w.join(&sam).await;
    w.runtime
        .update_media(
            &sam.caller(),
            &room,
            MediaChange {
                video_enabled: Some(true),
                ..MediaChange::default()
            },
        )
        .await
        .unwrap();
    w.runtime.leave(&sam.caller(), &w.code()).await.unwrap();
    w.join(&w.connect("sam").await).await;

    assert!(w.current().await.participant("sam").unwrap().media.video_enabled);
}

#[tokio::test]
async fn test_end_closes_every_membership() {
    let w = world(SessionFixture::new(ORGANIZER), RuntimeSettings::default()).await;
    let organizer = w.connect(ORGANIZER).await;
    let room = w.join(&organizer).await;
    let mut alice = w.connect("alice").await;
    w.join(&alice).await;
    w.runtime.start(&organizer.caller(), &room).await.unwrap();

    w.runtime.end(&organizer.caller(), &room).await.unwrap();

    alice
        .wait_for(|e| matches!(e, ServerEvent::SessionEnded { .. }))
        .await;
    let session = w.current().await;
    assert!(session.participants.iter().all(|p| p.left_at.is_some()));
    assert_eq!(session.active_count(), 0);

    let err = w.runtime.join(&alice.caller(), &w.code()).await.unwrap_err();
    assert!(matches!(err, RuntimeError::Conflict(_)));
}

#[tokio::test]
async fn test_room_retired_after_sole_member_leaves() {
    let w = world(SessionFixture::new(ORGANIZER), RuntimeSettings::default()).await;
    let organizer = w.connect(ORGANIZER).await;
    let room = w.join(&organizer).await;
    assert_eq!(w.room_count().await, 1);

    w.runtime.leave(&organizer.caller(), &w.code()).await.unwrap();
    assert_eq!(w.room_count().await, 0);
    assert!(w
        .runtime
        .rooms()
        .lookup(room.room_code.as_str())
        .await
        .unwrap()
        .is_none());

    // The socket closing afterwards finds nothing to clean up.
    w.runtime
        .disconnect(&organizer.handle, std::slice::from_ref(&room))
        .await;
    assert_eq!(w.room_count().await, 0);

    // A fresh join gets a fresh room.
    let again = w.connect(ORGANIZER).await;
    w.join(&again).await;
    assert_eq!(w.room_count().await, 1);
    assert!(w.current().await.participant(ORGANIZER).unwrap().is_active());
}

#[tokio::test]
async fn test_room_survives_removal_while_others_remain() {
    let w = world(SessionFixture::new(ORGANIZER), RuntimeSettings::default()).await;
    let organizer = w.connect(ORGANIZER).await;
    let room = w.join(&organizer).await;
    let alice = w.connect("alice").await;
    w.join(&alice).await;

    w.runtime
        .remove_participant(&organizer.caller(), &room, "alice")
        .await
        .unwrap();

    assert_eq!(w.room_count().await, 1);
    w.runtime.leave(&organizer.caller(), &w.code()).await.unwrap();
    assert_eq!(w.room_count().await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_joins_and_departures_keep_one_entry_per_identity() {
    const USERS: usize = 24;

    let w = world(SessionFixture::new(ORGANIZER), RuntimeSettings::default()).await;
    let mut organizer = w.connect(ORGANIZER).await;
    w.join(&organizer).await;

    // Every user opens two tabs that join at once. A third of them leave,
    // a third close both tabs together, the rest stay.
    let mut tasks = JoinSet::new();
    for i in 0..USERS {
        let runtime = Arc::clone(&w.runtime);
        let code = w.code();
        tasks.spawn(async move {
            let identity = format!("user-{i}");
            let tab1 = TestConnection::subscribed(&identity, runtime.dispatcher()).await;
            let tab2 = TestConnection::subscribed(&identity, runtime.dispatcher()).await;
            let caller1 = tab1.caller();
            let caller2 = tab2.caller();
            let (first, second) = tokio::join!(
                runtime.join(&caller1, &code),
                runtime.join(&caller2, &code)
            );
            let room1 = first.unwrap().room;
            let room2 = second.unwrap().room;

            match i % 3 {
                0 => {
                    runtime.leave(&tab1.caller(), &code).await.unwrap();
                    runtime
                        .disconnect(&tab2.handle, std::slice::from_ref(&room2))
                        .await;
                }
                1 => {
                    tokio::join!(
                        runtime.disconnect(&tab1.handle, std::slice::from_ref(&room1)),
                        runtime.disconnect(&tab2.handle, std::slice::from_ref(&room2))
                    );
                }
                _ => {}
            }
            (tab1, tab2)
        });
    }
    let mut tabs = Vec::with_capacity(USERS);
    while let Some(joined) = tasks.join_next().await {
        tabs.push(joined.unwrap());
    }

    let session = w.current().await;
    let mut seen = HashSet::new();
    assert!(session
        .participants
        .iter()
        .all(|p| seen.insert(p.identity.clone())));
    assert_eq!(session.participants.len(), USERS + 1);

    let staying = (0..USERS).filter(|i| i % 3 == 2).count();
    assert_eq!(session.active_count(), staying + 1);
    for i in 0..USERS {
        let p = session.participant(&format!("user-{i}")).unwrap();
        assert_eq!(p.is_active(), i % 3 == 2, "user-{i}");
        assert_eq!(p.history.len(), 0, "user-{i} joined once");
    }

    let last_count = organizer
        .drain()
        .await
        .into_iter()
        .filter_map(|e| match e {
            ServerEvent::ParticipantJoined { active_count, .. }
            | ServerEvent::ParticipantLeft { active_count, .. } => Some(active_count),
            _ => None,
        })
        .last();
    assert_eq!(last_count, Some(session.active_count()));
}

#[tokio::test]
async fn test_end_stamps_rejected_participants() {
    let w = world(
        SessionFixture::new(ORGANIZER).require_approval(),
        RuntimeSettings::default(),
    )
    .await;
    let organizer = w.connect(ORGANIZER).await;
    let room = w.join(&organizer).await;
    let bob = w.connect("bob").await;
    w.join(&bob).await;
    w.runtime
        .reject(&organizer.caller(), &room, "bob")
        .await
        .unwrap();
    assert!(w.current().await.participant("bob").unwrap().left_at.is_none());

    w.runtime.start(&organizer.caller(), &room).await.unwrap();
    w.runtime.end(&organizer.caller(), &room).await.unwrap();

    let session = w.current().await;
    let bob = session.participant("bob").unwrap();
    assert_eq!(bob.status, MembershipStatus::Rejected);
    assert_eq!(bob.left_at, session.ended_at);
}
