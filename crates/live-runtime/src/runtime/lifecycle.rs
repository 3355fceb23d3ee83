//! Join, approval, departure and session status transitions.

use super::{authorize, ensure_open, Caller, JoinedRoom, SessionRuntime};
use crate::actors::{ConnectionActorHandle, RoomMember};
use crate::errors::RuntimeError;
use crate::model::{
    MembershipStatus, Participant, ParticipantView, Role, Session, SessionStats, SessionStatus,
    SettingsPatch,
};
use crate::permissions::Action;
use crate::protocol::{ServerEvent, SessionRef};
use crate::store::Applied;

use chrono::{DateTime, Utc};
use common::types::SessionId;
use tracing::{debug, info, instrument, warn};

/// How the caller was admitted.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Active {
        participant: ParticipantView,
        participants: Vec<ParticipantView>,
        active_count: usize,
    },
    Pending,
}

/// Result of a successful join.
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub room: JoinedRoom,
    pub admission: Admission,
}

impl JoinOutcome {
    /// Direct reply to the joining connection.
    #[must_use]
    pub fn reply(&self, request_id: Option<String>) -> ServerEvent {
        match &self.admission {
            Admission::Active {
                participant,
                participants,
                active_count,
            } => ServerEvent::Joined {
                request_id,
                session_id: self.room.session_id,
                room_code: self.room.room_code.clone(),
                participant: participant.clone(),
                participants: participants.clone(),
                active_count: *active_count,
            },
            Admission::Pending => ServerEvent::WaitingForApproval {
                request_id,
                session_id: self.room.session_id,
            },
        }
    }
}

/// Admits `identity` into the document, or reports why not.
///
/// A live entry (active or pending, not left) is left untouched so a join
/// repeated from another tab changes nothing. A departed entry starts a new
/// cycle with its original role.
fn admit(
    session: &mut Session,
    identity: &str,
    display_name: Option<String>,
    now: DateTime<Utc>,
    reset_media: bool,
) -> Result<Applied, RuntimeError> {
    ensure_open(session)?;

    let active = session.active_count();
    let full = session
        .settings
        .max_participants
        .is_some_and(|max| active >= usize::try_from(max).unwrap_or(usize::MAX));
    let require_approval = session.settings.require_approval;
    let is_organizer = session.is_organizer(identity);
    let first_role = session.role_for(identity);

    let admit_as = |role: Role| {
        if role == Role::Attendee && require_approval {
            MembershipStatus::Pending
        } else {
            MembershipStatus::Active
        }
    };
    let check_capacity = |status: MembershipStatus| {
        if status == MembershipStatus::Active && full && !is_organizer {
            Err(RuntimeError::Conflict("Session is full".to_string()))
        } else {
            Ok(())
        }
    };

    match session.participant_mut(identity) {
        Some(p) if p.status == MembershipStatus::Rejected => Err(RuntimeError::Forbidden(
            "Join request was rejected".to_string(),
        )),
        Some(p) if p.left_at.is_none() => Ok(Applied::Unchanged),
        Some(p) => {
            let status = admit_as(p.role);
            check_capacity(status)?;
            p.begin_cycle(status, now, reset_media);
            if display_name.is_some() {
                p.display_name = display_name;
            }
            Ok(Applied::Changed)
        }
        None => {
            let status = admit_as(first_role);
            check_capacity(status)?;
            session.participants.push(Participant::new(
                identity,
                display_name,
                first_role,
                status,
                now,
            ));
            Ok(Applied::Changed)
        }
    }
}

/// Closes the identity's open membership. No-op if already closed.
fn depart(session: &mut Session, identity: &str, now: DateTime<Utc>) -> Applied {
    match session.participant_mut(identity) {
        Some(p)
            if matches!(p.status, MembershipStatus::Active | MembershipStatus::Pending)
                && p.left_at.is_none() =>
        {
            p.mark_left(now);
            Applied::Changed
        }
        _ => Applied::Unchanged,
    }
}

/// Admitted or pending identities whose `left_at` was stamped at `at`.
fn closed_at(session: &Session, at: DateTime<Utc>) -> Vec<String> {
    session
        .participants
        .iter()
        .filter(|p| p.left_at == Some(at) && p.status != MembershipStatus::Rejected)
        .map(|p| p.identity.clone())
        .collect()
}

impl SessionRuntime {
    /// Join a session by id or room code.
    ///
    /// Admitted callers receive the roster and everyone in the room sees
    /// `participant-joined`. Callers held for approval are registered in
    /// the room but receive no broadcasts until approved.
    #[instrument(skip_all, name = "rt.lifecycle.join", fields(identity = %caller.identity()))]
    pub async fn join(
        &self,
        caller: &Caller,
        session: &SessionRef,
    ) -> Result<JoinOutcome, RuntimeError> {
        let found = self.resolve(session).await?;
        ensure_open(&found)?;
        let _membership = self.membership_guard(found.id).await?;

        let identity = caller.identity().to_string();
        let display_name = caller.display_name.clone();
        let reset_media = self.settings.rejoin_media.resets();
        let now = Utc::now();
        let updated = self
            .commit(
                found.id,
                Box::new(move |s: &mut Session| admit(s, &identity, display_name, now, reset_media)),
            )
            .await?;
        let session = &updated.session;

        let participant = session.participant(caller.identity()).ok_or_else(|| {
            RuntimeError::Internal("participant missing after join".to_string())
        })?;
        let member = RoomMember::new(
            caller.connection.clone(),
            participant.display_name.clone(),
            participant.role,
            participant.status,
        );
        let room = self
            .rooms
            .register(session.room_code.as_str(), session.id, member)
            .await?;
        let joined = JoinedRoom {
            session_id: session.id,
            room_code: session.room_code.clone(),
        };
        let view = ParticipantView::from(participant);

        let admission = match participant.status {
            MembershipStatus::Active => {
                let active_count = session.active_count();
                if updated.changed() {
                    self.broadcast(
                        &room,
                        ServerEvent::ParticipantJoined {
                            session_id: session.id,
                            participant: view.clone(),
                            active_count,
                        },
                        None,
                    )
                    .await;
                }
                Admission::Active {
                    participant: view,
                    participants: session
                        .participants
                        .iter()
                        .filter(|p| p.is_active())
                        .map(ParticipantView::from)
                        .collect(),
                    active_count,
                }
            }
            MembershipStatus::Pending => {
                if updated.changed() {
                    self.dispatcher.notify(
                        session.organizer_id.clone(),
                        ServerEvent::ParticipantWaiting {
                            session_id: session.id,
                            participant: view,
                            pending_count: session.pending_count(),
                        },
                    );
                }
                Admission::Pending
            }
            MembershipStatus::Rejected | MembershipStatus::Left => {
                return Err(RuntimeError::Internal(
                    "participant not admitted after join".to_string(),
                ));
            }
        };

        info!(
            target: "rt.lifecycle",
            session_id = %session.id,
            identity = %caller.identity(),
            connection_id = %caller.connection_id(),
            pending = matches!(admission, Admission::Pending),
            repeated = !updated.changed(),
            "Participant joined"
        );

        Ok(JoinOutcome {
            room: joined,
            admission,
        })
    }

    /// Admit a pending participant.
    #[instrument(skip_all, name = "rt.lifecycle.approve", fields(target_identity = %target))]
    pub async fn approve(
        &self,
        caller: &Caller,
        joined: &JoinedRoom,
        target: &str,
    ) -> Result<(), RuntimeError> {
        let (room, _) = self.member(caller, joined).await?;
        let _membership = self.membership_guard(joined.session_id).await?;

        let organizer = caller.identity().to_string();
        let target_id = target.to_string();
        let updated = self
            .commit(
                joined.session_id,
                Box::new(move |s: &mut Session| {
                    if !s.is_organizer(&organizer) {
                        return Err(RuntimeError::Forbidden(
                            "Only the organizer can approve participants".to_string(),
                        ));
                    }
                    ensure_open(s)?;
                    let full = s.settings.max_participants.is_some_and(|max| {
                        s.active_count() >= usize::try_from(max).unwrap_or(usize::MAX)
                    });
                    let p = s
                        .participant_mut(&target_id)
                        .ok_or_else(|| RuntimeError::NotFound("Participant".to_string()))?;
                    if !p.is_pending() {
                        return Err(RuntimeError::Conflict(
                            "Participant is not awaiting approval".to_string(),
                        ));
                    }
                    if full {
                        return Err(RuntimeError::Conflict("Session is full".to_string()));
                    }
                    p.status = MembershipStatus::Active;
                    Ok(Applied::Changed)
                }),
            )
            .await?;
        let session = &updated.session;

        room.set_status(target, MembershipStatus::Active).await?;
        self.dispatcher.notify(
            target,
            ServerEvent::Approved {
                session_id: session.id,
            },
        );
        if let Some(p) = session.participant(target) {
            self.broadcast(
                &room,
                ServerEvent::ParticipantJoined {
                    session_id: session.id,
                    participant: ParticipantView::from(p),
                    active_count: session.active_count(),
                },
                None,
            )
            .await;
        }

        info!(target: "rt.lifecycle", session_id = %session.id, target_identity = target, "Participant approved");
        Ok(())
    }

    /// Turn a pending participant away. The entry stays `rejected` and
    /// later joins from the same identity fail.
    #[instrument(skip_all, name = "rt.lifecycle.reject", fields(target_identity = %target))]
    pub async fn reject(
        &self,
        caller: &Caller,
        joined: &JoinedRoom,
        target: &str,
    ) -> Result<(), RuntimeError> {
        self.member(caller, joined).await?;

        let organizer = caller.identity().to_string();
        let target_id = target.to_string();
        self.commit(
            joined.session_id,
            Box::new(move |s: &mut Session| {
                if !s.is_organizer(&organizer) {
                    return Err(RuntimeError::Forbidden(
                        "Only the organizer can reject participants".to_string(),
                    ));
                }
                ensure_open(s)?;
                let p = s
                    .participant_mut(&target_id)
                    .ok_or_else(|| RuntimeError::NotFound("Participant".to_string()))?;
                if !p.is_pending() {
                    return Err(RuntimeError::Conflict(
                        "Participant is not awaiting approval".to_string(),
                    ));
                }
                p.status = MembershipStatus::Rejected;
                Ok(Applied::Changed)
            }),
        )
        .await?;

        self.dispatcher.notify(
            target,
            ServerEvent::Rejected {
                session_id: joined.session_id,
            },
        );
        let evicted = self
            .rooms
            .evict_identity(joined.room_code.as_str(), target)
            .await?;

        info!(
            target: "rt.lifecycle",
            session_id = %joined.session_id,
            target_identity = target,
            connections = evicted.members.len(),
            "Participant rejected"
        );
        Ok(())
    }

    /// Leave a session. Repeating a leave is a no-op.
    ///
    /// Returns the session id so the caller can forget its joined entry.
    #[instrument(skip_all, name = "rt.lifecycle.leave", fields(identity = %caller.identity()))]
    pub async fn leave(
        &self,
        caller: &Caller,
        session: &SessionRef,
    ) -> Result<SessionId, RuntimeError> {
        let found = self.resolve(session).await?;
        let _membership = self.membership_guard(found.id).await?;

        let identity = caller.identity().to_string();
        let now = Utc::now();
        let updated = self
            .commit(found.id, Box::new(move |s: &mut Session| Ok(depart(s, &identity, now))))
            .await?;
        let session = &updated.session;

        let evicted = self
            .rooms
            .evict_identity(session.room_code.as_str(), caller.identity())
            .await?;

        if updated.changed() {
            if evicted.was_active() && evicted.remaining > 0 {
                if let Some(room) = self.rooms.lookup(session.room_code.as_str()).await? {
                    self.broadcast(
                        &room,
                        ServerEvent::ParticipantLeft {
                            session_id: session.id,
                            identity: caller.identity().to_string(),
                            active_count: session.active_count(),
                        },
                        None,
                    )
                    .await;
                }
            }
            self.dispatcher.check_out(session.id, caller.identity(), now);
            info!(
                target: "rt.lifecycle",
                session_id = %session.id,
                identity = %caller.identity(),
                "Participant left"
            );
        } else {
            debug!(target: "rt.lifecycle", session_id = %session.id, "Repeated leave ignored");
        }

        Ok(session.id)
    }

    /// Connection-level cleanup. Marks the identity left in each joined
    /// session unless another of its connections is still in the room.
    /// Failures are logged; nothing is reported to the closed connection.
    pub async fn disconnect(&self, connection: &ConnectionActorHandle, joined: &[JoinedRoom]) {
        for room in joined {
            if let Err(e) = self.disconnect_one(connection, room).await {
                warn!(
                    target: "rt.lifecycle",
                    session_id = %room.session_id,
                    connection_id = %connection.connection_id(),
                    error = %e,
                    "Disconnect cleanup failed"
                );
            }
        }
    }

    async fn disconnect_one(
        &self,
        connection: &ConnectionActorHandle,
        joined: &JoinedRoom,
    ) -> Result<(), RuntimeError> {
        let _membership = self.membership_guard(joined.session_id).await?;
        let Some(gone) = self
            .rooms
            .unregister(joined.room_code.as_str(), connection.connection_id())
            .await?
        else {
            return Ok(());
        };
        if gone.identity_still_connected {
            debug!(
                target: "rt.lifecycle",
                session_id = %joined.session_id,
                identity = %connection.identity(),
                "Identity still connected elsewhere"
            );
            return Ok(());
        }

        let identity = connection.identity().to_string();
        let now = Utc::now();
        let updated = self
            .commit(
                joined.session_id,
                Box::new(move |s: &mut Session| {
                    if s.status.is_terminal() {
                        return Ok(Applied::Unchanged);
                    }
                    Ok(depart(s, &identity, now))
                }),
            )
            .await?;
        if !updated.changed() {
            return Ok(());
        }
        let session = &updated.session;

        if gone.member.is_active() && gone.remaining > 0 {
            if let Some(room) = self.rooms.lookup(joined.room_code.as_str()).await? {
                self.broadcast(
                    &room,
                    ServerEvent::ParticipantLeft {
                        session_id: session.id,
                        identity: connection.identity().to_string(),
                        active_count: session.active_count(),
                    },
                    None,
                )
                .await;
            }
        }
        self.dispatcher
            .check_out(session.id, connection.identity(), now);

        info!(
            target: "rt.lifecycle",
            session_id = %session.id,
            identity = %connection.identity(),
            "Participant disconnected"
        );
        Ok(())
    }

    /// `scheduled` to `live`.
    #[instrument(skip_all, name = "rt.lifecycle.start")]
    pub async fn start(&self, caller: &Caller, joined: &JoinedRoom) -> Result<(), RuntimeError> {
        let (room, member) = self.active_member(caller, joined).await?;
        authorize(&member, Action::StartSession)?;

        let now = Utc::now();
        self.commit(
            joined.session_id,
            Box::new(move |s: &mut Session| {
                if s.status != SessionStatus::Scheduled {
                    return Err(RuntimeError::Conflict(format!(
                        "Session is already {}",
                        s.status.as_str()
                    )));
                }
                s.status = SessionStatus::Live;
                s.started_at = Some(now);
                Ok(Applied::Changed)
            }),
        )
        .await?;

        self.broadcast(
            &room,
            ServerEvent::SessionStarted {
                session_id: joined.session_id,
            },
            None,
        )
        .await;
        info!(target: "rt.lifecycle", session_id = %joined.session_id, "Session started");
        Ok(())
    }

    /// `live` to `ended`. Closes every open membership and the room.
    #[instrument(skip_all, name = "rt.lifecycle.end")]
    pub async fn end(&self, caller: &Caller, joined: &JoinedRoom) -> Result<(), RuntimeError> {
        let (room, member) = self.active_member(caller, joined).await?;
        authorize(&member, Action::EndSession)?;

        let now = Utc::now();
        let updated = self
            .commit(
                joined.session_id,
                Box::new(move |s: &mut Session| {
                    match s.status {
                        SessionStatus::Live => {}
                        SessionStatus::Scheduled => {
                            return Err(RuntimeError::Conflict(
                                "Session has not started".to_string(),
                            ));
                        }
                        SessionStatus::Ended | SessionStatus::Cancelled => {
                            return Err(RuntimeError::Conflict(
                                "Session has already ended".to_string(),
                            ));
                        }
                    }
                    s.status = SessionStatus::Ended;
                    s.ended_at = Some(now);
                    s.close_all(now);
                    Ok(Applied::Changed)
                }),
            )
            .await?;

        self.broadcast(
            &room,
            ServerEvent::SessionEnded {
                session_id: joined.session_id,
                ended_at: now,
            },
            None,
        )
        .await;
        self.close_room(&updated.session, joined, now).await;
        info!(target: "rt.lifecycle", session_id = %joined.session_id, "Session ended");
        Ok(())
    }

    /// Any non-terminal status to `cancelled`.
    #[instrument(skip_all, name = "rt.lifecycle.cancel")]
    pub async fn cancel(&self, caller: &Caller, joined: &JoinedRoom) -> Result<(), RuntimeError> {
        let (room, member) = self.active_member(caller, joined).await?;
        authorize(&member, Action::EndSession)?;

        let now = Utc::now();
        let updated = self
            .commit(
                joined.session_id,
                Box::new(move |s: &mut Session| {
                    ensure_open(s)?;
                    s.status = SessionStatus::Cancelled;
                    s.ended_at = Some(now);
                    s.close_all(now);
                    Ok(Applied::Changed)
                }),
            )
            .await?;

        self.broadcast(
            &room,
            ServerEvent::SessionCancelled {
                session_id: joined.session_id,
            },
            None,
        )
        .await;
        self.close_room(&updated.session, joined, now).await;
        info!(target: "rt.lifecycle", session_id = %joined.session_id, "Session cancelled");
        Ok(())
    }

    /// Check out everyone closed by a terminal transition and drop the room.
    async fn close_room(&self, session: &Session, joined: &JoinedRoom, at: DateTime<Utc>) {
        for identity in closed_at(session, at) {
            self.dispatcher.check_out(session.id, identity, at);
        }
        match self.rooms.close_room(joined.room_code.as_str()).await {
            Ok(dropped) => debug!(
                target: "rt.lifecycle",
                room_code = %joined.room_code,
                dropped,
                "Room closed"
            ),
            Err(e) => warn!(
                target: "rt.lifecycle",
                room_code = %joined.room_code,
                error = %e,
                "Room close failed"
            ),
        }
    }

    /// Apply a partial settings update.
    #[instrument(skip_all, name = "rt.lifecycle.update_settings")]
    pub async fn update_settings(
        &self,
        caller: &Caller,
        joined: &JoinedRoom,
        patch: SettingsPatch,
    ) -> Result<(), RuntimeError> {
        let (room, member) = self.active_member(caller, joined).await?;
        authorize(&member, Action::ManageSettings)?;
        if patch.max_participants == Some(Some(0)) {
            return Err(RuntimeError::Validation(
                "max_participants must be positive".to_string(),
            ));
        }

        let updated = self
            .commit(
                joined.session_id,
                Box::new(move |s: &mut Session| {
                    ensure_open(s)?;
                    Ok(if s.settings.apply(&patch) {
                        Applied::Changed
                    } else {
                        Applied::Unchanged
                    })
                }),
            )
            .await?;

        if updated.changed() {
            self.broadcast(
                &room,
                ServerEvent::SettingsUpdated {
                    session_id: joined.session_id,
                    settings: updated.session.settings.clone(),
                },
                None,
            )
            .await;
        }
        Ok(())
    }

    /// Remove a participant. Their connections are dropped from the room and
    /// they may join again later.
    #[instrument(skip_all, name = "rt.lifecycle.remove", fields(target_identity = %target))]
    pub async fn remove_participant(
        &self,
        caller: &Caller,
        joined: &JoinedRoom,
        target: &str,
    ) -> Result<(), RuntimeError> {
        let (room, member) = self.active_member(caller, joined).await?;
        authorize(&member, Action::RemoveParticipant)?;
        let _membership = self.membership_guard(joined.session_id).await?;

        let target_id = target.to_string();
        let now = Utc::now();
        let updated = self
            .commit(
                joined.session_id,
                Box::new(move |s: &mut Session| {
                    if s.is_organizer(&target_id) {
                        return Err(RuntimeError::Forbidden(
                            "The organizer cannot be removed".to_string(),
                        ));
                    }
                    if s.participant(&target_id).is_none() {
                        return Err(RuntimeError::NotFound("Participant".to_string()));
                    }
                    Ok(depart(s, &target_id, now))
                }),
            )
            .await?;

        self.dispatcher.notify(
            target,
            ServerEvent::Removed {
                session_id: joined.session_id,
            },
        );
        let evicted = self
            .rooms
            .evict_identity(joined.room_code.as_str(), target)
            .await?;

        if updated.changed() {
            if evicted.was_active() && evicted.remaining > 0 {
                self.broadcast(
                    &room,
                    ServerEvent::ParticipantLeft {
                        session_id: joined.session_id,
                        identity: target.to_string(),
                        active_count: updated.session.active_count(),
                    },
                    None,
                )
                .await;
            }
            self.dispatcher.check_out(joined.session_id, target, now);
        }
        info!(target: "rt.lifecycle", session_id = %joined.session_id, target_identity = target, "Participant removed");
        Ok(())
    }

    /// Current counters for the organizer.
    pub async fn stats(
        &self,
        caller: &Caller,
        joined: &JoinedRoom,
    ) -> Result<SessionStats, RuntimeError> {
        let (_, member) = self.active_member(caller, joined).await?;
        authorize(&member, Action::ViewAnalytics)?;
        let session = self.resolve(&SessionRef::Id(joined.session_id)).await?;
        Ok(session.stats())
    }
}
