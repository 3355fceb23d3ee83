//! Media flags and reactions.
//!
//! Media never passes through the runtime; these handlers only keep the
//! per-participant flags that clients render.

use super::{
    authorize, ensure_open, validate_text, Caller, JoinedRoom, SessionRuntime, MAX_REACTION_LENGTH,
};
use crate::actors::RoomMember;
use crate::errors::RuntimeError;
use crate::model::{MediaState, Session};
use crate::permissions::Action;
use crate::protocol::{MediaChange, ServerEvent};
use crate::store::Applied;

/// Turning a flag on needs the matching permission; turning it off never does.
fn authorize_change(member: &RoomMember, change: &MediaChange) -> Result<(), RuntimeError> {
    if change.audio_muted == Some(false) || change.video_enabled == Some(true) {
        authorize(member, Action::BroadcastMedia)?;
    }
    if change.screen_sharing == Some(true) {
        authorize(member, Action::ShareScreen)?;
    }
    if change.hand_raised == Some(true) {
        authorize(member, Action::RaiseHand)?;
    }
    Ok(())
}

fn apply_change(media: &mut MediaState, change: &MediaChange) -> bool {
    let before = *media;
    if let Some(v) = change.audio_muted {
        media.audio_muted = v;
    }
    if let Some(v) = change.video_enabled {
        media.video_enabled = v;
    }
    if let Some(v) = change.screen_sharing {
        media.screen_sharing = v;
    }
    if let Some(v) = change.hand_raised {
        media.hand_raised = v;
    }
    *media != before
}

impl SessionRuntime {
    /// Update the caller's own media flags.
    pub async fn update_media(
        &self,
        caller: &Caller,
        joined: &JoinedRoom,
        change: MediaChange,
    ) -> Result<MediaState, RuntimeError> {
        let (room, member) = self.active_member(caller, joined).await?;
        authorize_change(&member, &change)?;

        let identity = member.identity.clone();
        let updated = self
            .commit(
                joined.session_id,
                Box::new(move |s: &mut Session| {
                    ensure_open(s)?;
                    let p = s
                        .participant_mut(&identity)
                        .ok_or_else(|| RuntimeError::NotFound("Participant".to_string()))?;
                    Ok(if apply_change(&mut p.media, &change) {
                        Applied::Changed
                    } else {
                        Applied::Unchanged
                    })
                }),
            )
            .await?;

        let media = updated
            .session
            .participant(caller.identity())
            .map(|p| p.media)
            .unwrap_or_default();
        if updated.changed() {
            self.broadcast(
                &room,
                ServerEvent::ParticipantMediaChanged {
                    session_id: joined.session_id,
                    identity: caller.identity().to_string(),
                    media,
                },
                None,
            )
            .await;
        }
        self.touch(caller, joined);
        Ok(media)
    }

    /// Force another participant's audio flag.
    pub async fn mute_participant(
        &self,
        caller: &Caller,
        joined: &JoinedRoom,
        target: &str,
        muted: bool,
    ) -> Result<(), RuntimeError> {
        let (room, member) = self.active_member(caller, joined).await?;
        authorize(&member, Action::MuteParticipant)?;

        let target_id = target.to_string();
        let updated = self
            .commit(
                joined.session_id,
                Box::new(move |s: &mut Session| {
                    ensure_open(s)?;
                    let p = s
                        .participant_mut(&target_id)
                        .ok_or_else(|| RuntimeError::NotFound("Participant".to_string()))?;
                    if !p.is_active() {
                        return Err(RuntimeError::Conflict(
                            "Participant is not in the session".to_string(),
                        ));
                    }
                    if p.media.audio_muted == muted {
                        return Ok(Applied::Unchanged);
                    }
                    p.media.audio_muted = muted;
                    Ok(Applied::Changed)
                }),
            )
            .await?;

        if updated.changed() {
            if let Some(p) = updated.session.participant(target) {
                self.broadcast(
                    &room,
                    ServerEvent::ParticipantMediaChanged {
                        session_id: joined.session_id,
                        identity: target.to_string(),
                        media: p.media,
                    },
                    None,
                )
                .await;
            }
        }
        Ok(())
    }

    /// Broadcast an emoji reaction. Nothing is persisted.
    pub async fn send_reaction(
        &self,
        caller: &Caller,
        joined: &JoinedRoom,
        emoji: &str,
    ) -> Result<(), RuntimeError> {
        let (room, member) = self.active_member(caller, joined).await?;
        authorize(&member, Action::React)?;
        let emoji = validate_text("Reaction", emoji, MAX_REACTION_LENGTH)?;

        self.broadcast(
            &room,
            ServerEvent::ParticipantReaction {
                session_id: joined.session_id,
                identity: member.identity,
                emoji,
            },
            None,
        )
        .await;
        self.touch(caller, joined);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::super::testing::{harness, harness_with, open_settings, ORGANIZER};
    use super::super::RuntimeSettings;
    use super::*;

    #[tokio::test]
    async fn test_attendee_media_gates() {
        let h = harness(open_settings()).await;
        let alice = h.join("alice").await;

        let err = h
            .runtime
            .update_media(
                &alice.caller,
                &alice.joined,
                MediaChange {
                    video_enabled: Some(true),
                    ..MediaChange::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Forbidden(_)));

        let media = h
            .runtime
            .update_media(
                &alice.caller,
                &alice.joined,
                MediaChange {
                    hand_raised: Some(true),
                    audio_muted: Some(true),
                    ..MediaChange::default()
                },
            )
            .await
            .unwrap();
        assert!(media.hand_raised);
        assert!(media.audio_muted);
        assert_eq!(h.session().await.stats().hands_raised, 1);
    }

    #[tokio::test]
    async fn test_speaker_can_share_screen() {
        let h = harness_with(open_settings(), RuntimeSettings::default(), |s| {
            s.speakers.push("sam".to_string());
        })
        .await;
        let mut organizer = h.join(ORGANIZER).await;
        let sam = h.join("sam").await;
        organizer.drain().await;

        h.runtime
            .update_media(
                &sam.caller,
                &sam.joined,
                MediaChange {
                    screen_sharing: Some(true),
                    video_enabled: Some(true),
                    ..MediaChange::default()
                },
            )
            .await
            .unwrap();

        let seen = organizer.drain().await;
        assert!(seen.iter().any(|e| matches!(
            e,
            ServerEvent::ParticipantMediaChanged { identity, media, .. }
                if identity == "sam" && media.screen_sharing
        )));
    }

    #[tokio::test]
    async fn test_mute_participant() {
        let h = harness(open_settings()).await;
        let organizer = h.join(ORGANIZER).await;
        let alice = h.join("alice").await;

        h.runtime
            .mute_participant(&organizer.caller, &organizer.joined, "alice", true)
            .await
            .unwrap();
        assert!(h.session().await.participant("alice").unwrap().media.audio_muted);

        let err = h
            .runtime
            .mute_participant(&alice.caller, &alice.joined, ORGANIZER, true)
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_reaction_length() {
        let h = harness(open_settings()).await;
        let mut alice = h.join("alice").await;
        alice.drain().await;

        h.runtime
            .send_reaction(&alice.caller, &alice.joined, "👏")
            .await
            .unwrap();
        let err = h
            .runtime
            .send_reaction(&alice.caller, &alice.joined, &"x".repeat(17))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Validation(_)));

        let seen = alice.drain().await;
        assert!(seen.iter().any(|e| matches!(
            e,
            ServerEvent::ParticipantReaction { emoji, .. } if emoji == "👏"
        )));
    }
}
