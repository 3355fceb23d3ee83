//! Session and participant records.
//!
//! A [`Session`] is one persisted document: settings, the embedded participant
//! list, and the chat/poll/Q&A logs. Every mutation goes through
//! [`crate::store::SessionStore::update`], so methods here are plain
//! synchronous edits on an owned document.

use super::interaction::{ChatMessage, Poll, Question};
use chrono::{DateTime, Utc};
use common::types::SessionId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Scheduled,
    Live,
    Ended,
    Cancelled,
}

impl SessionStatus {
    /// `ended` and `cancelled` accept no further transitions or joins.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Ended | SessionStatus::Cancelled)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Scheduled => "scheduled",
            SessionStatus::Live => "live",
            SessionStatus::Ended => "ended",
            SessionStatus::Cancelled => "cancelled",
        }
    }
}

/// Per-session feature toggles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub chat_enabled: bool,
    pub polls_enabled: bool,
    pub qa_enabled: bool,
    pub recording_allowed: bool,
    pub require_approval: bool,
    pub max_participants: Option<u32>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            chat_enabled: true,
            polls_enabled: true,
            qa_enabled: true,
            recording_allowed: false,
            require_approval: false,
            max_participants: None,
        }
    }
}

/// Partial settings update sent by the organizer. `None` leaves a field as is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsPatch {
    pub chat_enabled: Option<bool>,
    pub polls_enabled: Option<bool>,
    pub qa_enabled: Option<bool>,
    pub recording_allowed: Option<bool>,
    pub require_approval: Option<bool>,
    pub max_participants: Option<Option<u32>>,
}

impl SessionSettings {
    /// Applies `patch`, returning true if anything changed.
    pub fn apply(&mut self, patch: &SettingsPatch) -> bool {
        let before = self.clone();
        if let Some(v) = patch.chat_enabled {
            self.chat_enabled = v;
        }
        if let Some(v) = patch.polls_enabled {
            self.polls_enabled = v;
        }
        if let Some(v) = patch.qa_enabled {
            self.qa_enabled = v;
        }
        if let Some(v) = patch.recording_allowed {
            self.recording_allowed = v;
        }
        if let Some(v) = patch.require_approval {
            self.require_approval = v;
        }
        if let Some(v) = patch.max_participants {
            self.max_participants = v;
        }
        *self != before
    }
}

/// Participant role, fixed at first join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Organizer,
    Speaker,
    Moderator,
    Attendee,
}

impl Role {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Role::Organizer => "organizer",
            Role::Speaker => "speaker",
            Role::Moderator => "moderator",
            Role::Attendee => "attendee",
        }
    }
}

/// Membership status of a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipStatus {
    /// In the lobby, waiting for the organizer.
    Pending,
    /// Admitted (directly or by approval).
    Active,
    Rejected,
    Left,
}

/// Media and presence flags. Media itself never passes through the runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaState {
    pub audio_muted: bool,
    pub video_enabled: bool,
    pub screen_sharing: bool,
    pub hand_raised: bool,
}

/// One closed join/leave cycle, archived when the identity rejoins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceCycle {
    pub joined_at: DateTime<Utc>,
    pub left_at: DateTime<Utc>,
}

/// A membership record embedded in its session, keyed by identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    /// Stable embedded id, used by `find_by_participant`.
    pub participant_id: Uuid,
    pub identity: String,
    pub display_name: Option<String>,
    pub role: Role,
    pub status: MembershipStatus,
    #[serde(default)]
    pub media: MediaState,
    pub joined_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
    pub last_active_at: DateTime<Utc>,
    #[serde(default)]
    pub questions_asked: u32,
    #[serde(default)]
    pub history: Vec<AttendanceCycle>,
}

impl Participant {
    #[must_use]
    pub fn new(
        identity: impl Into<String>,
        display_name: Option<String>,
        role: Role,
        status: MembershipStatus,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            participant_id: Uuid::new_v4(),
            identity: identity.into(),
            display_name,
            role,
            status,
            media: MediaState::default(),
            joined_at: now,
            left_at: None,
            last_active_at: now,
            questions_asked: 0,
            history: Vec::new(),
        }
    }

    /// Counted in the active tally.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == MembershipStatus::Active && self.left_at.is_none()
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.status == MembershipStatus::Pending && self.left_at.is_none()
    }

    /// Stamps `left_at` once. Returns false if it was already set.
    pub fn mark_left(&mut self, at: DateTime<Utc>) -> bool {
        if self.left_at.is_some() {
            return false;
        }
        self.left_at = Some(at);
        self.status = MembershipStatus::Left;
        self.media.screen_sharing = false;
        self.media.hand_raised = false;
        true
    }

    /// Starts a fresh membership cycle on the same entry.
    ///
    /// A closed cycle is archived first so its `left_at` is never rewritten.
    /// The role is kept.
    pub fn begin_cycle(&mut self, status: MembershipStatus, now: DateTime<Utc>, reset_media: bool) {
        if let Some(left_at) = self.left_at.take() {
            self.history.push(AttendanceCycle {
                joined_at: self.joined_at,
                left_at,
            });
            self.joined_at = now;
        }
        self.status = status;
        self.last_active_at = now;
        if reset_media {
            self.media = MediaState::default();
        }
    }
}

/// Recording status on the session record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingStatus {
    #[default]
    None,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingState {
    pub status: RecordingStatus,
    pub url: Option<String>,
}

/// A live session document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    /// Human-shareable code; also the broadcast room key.
    pub room_code: String,
    pub organizer_id: String,
    pub title: String,
    pub status: SessionStatus,
    #[serde(default)]
    pub settings: SessionSettings,
    /// Identities pre-assigned the speaker role.
    #[serde(default)]
    pub speakers: Vec<String>,
    /// Identities pre-assigned the moderator role.
    #[serde(default)]
    pub moderators: Vec<String>,
    #[serde(default)]
    pub participants: Vec<Participant>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub polls: Vec<Poll>,
    #[serde(default)]
    pub questions: Vec<Question>,
    #[serde(default)]
    pub recording: RecordingState,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    #[must_use]
    pub fn new(
        room_code: impl Into<String>,
        organizer_id: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        Self {
            id: SessionId::new(),
            room_code: room_code.into(),
            organizer_id: organizer_id.into(),
            title: title.into(),
            status: SessionStatus::Scheduled,
            settings: SessionSettings::default(),
            speakers: Vec::new(),
            moderators: Vec::new(),
            participants: Vec::new(),
            messages: Vec::new(),
            polls: Vec::new(),
            questions: Vec::new(),
            recording: RecordingState::default(),
            started_at: None,
            ended_at: None,
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn is_organizer(&self, identity: &str) -> bool {
        self.organizer_id == identity
    }

    /// Role an identity receives on its first join.
    #[must_use]
    pub fn role_for(&self, identity: &str) -> Role {
        if self.is_organizer(identity) {
            Role::Organizer
        } else if self.speakers.iter().any(|s| s == identity) {
            Role::Speaker
        } else if self.moderators.iter().any(|m| m == identity) {
            Role::Moderator
        } else {
            Role::Attendee
        }
    }

    #[must_use]
    pub fn participant(&self, identity: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.identity == identity)
    }

    pub fn participant_mut(&mut self, identity: &str) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| p.identity == identity)
    }

    /// Participants admitted and not yet left.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.participants.iter().filter(|p| p.is_active()).count()
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.participants.iter().filter(|p| p.is_pending()).count()
    }

    /// Stamps `left_at` on every entry still open and returns how many.
    /// Rejected entries keep their status so the rejection stays on record.
    pub fn close_all(&mut self, at: DateTime<Utc>) -> usize {
        let mut closed = 0;
        for p in self.participants.iter_mut().filter(|p| p.left_at.is_none()) {
            if p.status == MembershipStatus::Rejected {
                p.left_at = Some(at);
            } else {
                p.mark_left(at);
            }
            closed += 1;
        }
        closed
    }

    /// Aggregate counters, always derived from the document itself.
    #[must_use]
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            session_id: self.id,
            status: self.status,
            active_count: self.active_count(),
            pending_count: self.pending_count(),
            total_participants: self.participants.len(),
            hands_raised: self
                .participants
                .iter()
                .filter(|p| p.is_active() && p.media.hand_raised)
                .count(),
            message_count: self.messages.iter().filter(|m| !m.deleted).count(),
            open_polls: self.polls.iter().filter(|p| p.closed_at.is_none()).count(),
            unanswered_questions: self.questions.iter().filter(|q| q.answer.is_none()).count(),
        }
    }
}

/// Counters pushed to the organizer channel and returned by `get-stats`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub active_count: usize,
    pub pending_count: usize,
    pub total_participants: usize,
    pub hands_raised: usize,
    pub message_count: usize,
    pub open_polls: usize,
    pub unanswered_questions: usize,
}

/// Participant fields safe to send to other participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantView {
    pub identity: String,
    pub display_name: Option<String>,
    pub role: Role,
    pub status: MembershipStatus,
    pub media: MediaState,
}

impl From<&Participant> for ParticipantView {
    fn from(p: &Participant) -> Self {
        Self {
            identity: p.identity.clone(),
            display_name: p.display_name.clone(),
            role: p.role,
            status: p.status,
            media: p.media,
        }
    }
}
