//! Duplex channel wire format.
//!
//! Text frames carry one JSON object. Inbound frames are a
//! [`ClientEnvelope`]: an optional `request_id` plus a `type`-tagged
//! [`ClientMessage`]. Outbound frames are `type`-tagged [`ServerEvent`]s;
//! direct replies echo the `request_id`.

use crate::model::{
    Answer, ChatMessage, MediaState, ParticipantView, Poll, Question, SessionSettings,
    SessionStats, SettingsPatch,
};
use chrono::{DateTime, Utc};
use common::types::{ConnectionId, SessionId};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Session reference as sent by clients: internal id or room code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SessionRef {
    Id(SessionId),
    Code(String),
}

impl From<String> for SessionRef {
    fn from(value: String) -> Self {
        match value.parse::<SessionId>() {
            Ok(id) => SessionRef::Id(id),
            Err(_) => SessionRef::Code(value),
        }
    }
}

impl From<&str> for SessionRef {
    fn from(value: &str) -> Self {
        SessionRef::from(value.to_string())
    }
}

impl From<SessionId> for SessionRef {
    fn from(value: SessionId) -> Self {
        SessionRef::Id(value)
    }
}

impl From<SessionRef> for String {
    fn from(value: SessionRef) -> Self {
        value.to_string()
    }
}

impl fmt::Display for SessionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionRef::Id(id) => id.fmt(f),
            SessionRef::Code(code) => f.write_str(code),
        }
    }
}

/// Poll vote payload: one index or a set of indices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PollChoice {
    Single(usize),
    Multiple(Vec<usize>),
}

impl PollChoice {
    #[must_use]
    pub fn into_indices(self) -> Vec<usize> {
        match self {
            PollChoice::Single(i) => vec![i],
            PollChoice::Multiple(v) => v,
        }
    }
}

/// Own media flag changes. `None` leaves a flag untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaChange {
    pub audio_muted: Option<bool>,
    pub video_enabled: Option<bool>,
    pub screen_sharing: Option<bool>,
    pub hand_raised: Option<bool>,
}

/// Relay kinds forwarded verbatim by the signaling relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    WebrtcOffer,
    WebrtcAnswer,
    IceCandidate,
    FileTransfer,
}

impl SignalKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            SignalKind::WebrtcOffer => "webrtc-offer",
            SignalKind::WebrtcAnswer => "webrtc-answer",
            SignalKind::IceCandidate => "ice-candidate",
            SignalKind::FileTransfer => "file-transfer",
        }
    }
}

/// Inbound frame.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientEnvelope {
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub message: ClientMessage,
}

/// Inbound request kinds.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    JoinSession {
        session: SessionRef,
    },
    LeaveSession {
        session: SessionRef,
    },
    ApproveParticipant {
        session: SessionRef,
        identity: String,
    },
    RejectParticipant {
        session: SessionRef,
        identity: String,
    },
    StartSession {
        session: SessionRef,
    },
    EndSession {
        session: SessionRef,
    },
    CancelSession {
        session: SessionRef,
    },
    UpdateSettings {
        session: SessionRef,
        settings: SettingsPatch,
    },
    GetStats {
        session: SessionRef,
    },
    SendMessage {
        session: SessionRef,
        content: String,
    },
    DeleteMessage {
        session: SessionRef,
        message_id: Uuid,
    },
    CreatePoll {
        session: SessionRef,
        question: String,
        options: Vec<String>,
        #[serde(default)]
        allow_multiple: bool,
    },
    VotePoll {
        session: SessionRef,
        poll_id: Uuid,
        choice: PollChoice,
    },
    ClosePoll {
        session: SessionRef,
        poll_id: Uuid,
    },
    AskQuestion {
        session: SessionRef,
        content: String,
    },
    AnswerQuestion {
        session: SessionRef,
        question_id: Uuid,
        answer: String,
    },
    UpvoteQuestion {
        session: SessionRef,
        question_id: Uuid,
    },
    SendReaction {
        session: SessionRef,
        emoji: String,
    },
    UpdateMedia {
        session: SessionRef,
        media: MediaChange,
    },
    MuteParticipant {
        session: SessionRef,
        identity: String,
        muted: bool,
    },
    RemoveParticipant {
        session: SessionRef,
        identity: String,
    },
    WebrtcOffer {
        session: SessionRef,
        #[serde(default)]
        target: Option<ConnectionId>,
        payload: serde_json::Value,
    },
    WebrtcAnswer {
        session: SessionRef,
        #[serde(default)]
        target: Option<ConnectionId>,
        payload: serde_json::Value,
    },
    IceCandidate {
        session: SessionRef,
        #[serde(default)]
        target: Option<ConnectionId>,
        payload: serde_json::Value,
    },
    FileTransfer {
        session: SessionRef,
        #[serde(default)]
        target: Option<ConnectionId>,
        payload: serde_json::Value,
    },
}

impl ClientMessage {
    /// Wire name, for logging.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            ClientMessage::JoinSession { .. } => "join-session",
            ClientMessage::LeaveSession { .. } => "leave-session",
            ClientMessage::ApproveParticipant { .. } => "approve-participant",
            ClientMessage::RejectParticipant { .. } => "reject-participant",
            ClientMessage::StartSession { .. } => "start-session",
            ClientMessage::EndSession { .. } => "end-session",
            ClientMessage::CancelSession { .. } => "cancel-session",
            ClientMessage::UpdateSettings { .. } => "update-settings",
            ClientMessage::GetStats { .. } => "get-stats",
            ClientMessage::SendMessage { .. } => "send-message",
            ClientMessage::DeleteMessage { .. } => "delete-message",
            ClientMessage::CreatePoll { .. } => "create-poll",
            ClientMessage::VotePoll { .. } => "vote-poll",
            ClientMessage::ClosePoll { .. } => "close-poll",
            ClientMessage::AskQuestion { .. } => "ask-question",
            ClientMessage::AnswerQuestion { .. } => "answer-question",
            ClientMessage::UpvoteQuestion { .. } => "upvote-question",
            ClientMessage::SendReaction { .. } => "send-reaction",
            ClientMessage::UpdateMedia { .. } => "update-media",
            ClientMessage::MuteParticipant { .. } => "mute-participant",
            ClientMessage::RemoveParticipant { .. } => "remove-participant",
            ClientMessage::WebrtcOffer { .. } => "webrtc-offer",
            ClientMessage::WebrtcAnswer { .. } => "webrtc-answer",
            ClientMessage::IceCandidate { .. } => "ice-candidate",
            ClientMessage::FileTransfer { .. } => "file-transfer",
        }
    }
}

/// Poll as shown to participants: respondents are reduced to a tally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollView {
    pub id: Uuid,
    pub question: String,
    pub options: Vec<String>,
    pub allow_multiple: bool,
    pub closed: bool,
    pub tally: Vec<u32>,
    pub respondent_count: usize,
}

impl From<&Poll> for PollView {
    fn from(poll: &Poll) -> Self {
        Self {
            id: poll.id,
            question: poll.question.clone(),
            options: poll.options.clone(),
            allow_multiple: poll.allow_multiple,
            closed: poll.is_closed(),
            tally: poll.tally(),
            respondent_count: poll.respondents.len(),
        }
    }
}

/// A relayed signaling message, tagged with its sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub session_id: SessionId,
    pub from_connection: ConnectionId,
    pub from_identity: String,
    pub payload: serde_json::Value,
}

/// Outbound events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerEvent {
    // ---- direct replies ----
    Connected {
        connection_id: ConnectionId,
        identity: String,
    },
    Joined {
        request_id: Option<String>,
        session_id: SessionId,
        room_code: String,
        participant: ParticipantView,
        participants: Vec<ParticipantView>,
        active_count: usize,
    },
    WaitingForApproval {
        request_id: Option<String>,
        session_id: SessionId,
    },
    Ok {
        request_id: Option<String>,
    },
    Stats {
        request_id: Option<String>,
        stats: SessionStats,
    },
    Error {
        request_id: Option<String>,
        code: String,
        message: String,
    },

    // ---- room broadcasts ----
    ParticipantJoined {
        session_id: SessionId,
        participant: ParticipantView,
        active_count: usize,
    },
    ParticipantLeft {
        session_id: SessionId,
        identity: String,
        active_count: usize,
    },
    SessionStarted {
        session_id: SessionId,
    },
    SessionEnded {
        session_id: SessionId,
        ended_at: DateTime<Utc>,
    },
    SessionCancelled {
        session_id: SessionId,
    },
    SettingsUpdated {
        session_id: SessionId,
        settings: SessionSettings,
    },
    NewMessage {
        session_id: SessionId,
        message: ChatMessage,
    },
    MessageDeleted {
        session_id: SessionId,
        message_id: Uuid,
    },
    NewPoll {
        session_id: SessionId,
        poll: PollView,
    },
    PollUpdated {
        session_id: SessionId,
        poll_id: Uuid,
        tally: Vec<u32>,
        respondent_count: usize,
    },
    PollClosed {
        session_id: SessionId,
        poll_id: Uuid,
        tally: Vec<u32>,
    },
    NewQuestion {
        session_id: SessionId,
        question: Question,
    },
    QuestionAnswered {
        session_id: SessionId,
        question_id: Uuid,
        answer: Answer,
    },
    QuestionUpvoted {
        session_id: SessionId,
        question_id: Uuid,
        upvotes: usize,
    },
    ParticipantReaction {
        session_id: SessionId,
        identity: String,
        emoji: String,
    },
    ParticipantMediaChanged {
        session_id: SessionId,
        identity: String,
        media: MediaState,
    },
    WebrtcOffer(SignalEnvelope),
    WebrtcAnswer(SignalEnvelope),
    IceCandidate(SignalEnvelope),
    FileTransfer(SignalEnvelope),

    // ---- identity-targeted ----
    ParticipantWaiting {
        session_id: SessionId,
        participant: ParticipantView,
        pending_count: usize,
    },
    Approved {
        session_id: SessionId,
    },
    Rejected {
        session_id: SessionId,
    },
    Removed {
        session_id: SessionId,
    },
    StatsUpdate {
        stats: SessionStats,
    },
}

impl ServerEvent {
    /// Wraps a relay payload in the event variant for `kind`.
    #[must_use]
    pub fn signal(kind: SignalKind, envelope: SignalEnvelope) -> Self {
        match kind {
            SignalKind::WebrtcOffer => ServerEvent::WebrtcOffer(envelope),
            SignalKind::WebrtcAnswer => ServerEvent::WebrtcAnswer(envelope),
            SignalKind::IceCandidate => ServerEvent::IceCandidate(envelope),
            SignalKind::FileTransfer => ServerEvent::FileTransfer(envelope),
        }
    }

    /// Error reply for a failed request.
    #[must_use]
    pub fn error(request_id: Option<String>, err: &crate::errors::RuntimeError) -> Self {
        ServerEvent::Error {
            request_id,
            code: err.error_code().to_string(),
            message: err.client_message(),
        }
    }
}
