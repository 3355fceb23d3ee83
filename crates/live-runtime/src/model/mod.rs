//! Persisted data model.

pub mod interaction;
pub mod session;

pub use interaction::{Answer, ChatMessage, Poll, PollResponse, Question};
pub use session::{
    AttendanceCycle, MediaState, MembershipStatus, Participant, ParticipantView, RecordingState,
    RecordingStatus, Role, Session, SessionSettings, SessionStats, SessionStatus, SettingsPatch,
};
