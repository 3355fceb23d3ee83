//! Role/action permission table.
//!
//! [`is_allowed`] is the only place a permission decision is made. Every
//! mutating handler calls [`require`] with the caller's room-cached role
//! before touching the store.

use crate::errors::RuntimeError;
use crate::model::Role;
use serde::{Deserialize, Serialize};

/// Actions gated by the permission table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    StartSession,
    EndSession,
    RecordingControl,
    MuteParticipant,
    RemoveParticipant,
    ManagePolls,
    ManageQa,
    ManageSettings,
    ViewAnalytics,
    BroadcastMedia,
    AnswerQuestion,
    Chat,
    RaiseHand,
    ShareScreen,
    ModerateChat,
    ModeratePolls,
    ModerateQa,
    Vote,
    AskQuestion,
    React,
}

impl Action {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Action::StartSession => "start_session",
            Action::EndSession => "end_session",
            Action::RecordingControl => "recording_control",
            Action::MuteParticipant => "mute_participant",
            Action::RemoveParticipant => "remove_participant",
            Action::ManagePolls => "manage_polls",
            Action::ManageQa => "manage_qa",
            Action::ManageSettings => "manage_settings",
            Action::ViewAnalytics => "view_analytics",
            Action::BroadcastMedia => "broadcast_media",
            Action::AnswerQuestion => "answer_question",
            Action::Chat => "chat",
            Action::RaiseHand => "raise_hand",
            Action::ShareScreen => "share_screen",
            Action::ModerateChat => "moderate_chat",
            Action::ModeratePolls => "moderate_polls",
            Action::ModerateQa => "moderate_qa",
            Action::Vote => "vote",
            Action::AskQuestion => "ask_question",
            Action::React => "react",
        }
    }
}

const ORGANIZER_ACTIONS: &[Action] = &[
    Action::StartSession,
    Action::EndSession,
    Action::RecordingControl,
    Action::MuteParticipant,
    Action::RemoveParticipant,
    Action::ManagePolls,
    Action::ManageQa,
    Action::ManageSettings,
    Action::ViewAnalytics,
];

const SPEAKER_ACTIONS: &[Action] = &[
    Action::BroadcastMedia,
    Action::AnswerQuestion,
    Action::Vote,
    Action::Chat,
    Action::RaiseHand,
    Action::ShareScreen,
    Action::React,
];

const MODERATOR_ACTIONS: &[Action] = &[
    Action::ModerateChat,
    Action::ModeratePolls,
    Action::ModerateQa,
    Action::AnswerQuestion,
    Action::MuteParticipant,
    Action::RemoveParticipant,
    Action::Chat,
    Action::React,
];

const ATTENDEE_ACTIONS: &[Action] = &[
    Action::Chat,
    Action::Vote,
    Action::AskQuestion,
    Action::RaiseHand,
    Action::React,
];

/// Static action list for a role.
#[must_use]
pub const fn actions_for(role: Role) -> &'static [Action] {
    match role {
        Role::Organizer => ORGANIZER_ACTIONS,
        Role::Speaker => SPEAKER_ACTIONS,
        Role::Moderator => MODERATOR_ACTIONS,
        Role::Attendee => ATTENDEE_ACTIONS,
    }
}

/// Pure permission decision. The session organizer always passes.
#[must_use]
pub fn is_allowed(role: Role, action: Action, is_session_organizer: bool) -> bool {
    is_session_organizer || actions_for(role).contains(&action)
}

/// [`is_allowed`] as a `Result` for handler use.
///
/// # Errors
///
/// `Forbidden` naming the missing action.
pub fn require(role: Role, action: Action, is_session_organizer: bool) -> Result<(), RuntimeError> {
    if is_allowed(role, action, is_session_organizer) {
        Ok(())
    } else {
        tracing::debug!(
            target: "rt.permissions",
            role = role.as_str(),
            action = action.as_str(),
            "Permission denied"
        );
        Err(RuntimeError::Forbidden(format!(
            "Missing permission: {}",
            action.as_str()
        )))
    }
}
