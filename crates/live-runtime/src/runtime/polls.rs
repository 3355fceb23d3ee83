//! Polls.
//!
//! Tallies are never stored; they are recomputed from the respondent list
//! after every committed vote.

use super::{authorize, ensure_open, validate_text, Caller, JoinedRoom, SessionRuntime};
use crate::errors::RuntimeError;
use crate::model::{Poll, Session};
use crate::permissions::Action;
use crate::protocol::{PollChoice, PollView, ServerEvent};
use crate::store::Applied;

use chrono::Utc;
use std::collections::HashSet;
use tracing::debug;
use uuid::Uuid;

const MAX_POLL_OPTIONS: usize = 20;
const MAX_OPTION_LENGTH: usize = 200;

fn validate_options(options: &[String]) -> Result<Vec<String>, RuntimeError> {
    let cleaned: Vec<String> = options
        .iter()
        .map(|o| o.trim())
        .filter(|o| !o.is_empty())
        .map(str::to_string)
        .collect();
    if cleaned.len() < 2 {
        return Err(RuntimeError::Validation(
            "A poll needs at least two options".to_string(),
        ));
    }
    if cleaned.len() > MAX_POLL_OPTIONS {
        return Err(RuntimeError::Validation(format!(
            "A poll allows at most {MAX_POLL_OPTIONS} options"
        )));
    }
    if cleaned.iter().any(|o| o.chars().count() > MAX_OPTION_LENGTH) {
        return Err(RuntimeError::Validation(format!(
            "Poll options are limited to {MAX_OPTION_LENGTH} characters"
        )));
    }
    Ok(cleaned)
}

/// Checks an answer set against the poll shape.
fn validate_answers(poll: &Poll, answers: &[usize]) -> Result<(), RuntimeError> {
    if answers.is_empty() {
        return Err(RuntimeError::Validation("Choose at least one option".to_string()));
    }
    if !poll.allow_multiple && answers.len() > 1 {
        return Err(RuntimeError::Validation(
            "This poll accepts a single choice".to_string(),
        ));
    }
    if answers.iter().any(|&i| i >= poll.options.len()) {
        return Err(RuntimeError::Validation("Option index out of range".to_string()));
    }
    let unique: HashSet<_> = answers.iter().collect();
    if unique.len() != answers.len() {
        return Err(RuntimeError::Validation("Duplicate option index".to_string()));
    }
    Ok(())
}

impl SessionRuntime {
    pub async fn create_poll(
        &self,
        caller: &Caller,
        joined: &JoinedRoom,
        question: &str,
        options: &[String],
        allow_multiple: bool,
    ) -> Result<PollView, RuntimeError> {
        let (room, member) = self.active_member(caller, joined).await?;
        authorize(&member, Action::ManagePolls)?;
        let question = validate_text("Question", question, self.settings.chat_max_length)?;
        let options = validate_options(options)?;

        let poll = Poll {
            id: Uuid::new_v4(),
            question,
            options,
            allow_multiple,
            created_by: member.identity.clone(),
            created_at: Utc::now(),
            closed_at: None,
            respondents: Vec::new(),
        };
        let view = PollView::from(&poll);
        self.commit(
            joined.session_id,
            Box::new(move |s: &mut Session| {
                ensure_open(s)?;
                if !s.settings.polls_enabled {
                    return Err(RuntimeError::Forbidden("Polls are disabled".to_string()));
                }
                s.polls.push(poll);
                Ok(Applied::Changed)
            }),
        )
        .await?;

        self.broadcast(
            &room,
            ServerEvent::NewPoll {
                session_id: joined.session_id,
                poll: view.clone(),
            },
            None,
        )
        .await;
        self.touch(caller, joined);
        debug!(target: "rt.interaction", session_id = %joined.session_id, poll_id = %view.id, "Poll created");
        Ok(view)
    }

    /// Record or replace the caller's answer set.
    pub async fn vote_poll(
        &self,
        caller: &Caller,
        joined: &JoinedRoom,
        poll_id: Uuid,
        choice: PollChoice,
    ) -> Result<PollView, RuntimeError> {
        let (room, member) = self.active_member(caller, joined).await?;
        authorize(&member, Action::Vote)?;

        let answers = choice.into_indices();
        let identity = member.identity.clone();
        let now = Utc::now();
        let updated = self
            .commit(
                joined.session_id,
                Box::new(move |s: &mut Session| {
                    ensure_open(s)?;
                    if !s.settings.polls_enabled {
                        return Err(RuntimeError::Forbidden("Polls are disabled".to_string()));
                    }
                    let poll = s
                        .polls
                        .iter_mut()
                        .find(|p| p.id == poll_id)
                        .ok_or_else(|| RuntimeError::NotFound("Poll".to_string()))?;
                    if poll.is_closed() {
                        return Err(RuntimeError::Conflict("Poll is closed".to_string()));
                    }
                    validate_answers(poll, &answers)?;
                    poll.record_vote(&identity, answers, now);
                    Ok(Applied::Changed)
                }),
            )
            .await?;

        let poll = updated
            .session
            .polls
            .iter()
            .find(|p| p.id == poll_id)
            .ok_or_else(|| RuntimeError::Internal("poll missing after vote".to_string()))?;
        let view = PollView::from(poll);
        self.broadcast(
            &room,
            ServerEvent::PollUpdated {
                session_id: joined.session_id,
                poll_id,
                tally: view.tally.clone(),
                respondent_count: view.respondent_count,
            },
            None,
        )
        .await;
        self.touch(caller, joined);
        Ok(view)
    }

    /// Close a poll to further votes. Closing twice is a no-op.
    pub async fn close_poll(
        &self,
        caller: &Caller,
        joined: &JoinedRoom,
        poll_id: Uuid,
    ) -> Result<(), RuntimeError> {
        let (room, member) = self.active_member(caller, joined).await?;
        authorize(&member, Action::ManagePolls)
            .or_else(|_| authorize(&member, Action::ModeratePolls))?;

        let now = Utc::now();
        let updated = self
            .commit(
                joined.session_id,
                Box::new(move |s: &mut Session| {
                    let poll = s
                        .polls
                        .iter_mut()
                        .find(|p| p.id == poll_id)
                        .ok_or_else(|| RuntimeError::NotFound("Poll".to_string()))?;
                    if poll.is_closed() {
                        return Ok(Applied::Unchanged);
                    }
                    poll.closed_at = Some(now);
                    Ok(Applied::Changed)
                }),
            )
            .await?;

        if updated.changed() {
            let tally = updated
                .session
                .polls
                .iter()
                .find(|p| p.id == poll_id)
                .map(Poll::tally)
                .unwrap_or_default();
            self.broadcast(
                &room,
                ServerEvent::PollClosed {
                    session_id: joined.session_id,
                    poll_id,
                    tally,
                },
                None,
            )
            .await;
        }
        Ok(())
    }
}
