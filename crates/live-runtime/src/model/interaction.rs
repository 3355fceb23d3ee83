//! Chat, poll and Q&A records embedded in a session document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A chat message. Deletion is soft so the log stays append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub sender_identity: String,
    pub sender_name: Option<String>,
    pub content: String,
    pub sent_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted: bool,
}

/// One respondent's current answer set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollResponse {
    pub identity: String,
    pub answers: Vec<usize>,
    pub voted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Poll {
    pub id: Uuid,
    pub question: String,
    pub options: Vec<String>,
    pub allow_multiple: bool,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub respondents: Vec<PollResponse>,
}

impl Poll {
    /// Per-option vote counts, recomputed by scanning respondents.
    #[must_use]
    pub fn tally(&self) -> Vec<u32> {
        let mut counts = vec![0u32; self.options.len()];
        for response in &self.respondents {
            for &index in &response.answers {
                if let Some(slot) = counts.get_mut(index) {
                    *slot += 1;
                }
            }
        }
        counts
    }

    /// Records `answers` for `identity`, replacing any earlier answer set.
    ///
    /// Returns true if this was a re-vote.
    pub fn record_vote(&mut self, identity: &str, answers: Vec<usize>, at: DateTime<Utc>) -> bool {
        if let Some(existing) = self.respondents.iter_mut().find(|r| r.identity == identity) {
            existing.answers = answers;
            existing.voted_at = at;
            return true;
        }
        self.respondents.push(PollResponse {
            identity: identity.to_string(),
            answers,
            voted_at: at,
        });
        false
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed_at.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Answer {
    pub answered_by: String,
    pub content: String,
    pub answered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub id: Uuid,
    pub asker_identity: String,
    pub asker_name: Option<String>,
    pub content: String,
    pub asked_at: DateTime<Utc>,
    pub answer: Option<Answer>,
    /// Identities currently upvoting. A list, never a counter.
    #[serde(default)]
    pub upvoters: Vec<String>,
}

impl Question {
    /// Adds or removes `identity` from the upvoters. Returns the new state.
    pub fn toggle_upvote(&mut self, identity: &str) -> bool {
        if let Some(pos) = self.upvoters.iter().position(|u| u == identity) {
            self.upvoters.remove(pos);
            false
        } else {
            self.upvoters.push(identity.to_string());
            true
        }
    }

    #[must_use]
    pub fn upvote_count(&self) -> usize {
        self.upvoters.len()
    }
}
