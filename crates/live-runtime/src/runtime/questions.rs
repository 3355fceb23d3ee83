//! Q&A.

use super::{authorize, ensure_open, validate_text, Caller, JoinedRoom, SessionRuntime};
use crate::errors::RuntimeError;
use crate::model::{Answer, Question, Session};
use crate::permissions::Action;
use crate::protocol::ServerEvent;
use crate::store::Applied;

use chrono::Utc;
use uuid::Uuid;

fn qa_open(session: &Session) -> Result<(), RuntimeError> {
    ensure_open(session)?;
    if session.settings.qa_enabled {
        Ok(())
    } else {
        Err(RuntimeError::Forbidden("Q&A is disabled".to_string()))
    }
}

impl SessionRuntime {
    pub async fn ask_question(
        &self,
        caller: &Caller,
        joined: &JoinedRoom,
        content: &str,
    ) -> Result<Question, RuntimeError> {
        let (room, member) = self.active_member(caller, joined).await?;
        authorize(&member, Action::AskQuestion)?;
        let content = validate_text("Question", content, self.settings.chat_max_length)?;

        let question = Question {
            id: Uuid::new_v4(),
            asker_identity: member.identity.clone(),
            asker_name: member.display_name.clone(),
            content,
            asked_at: Utc::now(),
            answer: None,
            upvoters: Vec::new(),
        };
        let appended = question.clone();
        self.commit(
            joined.session_id,
            Box::new(move |s: &mut Session| {
                qa_open(s)?;
                if let Some(p) = s.participant_mut(&appended.asker_identity) {
                    p.questions_asked += 1;
                }
                s.questions.push(appended);
                Ok(Applied::Changed)
            }),
        )
        .await?;

        self.broadcast(
            &room,
            ServerEvent::NewQuestion {
                session_id: joined.session_id,
                question: question.clone(),
            },
            None,
        )
        .await;
        self.touch(caller, joined);
        Ok(question)
    }

    /// Attach or replace the answer to a question.
    pub async fn answer_question(
        &self,
        caller: &Caller,
        joined: &JoinedRoom,
        question_id: Uuid,
        answer: &str,
    ) -> Result<(), RuntimeError> {
        let (room, member) = self.active_member(caller, joined).await?;
        authorize(&member, Action::AnswerQuestion)?;
        let content = validate_text("Answer", answer, self.settings.chat_max_length)?;

        let answer = Answer {
            answered_by: member.identity.clone(),
            content,
            answered_at: Utc::now(),
        };
        let stored = answer.clone();
        self.commit(
            joined.session_id,
            Box::new(move |s: &mut Session| {
                qa_open(s)?;
                let question = s
                    .questions
                    .iter_mut()
                    .find(|q| q.id == question_id)
                    .ok_or_else(|| RuntimeError::NotFound("Question".to_string()))?;
                question.answer = Some(stored);
                Ok(Applied::Changed)
            }),
        )
        .await?;

        self.broadcast(
            &room,
            ServerEvent::QuestionAnswered {
                session_id: joined.session_id,
                question_id,
                answer,
            },
            None,
        )
        .await;
        self.touch(caller, joined);
        Ok(())
    }

    /// Toggle the caller's upvote. Returns the new upvote count.
    pub async fn upvote_question(
        &self,
        caller: &Caller,
        joined: &JoinedRoom,
        question_id: Uuid,
    ) -> Result<usize, RuntimeError> {
        let (room, member) = self.active_member(caller, joined).await?;
        authorize(&member, Action::Vote)?;

        let identity = member.identity.clone();
        let updated = self
            .commit(
                joined.session_id,
                Box::new(move |s: &mut Session| {
                    qa_open(s)?;
                    let question = s
                        .questions
                        .iter_mut()
                        .find(|q| q.id == question_id)
                        .ok_or_else(|| RuntimeError::NotFound("Question".to_string()))?;
                    question.toggle_upvote(&identity);
                    Ok(Applied::Changed)
                }),
            )
            .await?;

        let upvotes = updated
            .session
            .questions
            .iter()
            .find(|q| q.id == question_id)
            .map_or(0, Question::upvote_count);
        self.broadcast(
            &room,
            ServerEvent::QuestionUpvoted {
                session_id: joined.session_id,
                question_id,
                upvotes,
            },
            None,
        )
        .await;
        self.touch(caller, joined);
        Ok(upvotes)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::super::testing::{harness, harness_with, open_settings, ORGANIZER};
    use super::super::RuntimeSettings;
    use super::*;
    use crate::model::SessionSettings;

    #[tokio::test]
    async fn test_ask_and_answer() {
        let h = harness_with(open_settings(), RuntimeSettings::default(), |s| {
            s.speakers.push("sam".to_string());
        })
        .await;
        let mut alice = h.join("alice").await;
        let sam = h.join("sam").await;

        let question = h
            .runtime
            .ask_question(&alice.caller, &alice.joined, "When is the demo?")
            .await
            .unwrap();
        h.runtime
            .answer_question(&sam.caller, &sam.joined, question.id, "Friday")
            .await
            .unwrap();

        let session = h.session().await;
        assert_eq!(session.questions[0].answer.as_ref().unwrap().content, "Friday");
        assert_eq!(session.participant("alice").unwrap().questions_asked, 1);
        let seen = alice.drain().await;
        assert!(seen
            .iter()
            .any(|e| matches!(e, ServerEvent::QuestionAnswered { .. })));
    }

    #[tokio::test]
    async fn test_attendee_cannot_answer() {
        let h = harness(open_settings()).await;
        let alice = h.join("alice").await;
        let question = h
            .runtime
            .ask_question(&alice.caller, &alice.joined, "Anyone?")
            .await
            .unwrap();

        let err = h
            .runtime
            .answer_question(&alice.caller, &alice.joined, question.id, "Me")
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_upvote_toggles() {
        let h = harness(open_settings()).await;
        let alice = h.join("alice").await;
        let bob = h.join("bob").await;
        let question = h
            .runtime
            .ask_question(&alice.caller, &alice.joined, "Slides?")
            .await
            .unwrap();

        let rt = &h.runtime;
        let id = question.id;
        assert_eq!(rt.upvote_question(&bob.caller, &bob.joined, id).await.unwrap(), 1);
        assert_eq!(rt.upvote_question(&alice.caller, &alice.joined, id).await.unwrap(), 2);
        assert_eq!(rt.upvote_question(&bob.caller, &bob.joined, id).await.unwrap(), 1);
        assert_eq!(h.session().await.questions[0].upvoters, vec!["alice".to_string()]);
    }

    #[tokio::test]
    async fn test_disabled_qa() {
        let settings = SessionSettings {
            qa_enabled: false,
            ..open_settings()
        };
        let h = harness(settings).await;
        let organizer = h.join(ORGANIZER).await;

        let err = h
            .runtime
            .ask_question(&organizer.caller, &organizer.joined, "Hm?")
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Forbidden(_)));
    }
}
