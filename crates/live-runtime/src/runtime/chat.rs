//! Chat log.

use super::{authorize, ensure_open, validate_text, Caller, JoinedRoom, SessionRuntime};
use crate::errors::RuntimeError;
use crate::model::{ChatMessage, Session};
use crate::permissions::Action;
use crate::protocol::ServerEvent;
use crate::store::Applied;

use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

impl SessionRuntime {
    /// Append a chat message and broadcast it to the room.
    pub async fn send_message(
        &self,
        caller: &Caller,
        joined: &JoinedRoom,
        content: &str,
    ) -> Result<ChatMessage, RuntimeError> {
        let (room, member) = self.active_member(caller, joined).await?;
        authorize(&member, Action::Chat)?;
        let content = validate_text("Message", content, self.settings.chat_max_length)?;

        let message = ChatMessage {
            id: Uuid::new_v4(),
            sender_identity: member.identity.clone(),
            sender_name: member.display_name.clone(),
            content,
            sent_at: Utc::now(),
            deleted: false,
        };
        let appended = message.clone();
        self.commit(
            joined.session_id,
            Box::new(move |s: &mut Session| {
                ensure_open(s)?;
                if !s.settings.chat_enabled {
                    return Err(RuntimeError::Forbidden("Chat is disabled".to_string()));
                }
                s.messages.push(appended);
                Ok(Applied::Changed)
            }),
        )
        .await?;

        self.broadcast(
            &room,
            ServerEvent::NewMessage {
                session_id: joined.session_id,
                message: message.clone(),
            },
            None,
        )
        .await;
        self.touch(caller, joined);
        debug!(target: "rt.interaction", session_id = %joined.session_id, message_id = %message.id, "Message sent");
        Ok(message)
    }

    /// Soft-delete a message. Deleting twice is a no-op.
    pub async fn delete_message(
        &self,
        caller: &Caller,
        joined: &JoinedRoom,
        message_id: Uuid,
    ) -> Result<(), RuntimeError> {
        let (room, member) = self.active_member(caller, joined).await?;
        authorize(&member, Action::ModerateChat)?;

        let updated = self
            .commit(
                joined.session_id,
                Box::new(move |s: &mut Session| {
                    let message = s
                        .messages
                        .iter_mut()
                        .find(|m| m.id == message_id)
                        .ok_or_else(|| RuntimeError::NotFound("Message".to_string()))?;
                    if message.deleted {
                        return Ok(Applied::Unchanged);
                    }
                    message.deleted = true;
                    Ok(Applied::Changed)
                }),
            )
            .await?;

        if updated.changed() {
            self.broadcast(
                &room,
                ServerEvent::MessageDeleted {
                    session_id: joined.session_id,
                    message_id,
                },
                None,
            )
            .await;
        }
        Ok(())
    }
}
