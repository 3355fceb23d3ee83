//! Duplex channel endpoint.
//!
//! One task per socket reads frames, dispatches each to the runtime and
//! delivers the direct reply through the connection actor. A second task
//! drains the connection actor's outbound queue into the socket, so room
//! broadcasts and replies share one ordered stream.

use super::auth::Identity;
use super::GatewayState;
use crate::actors::connection::CONNECTION_CHANNEL_BUFFER;
use crate::actors::{ConnectionActor, ConnectionActorHandle};
use crate::errors::RuntimeError;
use crate::observability::metrics as prom;
use crate::protocol::{ClientEnvelope, ClientMessage, ServerEvent, SessionRef, SignalKind};
use crate::runtime::{Caller, JoinedRoom, SessionRuntime};

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use common::types::ConnectionId;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    token: Option<String>,
}

/// `GET /v1/live`. Authenticates before the upgrade; a missing or invalid
/// token is answered with 401 and no socket.
pub async fn live_upgrade(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<ConnectQuery>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let identity = match state
        .verifier
        .authenticate(&headers, query.token.as_deref())
    {
        Ok(identity) => identity,
        Err(e) => {
            debug!(target: "rt.gateway", "Connection rejected before upgrade");
            prom::record_error("connect", e.error_code());
            return e.into_response();
        }
    };

    match upgrade {
        Ok(upgrade) => upgrade
            .on_upgrade(move |socket| serve_connection(socket, state, identity))
            .into_response(),
        Err(rejection) => rejection.into_response(),
    }
}

#[instrument(skip_all, name = "rt.gateway.connection")]
async fn serve_connection(socket: WebSocket, state: Arc<GatewayState>, identity: Identity) {
    let connection_id = ConnectionId::new();
    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Arc<ServerEvent>>(CONNECTION_CHANNEL_BUFFER);
    let cancel_token = state.shutdown.child_token();

    let (connection, actor_task) = ConnectionActor::spawn(
        connection_id,
        identity.subject.as_str(),
        outbound_tx,
        cancel_token.clone(),
        Arc::clone(&state.metrics),
    );

    let writer = tokio::spawn(async move {
        while let Some(event) = outbound_rx.recv().await {
            let text = match serde_json::to_string(event.as_ref()) {
                Ok(text) => text,
                Err(e) => {
                    warn!(target: "rt.gateway", error = %e, "Event serialization failed");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    });

    if let Err(e) = state.runtime.dispatcher().subscribe(connection.clone()).await {
        warn!(target: "rt.gateway", error = %e, "Private channel subscription failed");
    }
    connection.deliver(Arc::new(ServerEvent::Connected {
        connection_id,
        identity: identity.subject.clone(),
    }));
    info!(target: "rt.gateway", connection_id = %connection_id, "Connection opened");

    let caller = Caller::new(connection.clone(), identity.display_name.clone());
    let mut joined: Vec<JoinedRoom> = Vec::new();

    loop {
        let frame = tokio::select! {
            () = cancel_token.cancelled() => break,
            frame = stream.next() => frame,
        };
        match frame {
            Some(Ok(Message::Text(text))) => {
                handle_frame(&state.runtime, &caller, &mut joined, &text).await;
            }
            Some(Ok(Message::Binary(_))) => {
                reply(
                    &connection,
                    ServerEvent::error(
                        None,
                        &RuntimeError::Validation("Binary frames are not accepted".to_string()),
                    ),
                );
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            Some(Err(e)) => {
                debug!(target: "rt.gateway", error = %e, "Socket read failed");
                break;
            }
        }
    }

    close_connection(&state.runtime, &connection, &joined).await;
    join_task(actor_task, "connection_actor", connection_id).await;
    join_task(writer, "writer", connection_id).await;
    info!(
        target: "rt.gateway",
        connection_id = %connection_id,
        sessions = joined.len(),
        "Connection closed"
    );
}

/// Disconnect cleanup. Never fails.
async fn close_connection(
    runtime: &SessionRuntime,
    connection: &ConnectionActorHandle,
    joined: &[JoinedRoom],
) {
    runtime.disconnect(connection, joined).await;
    if let Err(e) = runtime
        .dispatcher()
        .unsubscribe(connection.identity(), connection.connection_id())
        .await
    {
        debug!(target: "rt.gateway", error = %e, "Private channel unsubscribe failed");
    }
    if let Err(e) = connection.close("connection closed").await {
        debug!(target: "rt.gateway", error = %e, "Connection actor already stopped");
    }
}

/// Wait for a per-socket task. Returns false if it panicked or was aborted.
async fn join_task(task: JoinHandle<()>, name: &'static str, connection_id: ConnectionId) -> bool {
    match task.await {
        Ok(()) => true,
        Err(e) => {
            warn!(
                target: "rt.gateway",
                connection_id = %connection_id,
                task = name,
                error = ?e,
                "Connection task did not finish cleanly"
            );
            false
        }
    }
}

fn reply(connection: &ConnectionActorHandle, event: ServerEvent) {
    if !connection.deliver(Arc::new(event)) {
        debug!(
            target: "rt.gateway",
            connection_id = %connection.connection_id(),
            "Reply dropped"
        );
    }
}

/// Parse and dispatch one text frame, delivering its direct reply.
pub(crate) async fn handle_frame(
    runtime: &SessionRuntime,
    caller: &Caller,
    joined: &mut Vec<JoinedRoom>,
    text: &str,
) {
    let started = Instant::now();
    let envelope: ClientEnvelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!(target: "rt.gateway", error = %e, "Malformed frame");
            reply(
                &caller.connection,
                ServerEvent::error(
                    None,
                    &RuntimeError::Validation("Malformed message".to_string()),
                ),
            );
            return;
        }
    };

    let kind = envelope.message.kind();
    let request_id = envelope.request_id;
    let event = match route(runtime, caller, joined, envelope.message, request_id.clone()).await {
        Ok(event) => event,
        Err(e) => {
            match &e {
                RuntimeError::Backend(_) | RuntimeError::Internal(_) => {
                    warn!(target: "rt.gateway", message_type = kind, error = %e, "Request failed");
                }
                _ => debug!(target: "rt.gateway", message_type = kind, error = %e, "Request refused"),
            }
            prom::record_error(kind, e.error_code());
            ServerEvent::error(request_id, &e)
        }
    };
    reply(&caller.connection, event);
    prom::record_message_latency(kind, started.elapsed());
}

/// The joined session a non-join message refers to.
fn joined_room(joined: &[JoinedRoom], session: &SessionRef) -> Result<JoinedRoom, RuntimeError> {
    joined
        .iter()
        .find(|j| j.matches(session))
        .cloned()
        .ok_or_else(|| RuntimeError::Forbidden("Join the session first".to_string()))
}

async fn route(
    runtime: &SessionRuntime,
    caller: &Caller,
    joined: &mut Vec<JoinedRoom>,
    message: ClientMessage,
    request_id: Option<String>,
) -> Result<ServerEvent, RuntimeError> {
    let ok = ServerEvent::Ok {
        request_id: request_id.clone(),
    };

    match message {
        ClientMessage::JoinSession { session } => {
            let outcome = runtime.join(caller, &session).await?;
            if !joined.iter().any(|j| j.session_id == outcome.room.session_id) {
                joined.push(outcome.room.clone());
            }
            Ok(outcome.reply(request_id))
        }
        ClientMessage::LeaveSession { session } => {
            let session_id = runtime.leave(caller, &session).await?;
            joined.retain(|j| j.session_id != session_id);
            Ok(ok)
        }
        ClientMessage::ApproveParticipant { session, identity } => {
            let room = joined_room(joined, &session)?;
            runtime.approve(caller, &room, &identity).await?;
            Ok(ok)
        }
        ClientMessage::RejectParticipant { session, identity } => {
            let room = joined_room(joined, &session)?;
            runtime.reject(caller, &room, &identity).await?;
            Ok(ok)
        }
        ClientMessage::StartSession { session } => {
            let room = joined_room(joined, &session)?;
            runtime.start(caller, &room).await?;
            Ok(ok)
        }
        ClientMessage::EndSession { session } => {
            let room = joined_room(joined, &session)?;
            runtime.end(caller, &room).await?;
            joined.retain(|j| j.session_id != room.session_id);
            Ok(ok)
        }
        ClientMessage::CancelSession { session } => {
            let room = joined_room(joined, &session)?;
            runtime.cancel(caller, &room).await?;
            joined.retain(|j| j.session_id != room.session_id);
            Ok(ok)
        }
        ClientMessage::UpdateSettings { session, settings } => {
            let room = joined_room(joined, &session)?;
            runtime.update_settings(caller, &room, settings).await?;
            Ok(ok)
        }
        ClientMessage::GetStats { session } => {
            let room = joined_room(joined, &session)?;
            let stats = runtime.stats(caller, &room).await?;
            Ok(ServerEvent::Stats { request_id, stats })
        }
        ClientMessage::SendMessage { session, content } => {
            let room = joined_room(joined, &session)?;
            runtime.send_message(caller, &room, &content).await?;
            Ok(ok)
        }
        ClientMessage::DeleteMessage {
            session,
            message_id,
        } => {
            let room = joined_room(joined, &session)?;
            runtime.delete_message(caller, &room, message_id).await?;
            Ok(ok)
        }
        ClientMessage::CreatePoll {
            session,
            question,
            options,
            allow_multiple,
        } => {
            let room = joined_room(joined, &session)?;
            runtime
                .create_poll(caller, &room, &question, &options, allow_multiple)
                .await?;
            Ok(ok)
        }
        ClientMessage::VotePoll {
            session,
            poll_id,
            choice,
        } => {
            let room = joined_room(joined, &session)?;
            runtime.vote_poll(caller, &room, poll_id, choice).await?;
            Ok(ok)
        }
        ClientMessage::ClosePoll { session, poll_id } => {
            let room = joined_room(joined, &session)?;
            runtime.close_poll(caller, &room, poll_id).await?;
            Ok(ok)
        }
        ClientMessage::AskQuestion { session, content } => {
            let room = joined_room(joined, &session)?;
            runtime.ask_question(caller, &room, &content).await?;
            Ok(ok)
        }
        ClientMessage::AnswerQuestion {
            session,
            question_id,
            answer,
        } => {
            let room = joined_room(joined, &session)?;
            runtime
                .answer_question(caller, &room, question_id, &answer)
                .await?;
            Ok(ok)
        }
        ClientMessage::UpvoteQuestion {
            session,
            question_id,
        } => {
            let room = joined_room(joined, &session)?;
            runtime.upvote_question(caller, &room, question_id).await?;
            Ok(ok)
        }
        ClientMessage::SendReaction { session, emoji } => {
            let room = joined_room(joined, &session)?;
            runtime.send_reaction(caller, &room, &emoji).await?;
            Ok(ok)
        }
        ClientMessage::UpdateMedia { session, media } => {
            let room = joined_room(joined, &session)?;
            runtime.update_media(caller, &room, media).await?;
            Ok(ok)
        }
        ClientMessage::MuteParticipant {
            session,
            identity,
            muted,
        } => {
            let room = joined_room(joined, &session)?;
            runtime
                .mute_participant(caller, &room, &identity, muted)
                .await?;
            Ok(ok)
        }
        ClientMessage::RemoveParticipant { session, identity } => {
            let room = joined_room(joined, &session)?;
            runtime.remove_participant(caller, &room, &identity).await?;
            Ok(ok)
        }
        ClientMessage::WebrtcOffer {
            session,
            target,
            payload,
        } => relay(runtime, caller, joined, SignalKind::WebrtcOffer, &session, target, payload, ok).await,
        ClientMessage::WebrtcAnswer {
            session,
            target,
            payload,
        } => relay(runtime, caller, joined, SignalKind::WebrtcAnswer, &session, target, payload, ok).await,
        ClientMessage::IceCandidate {
            session,
            target,
            payload,
        } => relay(runtime, caller, joined, SignalKind::IceCandidate, &session, target, payload, ok).await,
        ClientMessage::FileTransfer {
            session,
            target,
            payload,
        } => relay(runtime, caller, joined, SignalKind::FileTransfer, &session, target, payload, ok).await,
    }
}

#[allow(clippy::too_many_arguments)]
async fn relay(
    runtime: &SessionRuntime,
    caller: &Caller,
    joined: &[JoinedRoom],
    kind: SignalKind,
    session: &SessionRef,
    target: Option<ConnectionId>,
    payload: serde_json::Value,
    ok: ServerEvent,
) -> Result<ServerEvent, RuntimeError> {
    let room = joined_room(joined, session)?;
    runtime.relay(caller, &room, kind, target, payload).await?;
    Ok(ok)
}
