// Per-event handlers behind the socket loop. Each one takes the shared
// gateway state and the acting connection, emits its replies over the
// registry's outbound channels, and reports failures as scoped errors -
// a handler never tears the connection down.

use parlor_common::protocol::ws::{ClientEvent, ServerEvent};
use parlor_common::types::MessageKind;
use tracing::{debug, info};
use uuid::Uuid;

use super::GatewayState;
use crate::error::{ErrorCode, GatewayError};
use crate::session::Session;
use crate::stores::{DraftMessage, JoinCheck};

pub(crate) const RECENT_MESSAGE_LIMIT: u32 = 20;
pub(crate) const DEFAULT_HISTORY_LIMIT: u32 = 20;
pub(crate) const MAX_HISTORY_LIMIT: u32 = 100;
pub(crate) const MAX_MESSAGE_BYTES: usize = 4096;

pub(crate) const RATE_LIMIT_NOTICE: &str = "Rate limit exceeded. Please slow down.";

pub(crate) async fn dispatch(
    state: &GatewayState,
    conn_id: Uuid,
    event: ClientEvent,
) -> Result<(), GatewayError> {
    match event {
        ClientEvent::JoinRoom { room_id, password } => {
            handle_join_room(state, conn_id, room_id, password).await
        }
        ClientEvent::LeaveRoom { room_id } => handle_leave_room(state, conn_id, room_id).await,
        ClientEvent::SendMessage { room_id, content, kind } => {
            handle_send_message(state, conn_id, room_id, content, kind).await
        }
        ClientEvent::SendDirectMessage { receiver_id, content, kind } => {
            handle_send_direct_message(state, conn_id, receiver_id, content, kind).await
        }
        ClientEvent::LoadOlderMessages { room_id, last_message_id, limit } => {
            handle_load_older_messages(state, conn_id, room_id, last_message_id, limit).await
        }
        ClientEvent::GetDirectMessages { other_user_id, limit } => {
            handle_get_direct_messages(state, conn_id, other_user_id, limit).await
        }
        ClientEvent::Typing { room_id, is_typing } => {
            handle_typing(state, conn_id, room_id, is_typing).await
        }
    }
}

async fn require_session(state: &GatewayState, conn_id: Uuid) -> Result<Session, GatewayError> {
    state
        .registry
        .get(conn_id)
        .await
        .ok_or_else(|| GatewayError::new(ErrorCode::NotFound, "session not found"))
}

fn validate_content(content: &str) -> Result<(), GatewayError> {
    if content.trim().is_empty() {
        return Err(GatewayError::new(
            ErrorCode::ValidationFailed,
            "message content must not be empty",
        ));
    }
    if content.len() > MAX_MESSAGE_BYTES {
        return Err(GatewayError::new(
            ErrorCode::ValidationFailed,
            format!("message content exceeds {MAX_MESSAGE_BYTES} bytes"),
        ));
    }
    Ok(())
}

fn clamp_limit(limit: Option<u32>) -> u32 {
    limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, MAX_HISTORY_LIMIT)
}

pub(crate) async fn handle_join_room(
    state: &GatewayState,
    conn_id: Uuid,
    room_id: Uuid,
    password: Option<String>,
) -> Result<(), GatewayError> {
    let session = require_session(state, conn_id).await?;

    let current_members = state.rooms.member_count(room_id).await;
    match state
        .room_store
        .evaluate_join(room_id, password.as_deref(), current_members)
        .await?
    {
        JoinCheck::Allowed => {}
        JoinCheck::RoomNotFound => {
            return Err(GatewayError::new(ErrorCode::NotFound, "room not found"));
        }
        JoinCheck::WrongPassword => {
            return Err(GatewayError::new(ErrorCode::Forbidden, "incorrect room password"));
        }
        JoinCheck::RoomFull => {
            return Err(GatewayError::new(ErrorCode::Forbidden, "room is at capacity"));
        }
    }

    if !state.fanout.join_room(conn_id, &session.identity, room_id).await {
        return Err(GatewayError::new(ErrorCode::NotFound, "session not found"));
    }

    let mut recent = state.messages.recent(room_id, RECENT_MESSAGE_LIMIT, 0).await?;
    recent.reverse(); // oldest first for display
    let online_users = state.rooms.members_of(room_id).await;

    state
        .registry
        .send_to_connection(
            conn_id,
            ServerEvent::JoinedRoom {
                room_id,
                messages: recent,
                online_users: online_users.clone(),
            },
        )
        .await;

    state
        .fanout
        .broadcast_to_room(
            room_id,
            ServerEvent::UserJoined {
                user_id: session.identity.clone(),
                username: session.display_name.clone(),
                room_id,
                online_users,
            },
            Some(conn_id),
        )
        .await;

    info!(identity = %session.identity, %room_id, "joined room");
    Ok(())
}

pub(crate) async fn handle_leave_room(
    state: &GatewayState,
    conn_id: Uuid,
    room_id: Uuid,
) -> Result<(), GatewayError> {
    let session = require_session(state, conn_id).await?;

    let left = state.fanout.leave_room(conn_id, &session.identity, room_id).await;

    // Leaving a room that was never joined still confirms to the requester.
    state
        .registry
        .send_to_connection(conn_id, ServerEvent::LeftRoom { room_id })
        .await;

    if left {
        let online_users = state.rooms.members_of(room_id).await;
        state
            .fanout
            .broadcast_to_room(
                room_id,
                ServerEvent::UserLeft {
                    user_id: session.identity.clone(),
                    username: session.display_name.clone(),
                    room_id,
                    online_users,
                },
                Some(conn_id),
            )
            .await;
        info!(identity = %session.identity, %room_id, "left room");
    }
    Ok(())
}

pub(crate) async fn handle_send_message(
    state: &GatewayState,
    conn_id: Uuid,
    room_id: Uuid,
    content: String,
    kind: MessageKind,
) -> Result<(), GatewayError> {
    let session = require_session(state, conn_id).await?;
    validate_content(&content)?;

    if !state.limiter.check(&session.identity, &room_id.to_string()) {
        state
            .registry
            .send_to_connection(
                conn_id,
                ServerEvent::RateLimitExceeded { message: RATE_LIMIT_NOTICE.to_string() },
            )
            .await;
        return Ok(());
    }

    let stored = state
        .messages
        .persist(DraftMessage {
            room_id: Some(room_id),
            sender_id: session.identity.clone(),
            sender_name: session.display_name.clone(),
            receiver_id: None,
            content,
            kind,
        })
        .await?;

    state
        .fanout
        .broadcast_to_room(room_id, ServerEvent::NewMessage(stored), None)
        .await;

    debug!(identity = %session.identity, %room_id, "room message sent");
    Ok(())
}

pub(crate) async fn handle_send_direct_message(
    state: &GatewayState,
    conn_id: Uuid,
    receiver_id: String,
    content: String,
    kind: MessageKind,
) -> Result<(), GatewayError> {
    let session = require_session(state, conn_id).await?;
    validate_content(&content)?;
    if receiver_id.is_empty() {
        return Err(GatewayError::new(ErrorCode::ValidationFailed, "receiverId must not be empty"));
    }

    if !state.limiter.check(&session.identity, &receiver_id) {
        state
            .registry
            .send_to_connection(
                conn_id,
                ServerEvent::RateLimitExceeded { message: RATE_LIMIT_NOTICE.to_string() },
            )
            .await;
        return Ok(());
    }

    let stored = state
        .messages
        .persist(DraftMessage {
            room_id: None,
            sender_id: session.identity.clone(),
            sender_name: session.display_name.clone(),
            receiver_id: Some(receiver_id.clone()),
            content,
            kind,
        })
        .await?;

    let delivered = state
        .fanout
        .send_to_identity(&receiver_id, ServerEvent::NewDirectMessage(stored.clone()))
        .await;

    // The sender is confirmed regardless of the receiver's reachability.
    state
        .registry
        .send_to_connection(conn_id, ServerEvent::DirectMessageSent(stored))
        .await;

    debug!(identity = %session.identity, receiver = %receiver_id, delivered, "direct message sent");
    Ok(())
}

pub(crate) async fn handle_load_older_messages(
    state: &GatewayState,
    conn_id: Uuid,
    room_id: Uuid,
    last_message_id: Uuid,
    limit: Option<u32>,
) -> Result<(), GatewayError> {
    require_session(state, conn_id).await?;
    let limit = clamp_limit(limit);

    let mut page = state.messages.older_than(room_id, last_message_id, limit).await?;
    let has_more = page.len() == limit as usize;
    page.reverse(); // oldest first

    state
        .registry
        .send_to_connection(
            conn_id,
            ServerEvent::OlderMessages { room_id, messages: page, has_more },
        )
        .await;
    Ok(())
}

pub(crate) async fn handle_get_direct_messages(
    state: &GatewayState,
    conn_id: Uuid,
    other_user_id: String,
    limit: Option<u32>,
) -> Result<(), GatewayError> {
    let session = require_session(state, conn_id).await?;
    let limit = clamp_limit(limit);

    let mut page = state.messages.between(&session.identity, &other_user_id, limit, 0).await?;
    page.reverse(); // oldest first

    state
        .registry
        .send_to_connection(
            conn_id,
            ServerEvent::DirectMessages { other_user_id, messages: page },
        )
        .await;
    Ok(())
}

pub(crate) async fn handle_typing(
    state: &GatewayState,
    conn_id: Uuid,
    room_id: Uuid,
    is_typing: bool,
) -> Result<(), GatewayError> {
    let session = require_session(state, conn_id).await?;

    // No persistence, no rate limit: typing indicators are ephemeral.
    state
        .fanout
        .broadcast_to_room(
            room_id,
            ServerEvent::UserTyping {
                user_id: session.identity.clone(),
                username: session.display_name.clone(),
                room_id,
                is_typing,
            },
            Some(conn_id),
        )
        .await;
    Ok(())
}
