// Gateway protocol handler: the WebSocket endpoint and the per-connection
// state machine.
//
// Lifecycle per connection: upgrade -> identity resolution (verified token
// or synthesized anonymous id) -> session registration + reconnection
// recovery -> event loop -> disconnect cleanup. One task per connection;
// a connection's events are handled in arrival order.

pub(crate) mod handler;
pub(crate) mod protocol;

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
    Router,
};
use chrono::Utc;
use parlor_common::protocol::ws::ServerEvent;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auth::jwt::JwtVerifier;
use crate::error::{ErrorCode, GatewayError};
use crate::fanout::FanoutEngine;
use crate::limiter::RateLimiter;
use crate::reconnect::ReconnectionCoordinator;
use crate::rooms::RoomIndex;
use crate::session::SessionRegistry;
use crate::stores::{MessageStore, RoomStore, UserStore};

pub(crate) const HEARTBEAT_INTERVAL_MS: u64 = 15_000;
pub(crate) const HEARTBEAT_TIMEOUT_MS: u64 = 10_000;
pub(crate) const MAX_FRAME_BYTES: usize = 65_536;

pub(crate) const ANONYMOUS_USERNAME: &str = "Anonymous";

#[derive(Clone)]
pub struct GatewayState {
    pub(crate) jwt: Arc<JwtVerifier>,
    pub(crate) registry: SessionRegistry,
    pub(crate) rooms: RoomIndex,
    pub(crate) limiter: Arc<RateLimiter>,
    pub(crate) fanout: Arc<FanoutEngine>,
    pub(crate) reconnect: Arc<ReconnectionCoordinator>,
    pub(crate) users: UserStore,
    pub(crate) room_store: RoomStore,
    pub(crate) messages: MessageStore,
}

pub fn router(state: GatewayState) -> Router {
    Router::new().route("/v1/ws", get(ws_upgrade)).with_state(state)
}

pub async fn ws_upgrade(
    State(state): State<GatewayState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let token = extract_token(&params, &headers);
    ws.max_frame_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| handle_socket(state, socket, token))
}

/// Token precedence: `auth` field, `token` query parameter, then the
/// `Authorization: Bearer` header. Absence is not an error - the
/// connection proceeds anonymously.
fn extract_token(params: &HashMap<String, String>, headers: &HeaderMap) -> Option<String> {
    if let Some(token) = params.get("auth").filter(|value| !value.is_empty()) {
        return Some(token.clone());
    }
    if let Some(token) = params.get("token").filter(|value| !value.is_empty()) {
        return Some(token.clone());
    }
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
}

/// Resolved identity for a new connection: (identity, display name,
/// authenticated). Verification failure degrades to anonymous; the
/// connection is never rejected for a missing or invalid credential.
fn resolve_identity(jwt: &JwtVerifier, token: Option<&str>) -> (String, String, bool) {
    match token {
        Some(token) => match jwt.verify(token) {
            Ok(identity) => (identity.user_id.to_string(), identity.username, true),
            Err(error) => {
                warn!(%error, "invalid token on connect, treating as anonymous");
                anonymous_identity()
            }
        },
        None => anonymous_identity(),
    }
}

fn anonymous_identity() -> (String, String, bool) {
    (
        format!("anonymous_{}", Utc::now().timestamp_millis()),
        ANONYMOUS_USERNAME.to_string(),
        false,
    )
}

fn is_frame_size_violation(error: &axum::Error) -> bool {
    let message = error.to_string().to_ascii_lowercase();
    message.contains("message too long")
        || message.contains("frame too long")
        || message.contains("too large")
        || message.contains("too big")
        || message.contains("size limit")
}

async fn close_frame_too_large(socket: &mut WebSocket) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::SIZE,
            reason: format!("websocket frame exceeds maximum size of {MAX_FRAME_BYTES} bytes")
                .into(),
        })))
        .await;
}

async fn handle_socket(state: GatewayState, mut socket: WebSocket, token: Option<String>) {
    let conn_id = Uuid::new_v4();
    let (identity, display_name, authenticated) =
        resolve_identity(&state.jwt, token.as_deref());

    state
        .registry
        .add_connection(conn_id, &identity, &display_name, authenticated)
        .await;

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ServerEvent>();
    if !state.registry.register_outbound(conn_id, outbound_tx.clone()).await {
        return;
    }

    state.fanout.announce_connect(&identity).await;

    if authenticated {
        if let Err(store_error) = state.users.set_presence(&identity, true).await {
            error!(%identity, %store_error, "failed to set online presence");
        }

        // Restore persisted room memberships before the client hears
        // anything else; a failure here degrades to a fresh session.
        match state.reconnect.restore(&identity, conn_id).await {
            Ok(rooms) if !rooms.is_empty() => {
                let _ = outbound_tx.send(ServerEvent::Reconnected { rooms });
            }
            Ok(_) => {}
            Err(store_error) => {
                error!(%identity, %store_error, "reconnection recovery failed");
            }
        }
    }

    let _ = outbound_tx.send(ServerEvent::Connected {
        message: "Connected to chat server".to_string(),
        user_id: identity.clone(),
        username: display_name.clone(),
        connection_id: conn_id,
    });

    info!(%conn_id, %identity, username = %display_name, authenticated, "client connected");

    // Heartbeat: server pings every HEARTBEAT_INTERVAL_MS and disconnects
    // when the previous ping got no pong within HEARTBEAT_TIMEOUT_MS.
    let heartbeat_period = std::time::Duration::from_millis(HEARTBEAT_INTERVAL_MS);
    let mut heartbeat_interval = tokio::time::interval(heartbeat_period);
    heartbeat_interval.reset(); // skip immediate first tick
    let mut last_pong = Instant::now();
    let heartbeat_timeout =
        heartbeat_period + std::time::Duration::from_millis(HEARTBEAT_TIMEOUT_MS);

    loop {
        tokio::select! {
            _ = heartbeat_interval.tick() => {
                if last_pong.elapsed() > heartbeat_timeout {
                    warn!(%conn_id, %identity, "heartbeat timeout, disconnecting");
                    break;
                }
                if socket.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }
            maybe_outbound = outbound_rx.recv() => {
                match maybe_outbound {
                    Some(event) => {
                        if protocol::send_event(&mut socket, &event).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break;
                };

                match message {
                    Ok(Message::Text(raw)) => {
                        if raw.len() > MAX_FRAME_BYTES {
                            close_frame_too_large(&mut socket).await;
                            break;
                        }

                        let event = match protocol::decode_event(&raw) {
                            Ok(event) => event,
                            Err(decode_error) => {
                                warn!(%conn_id, %decode_error, "malformed client event");
                                let invalid = GatewayError::new(
                                    ErrorCode::ValidationFailed,
                                    "malformed event payload",
                                );
                                state.registry.send_to_connection(conn_id, invalid.to_event()).await;
                                continue;
                            }
                        };

                        if let Err(action_error) = handler::dispatch(&state, conn_id, event).await {
                            log_action_error(conn_id, &action_error);
                            state
                                .registry
                                .send_to_connection(conn_id, action_error.to_event())
                                .await;
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Pong(_)) => {
                        last_pong = Instant::now();
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(socket_error) => {
                        if is_frame_size_violation(&socket_error) {
                            close_frame_too_large(&mut socket).await;
                        }
                        break;
                    }
                }
            }
        }
    }

    disconnect_sequence(&state, conn_id).await;
}

/// Scoped failures are logged by severity, per the error taxonomy:
/// validation at warn, internal at error, the rest at debug.
fn log_action_error(conn_id: Uuid, action_error: &GatewayError) {
    match action_error.code() {
        ErrorCode::ValidationFailed => warn!(%conn_id, %action_error, "rejected client event"),
        ErrorCode::InternalError => error!(%conn_id, %action_error, "client event failed"),
        _ => debug!(%conn_id, %action_error, "client event denied"),
    }
}

/// Disconnect: remove the session, then leave each of its rooms and tell
/// the remaining members who is still there.
pub(crate) async fn disconnect_sequence(state: &GatewayState, conn_id: Uuid) {
    let Some(session) = state.registry.remove_connection(conn_id).await else {
        return;
    };

    let mut joined: Vec<Uuid> = session.joined_rooms.iter().copied().collect();
    joined.sort();
    for room_id in joined {
        state.fanout.depart_room(&session.identity, room_id).await;
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
                None,
            )
            .await;
    }

    state.fanout.announce_disconnect(&session.identity).await;

    if session.authenticated {
        if let Err(store_error) = state.users.set_presence(&session.identity, false).await {
            error!(identity = %session.identity, %store_error, "failed to set offline presence");
        }
    }

    info!(%conn_id, identity = %session.identity, "client disconnected");
}
