// WebSocket event types for the parlor-chat.v1 protocol.
//
// Every frame is a JSON object `{"event": <name>, "data": {...}}`. Inbound
// and outbound events are separate enums: the gateway never parses its own
// output and clients never parse their own requests.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{MessageKind, StoredMessage};

pub const CURRENT_PROTOCOL_VERSION: &str = "parlor-chat.v1";

/// All client -> server events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    /// Join a room, optionally presenting its password.
    JoinRoom {
        room_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
    },

    /// Leave a previously joined room.
    LeaveRoom { room_id: Uuid },

    /// Send a message to a room.
    SendMessage {
        room_id: Uuid,
        content: String,
        #[serde(default)]
        kind: MessageKind,
    },

    /// Send a direct message to another identity.
    SendDirectMessage {
        receiver_id: String,
        content: String,
        #[serde(default)]
        kind: MessageKind,
    },

    /// Page back through a room's history, anchored below a known message.
    LoadOlderMessages {
        room_id: Uuid,
        last_message_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<u32>,
    },

    /// Fetch the direct-message history with another identity.
    GetDirectMessages {
        other_user_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<u32>,
    },

    /// Typing indicator for a room. Never persisted.
    Typing { room_id: Uuid, is_typing: bool },
}

/// All server -> client events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    /// Handshake result, sent once per connection.
    Connected {
        message: String,
        user_id: String,
        username: String,
        connection_id: Uuid,
    },

    /// Rooms restored for a returning authenticated identity.
    Reconnected { rooms: Vec<Uuid> },

    /// Reply to the requester after a successful join.
    JoinedRoom {
        room_id: Uuid,
        messages: Vec<StoredMessage>,
        online_users: Vec<String>,
    },

    /// Someone else joined a room you are in.
    UserJoined {
        user_id: String,
        username: String,
        room_id: Uuid,
        online_users: Vec<String>,
    },

    /// Reply to the requester after leaving a room.
    LeftRoom { room_id: Uuid },

    /// Someone else left a room you are in (or disconnected).
    UserLeft {
        user_id: String,
        username: String,
        room_id: Uuid,
        online_users: Vec<String>,
    },

    /// A room message, delivered to every member including the sender.
    NewMessage(StoredMessage),

    /// A direct message, delivered to the receiver's connections.
    NewDirectMessage(StoredMessage),

    /// Delivery confirmation echoed to the direct-message sender.
    DirectMessageSent(StoredMessage),

    /// Reply to a history page request.
    OlderMessages {
        room_id: Uuid,
        messages: Vec<StoredMessage>,
        has_more: bool,
    },

    /// Reply to a direct-message history request.
    DirectMessages {
        other_user_id: String,
        messages: Vec<StoredMessage>,
    },

    /// Typing indicator relayed to everyone else in the room.
    UserTyping {
        user_id: String,
        username: String,
        room_id: Uuid,
        is_typing: bool,
    },

    /// The sender exceeded the per-conversation message budget.
    RateLimitExceeded { message: String },

    /// Scoped failure for a single action; the connection stays up.
    Error {
        code: String,
        message: String,
        retryable: bool,
    },
}
