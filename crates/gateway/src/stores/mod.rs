// External collaborator interfaces: users, rooms, and messages.
//
// Each store is consumed through a narrow facade with a Postgres variant
// (the real deployment) and an in-memory variant (dev mode and tests).
// The gateway core never owns these records - it reads identity profiles
// and room eligibility, and appends messages.

use chrono::{DateTime, Utc};
use parlor_common::types::{MessageKind, StoredMessage};
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,
    #[error("store backend failure: {0}")]
    Backend(#[from] sqlx::Error),
}

/// What the user store knows about a durable identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityProfile {
    pub display_name: String,
    pub previous_rooms: Vec<Uuid>,
}

/// Outcome of a room eligibility check. Capacity is checked against the
/// live membership count supplied by the caller, not re-enforced here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinCheck {
    Allowed,
    RoomNotFound,
    WrongPassword,
    RoomFull,
}

/// SHA-256 hex digest used for room password comparison.
pub fn password_digest(password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

// ── User store ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MemoryUser {
    pub display_name: String,
    pub previous_rooms: Vec<Uuid>,
    pub is_online: bool,
}

#[derive(Clone)]
pub enum UserStore {
    Postgres(PgPool),
    Memory(Arc<RwLock<HashMap<String, MemoryUser>>>),
}

impl UserStore {
    pub fn memory() -> Self {
        Self::Memory(Arc::new(RwLock::new(HashMap::new())))
    }

    /// Insert a user into the in-memory variant. Returns false on Postgres,
    /// where user provisioning belongs to the external service.
    pub async fn seed_user(&self, identity: &str, user: MemoryUser) -> bool {
        match self {
            Self::Postgres(_) => false,
            Self::Memory(users) => {
                users.write().await.insert(identity.to_string(), user);
                true
            }
        }
    }

    /// Look up a durable identity. Anonymous identities are never durable,
    /// so a non-UUID id resolves to `None` rather than an error.
    pub async fn find_identity(
        &self,
        identity: &str,
    ) -> Result<Option<IdentityProfile>, StoreError> {
        match self {
            Self::Postgres(pool) => {
                let Ok(user_id) = Uuid::parse_str(identity) else {
                    return Ok(None);
                };
                let row = sqlx::query_as::<_, (String, Vec<Uuid>)>(
                    "SELECT username, previous_rooms FROM users WHERE id = $1",
                )
                .bind(user_id)
                .fetch_optional(pool)
                .await?;

                Ok(row.map(|(display_name, previous_rooms)| IdentityProfile {
                    display_name,
                    previous_rooms,
                }))
            }
            Self::Memory(users) => Ok(users.read().await.get(identity).map(|user| {
                IdentityProfile {
                    display_name: user.display_name.clone(),
                    previous_rooms: user.previous_rooms.clone(),
                }
            })),
        }
    }

    /// Record whether the identity currently holds a connection. Unknown
    /// identities are ignored: presence is best-effort bookkeeping.
    pub async fn set_presence(&self, identity: &str, online: bool) -> Result<(), StoreError> {
        match self {
            Self::Postgres(pool) => {
                let Ok(user_id) = Uuid::parse_str(identity) else {
                    return Ok(());
                };
                sqlx::query(
                    "UPDATE users SET is_online = $2, last_seen_at = now() WHERE id = $1",
                )
                .bind(user_id)
                .bind(online)
                .execute(pool)
                .await?;
                Ok(())
            }
            Self::Memory(users) => {
                if let Some(user) = users.write().await.get_mut(identity) {
                    user.is_online = online;
                }
                Ok(())
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn is_online(&self, identity: &str) -> Option<bool> {
        match self {
            Self::Postgres(_) => None,
            Self::Memory(users) => users.read().await.get(identity).map(|user| user.is_online),
        }
    }
}

// ── Room store ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MemoryRoom {
    pub name: String,
    /// SHA-256 hex digest of the room password, when one is set.
    pub password_digest: Option<String>,
    pub capacity: Option<u32>,
}

impl MemoryRoom {
    pub fn open(name: &str) -> Self {
        Self { name: name.to_string(), password_digest: None, capacity: None }
    }

    pub fn with_password(mut self, password: &str) -> Self {
        self.password_digest = Some(password_digest(password));
        self
    }

    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.capacity = Some(capacity);
        self
    }
}

#[derive(Clone)]
pub enum RoomStore {
    Postgres(PgPool),
    Memory(Arc<RwLock<HashMap<Uuid, MemoryRoom>>>),
}

impl RoomStore {
    pub fn memory() -> Self {
        Self::Memory(Arc::new(RwLock::new(HashMap::new())))
    }

    /// Insert a room into the in-memory variant. Returns false on Postgres.
    pub async fn seed_room(&self, room_id: Uuid, room: MemoryRoom) -> bool {
        match self {
            Self::Postgres(_) => false,
            Self::Memory(rooms) => {
                rooms.write().await.insert(room_id, room);
                true
            }
        }
    }

    pub async fn exists(&self, room_id: Uuid) -> Result<bool, StoreError> {
        match self {
            Self::Postgres(pool) => {
                let found = sqlx::query_scalar::<_, i32>("SELECT 1 FROM rooms WHERE id = $1")
                    .bind(room_id)
                    .fetch_optional(pool)
                    .await?;
                Ok(found.is_some())
            }
            Self::Memory(rooms) => Ok(rooms.read().await.contains_key(&room_id)),
        }
    }

    /// Eligibility check for a join attempt: existence, password, capacity.
    pub async fn evaluate_join(
        &self,
        room_id: Uuid,
        password: Option<&str>,
        current_members: usize,
    ) -> Result<JoinCheck, StoreError> {
        let (stored_digest, capacity) = match self {
            Self::Postgres(pool) => {
                let row = sqlx::query_as::<_, (Option<String>, Option<i32>)>(
                    "SELECT password_digest, capacity FROM rooms WHERE id = $1",
                )
                .bind(room_id)
                .fetch_optional(pool)
                .await?;
                match row {
                    Some((digest, capacity)) => {
                        (digest, capacity.and_then(|value| u32::try_from(value).ok()))
                    }
                    None => return Ok(JoinCheck::RoomNotFound),
                }
            }
            Self::Memory(rooms) => match rooms.read().await.get(&room_id) {
                Some(room) => (room.password_digest.clone(), room.capacity),
                None => return Ok(JoinCheck::RoomNotFound),
            },
        };

        if let Some(stored_digest) = stored_digest {
            let presented = password.map(password_digest);
            if presented.as_deref() != Some(stored_digest.as_str()) {
                return Ok(JoinCheck::WrongPassword);
            }
        }

        if let Some(capacity) = capacity {
            if current_members >= capacity as usize {
                return Ok(JoinCheck::RoomFull);
            }
        }

        Ok(JoinCheck::Allowed)
    }
}

// ── Message store ───────────────────────────────────────────────────

/// A message as submitted by a client, before the store assigns id and
/// timestamp.
#[derive(Debug, Clone)]
pub struct DraftMessage {
    pub room_id: Option<Uuid>,
    pub sender_id: String,
    pub sender_name: String,
    pub receiver_id: Option<String>,
    pub content: String,
    pub kind: MessageKind,
}

#[derive(Clone)]
pub enum MessageStore {
    Postgres(PgPool),
    Memory(Arc<RwLock<Vec<StoredMessage>>>),
}

type MessageRow = (
    Uuid,
    Option<Uuid>,
    String,
    String,
    Option<String>,
    String,
    String,
    DateTime<Utc>,
);

const MESSAGE_COLUMNS: &str =
    "id, room_id, sender_id, sender_name, receiver_id, content, kind, created_at";

fn row_to_message(row: MessageRow) -> StoredMessage {
    let (id, room_id, sender_id, sender_name, receiver_id, content, kind, created_at) = row;
    StoredMessage {
        id,
        room_id,
        sender_id,
        sender_name,
        receiver_id,
        content,
        kind: MessageKind::parse(&kind).unwrap_or_default(),
        created_at,
    }
}

impl MessageStore {
    pub fn memory() -> Self {
        Self::Memory(Arc::new(RwLock::new(Vec::new())))
    }

    /// Append a message, assigning its id and timestamp.
    pub async fn persist(&self, draft: DraftMessage) -> Result<StoredMessage, StoreError> {
        match self {
            Self::Postgres(pool) => {
                let (id, created_at) = sqlx::query_as::<_, (Uuid, DateTime<Utc>)>(
                    "INSERT INTO messages (room_id, sender_id, sender_name, receiver_id, content, kind) \
                     VALUES ($1, $2, $3, $4, $5, $6) RETURNING id, created_at",
                )
                .bind(draft.room_id)
                .bind(&draft.sender_id)
                .bind(&draft.sender_name)
                .bind(&draft.receiver_id)
                .bind(&draft.content)
                .bind(draft.kind.as_str())
                .fetch_one(pool)
                .await?;

                Ok(StoredMessage {
                    id,
                    room_id: draft.room_id,
                    sender_id: draft.sender_id,
                    sender_name: draft.sender_name,
                    receiver_id: draft.receiver_id,
                    content: draft.content,
                    kind: draft.kind,
                    created_at,
                })
            }
            Self::Memory(messages) => {
                let message = StoredMessage {
                    id: Uuid::new_v4(),
                    room_id: draft.room_id,
                    sender_id: draft.sender_id,
                    sender_name: draft.sender_name,
                    receiver_id: draft.receiver_id,
                    content: draft.content,
                    kind: draft.kind,
                    created_at: Utc::now(),
                };
                messages.write().await.push(message.clone());
                Ok(message)
            }
        }
    }

    /// A room's latest messages, newest first.
    pub async fn recent(
        &self,
        room_id: Uuid,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        match self {
            Self::Postgres(pool) => {
                let rows = sqlx::query_as::<_, MessageRow>(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE room_id = $1 \
                     ORDER BY created_at DESC, id DESC LIMIT $2 OFFSET $3"
                ))
                .bind(room_id)
                .bind(i64::from(limit))
                .bind(i64::from(offset))
                .fetch_all(pool)
                .await?;
                Ok(rows.into_iter().map(row_to_message).collect())
            }
            Self::Memory(messages) => {
                let guard = messages.read().await;
                Ok(guard
                    .iter()
                    .rev()
                    .filter(|message| message.room_id == Some(room_id))
                    .skip(offset as usize)
                    .take(limit as usize)
                    .cloned()
                    .collect())
            }
        }
    }

    /// Messages strictly older than a known message, newest first.
    /// An unknown anchor yields an empty page.
    pub async fn older_than(
        &self,
        room_id: Uuid,
        before_message_id: Uuid,
        limit: u32,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        match self {
            Self::Postgres(pool) => {
                let rows = sqlx::query_as::<_, MessageRow>(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE room_id = $1 \
                     AND created_at < (SELECT created_at FROM messages WHERE id = $2) \
                     ORDER BY created_at DESC, id DESC LIMIT $3"
                ))
                .bind(room_id)
                .bind(before_message_id)
                .bind(i64::from(limit))
                .fetch_all(pool)
                .await?;
                Ok(rows.into_iter().map(row_to_message).collect())
            }
            Self::Memory(messages) => {
                let guard = messages.read().await;
                let Some(anchor) =
                    guard.iter().position(|message| message.id == before_message_id)
                else {
                    return Ok(Vec::new());
                };
                Ok(guard[..anchor]
                    .iter()
                    .rev()
                    .filter(|message| message.room_id == Some(room_id))
                    .take(limit as usize)
                    .cloned()
                    .collect())
            }
        }
    }

    /// Direct-message history between two identities, newest first.
    pub async fn between(
        &self,
        identity_a: &str,
        identity_b: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        match self {
            Self::Postgres(pool) => {
                let rows = sqlx::query_as::<_, MessageRow>(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages \
                     WHERE (sender_id = $1 AND receiver_id = $2) \
                        OR (sender_id = $2 AND receiver_id = $1) \
                     ORDER BY created_at DESC, id DESC LIMIT $3 OFFSET $4"
                ))
                .bind(identity_a)
                .bind(identity_b)
                .bind(i64::from(limit))
                .bind(i64::from(offset))
                .fetch_all(pool)
                .await?;
                Ok(rows.into_iter().map(row_to_message).collect())
            }
            Self::Memory(messages) => {
                let guard = messages.read().await;
                Ok(guard
                    .iter()
                    .rev()
                    .filter(|message| {
                        let to = message.receiver_id.as_deref();
                        (message.sender_id == identity_a && to == Some(identity_b))
                            || (message.sender_id == identity_b && to == Some(identity_a))
                    })
                    .skip(offset as usize)
                    .take(limit as usize)
                    .cloned()
                    .collect())
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn count(&self) -> usize {
        match self {
            Self::Postgres(_) => 0,
            Self::Memory(messages) => messages.read().await.len(),
        }
    }
}
