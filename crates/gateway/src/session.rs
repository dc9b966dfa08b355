// Session Registry: the live binding between transport connections and
// identities.
//
// One `Session` per accepted WebSocket, keyed by connection id. The
// joined-room set here and the Room Membership Index are mutated together
// by the fan-out engine so the two never drift (see fanout.rs).

use parlor_common::protocol::ws::ServerEvent;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Session {
    pub conn_id: Uuid,
    pub identity: String,
    pub display_name: String,
    pub authenticated: bool,
    pub joined_rooms: HashSet<Uuid>,
    outbound: Option<mpsc::UnboundedSender<ServerEvent>>,
}

#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<Uuid, Session>>>,
}

impl SessionRegistry {
    /// Register a new connection with an empty joined-room set.
    ///
    /// Overwrites any stale session under the same connection id.
    pub async fn add_connection(
        &self,
        conn_id: Uuid,
        identity: &str,
        display_name: &str,
        authenticated: bool,
    ) {
        let mut guard = self.sessions.write().await;
        guard.insert(
            conn_id,
            Session {
                conn_id,
                identity: identity.to_string(),
                display_name: display_name.to_string(),
                authenticated,
                joined_rooms: HashSet::new(),
                outbound: None,
            },
        );
    }

    /// Attach the outbound delivery channel drained by the socket task.
    pub async fn register_outbound(
        &self,
        conn_id: Uuid,
        sender: mpsc::UnboundedSender<ServerEvent>,
    ) -> bool {
        let mut guard = self.sessions.write().await;
        match guard.get_mut(&conn_id) {
            Some(session) => {
                session.outbound = Some(sender);
                true
            }
            None => false,
        }
    }

    /// Delete and return the session. Leaves the Room Membership Index
    /// untouched; the disconnect sequence owns that cleanup.
    pub async fn remove_connection(&self, conn_id: Uuid) -> Option<Session> {
        self.sessions.write().await.remove(&conn_id)
    }

    /// Snapshot of a session, if the connection is still live.
    pub async fn get(&self, conn_id: Uuid) -> Option<Session> {
        self.sessions.read().await.get(&conn_id).cloned()
    }

    /// Record a room in the session's joined set. Returns false when the
    /// connection is gone (disconnect raced the join).
    pub async fn join_room(&self, conn_id: Uuid, room_id: Uuid) -> bool {
        let mut guard = self.sessions.write().await;
        match guard.get_mut(&conn_id) {
            Some(session) => {
                session.joined_rooms.insert(room_id);
                true
            }
            None => false,
        }
    }

    /// Drop a room from the session's joined set. Returns true only when
    /// the session existed and actually listed the room.
    pub async fn leave_room(&self, conn_id: Uuid, room_id: Uuid) -> bool {
        let mut guard = self.sessions.write().await;
        match guard.get_mut(&conn_id) {
            Some(session) => session.joined_rooms.remove(&room_id),
            None => false,
        }
    }

    /// Deliver an event to one connection. Returns false when the
    /// connection is gone or its socket task already hung up.
    pub async fn send_to_connection(&self, conn_id: Uuid, event: ServerEvent) -> bool {
        let sender = {
            let guard = self.sessions.read().await;
            guard.get(&conn_id).and_then(|session| session.outbound.clone())
        };
        match sender {
            Some(sender) => sender.send(event).is_ok(),
            None => false,
        }
    }

    /// Outbound senders for every local connection subscribed to a room,
    /// optionally excluding one connection. Collected under the read lock,
    /// used after release.
    pub async fn senders_for_room(
        &self,
        room_id: Uuid,
        exclude: Option<Uuid>,
    ) -> Vec<(Uuid, mpsc::UnboundedSender<ServerEvent>)> {
        let guard = self.sessions.read().await;
        guard
            .values()
            .filter(|session| Some(session.conn_id) != exclude)
            .filter(|session| session.joined_rooms.contains(&room_id))
            .filter_map(|session| {
                session.outbound.clone().map(|sender| (session.conn_id, sender))
            })
            .collect()
    }

    /// Outbound senders for every local connection bound to an identity.
    pub async fn senders_for_identity(
        &self,
        identity: &str,
    ) -> Vec<(Uuid, mpsc::UnboundedSender<ServerEvent>)> {
        let guard = self.sessions.read().await;
        guard
            .values()
            .filter(|session| session.identity == identity)
            .filter_map(|session| {
                session.outbound.clone().map(|sender| (session.conn_id, sender))
            })
            .collect()
    }

    /// Whether any local connection is bound to this identity.
    pub async fn identity_is_local(&self, identity: &str) -> bool {
        self.sessions.read().await.values().any(|session| session.identity == identity)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::SessionRegistry;
    use parlor_common::protocol::ws::ServerEvent;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn conn_1() -> Uuid {
        Uuid::parse_str("00000000-0000-0000-0000-000000000011").unwrap()
    }

    fn conn_2() -> Uuid {
        Uuid::parse_str("00000000-0000-0000-0000-000000000012").unwrap()
    }

    fn room_a() -> Uuid {
        Uuid::parse_str("00000000-0000-0000-0000-00000000000a").unwrap()
    }

    #[tokio::test]
    async fn add_and_get_round_trip() {
        let registry = SessionRegistry::default();
        registry.add_connection(conn_1(), "u1", "joe", true).await;

        let session = registry.get(conn_1()).await.expect("session should exist");
        assert_eq!(session.identity, "u1");
        assert_eq!(session.display_name, "joe");
        assert!(session.authenticated);
        assert!(session.joined_rooms.is_empty());
    }

    #[tokio::test]
    async fn add_overwrites_stale_session() {
        let registry = SessionRegistry::default();
        registry.add_connection(conn_1(), "u1", "joe", true).await;
        registry.join_room(conn_1(), room_a()).await;
        registry.add_connection(conn_1(), "u2", "amy", false).await;

        let session = registry.get(conn_1()).await.expect("session should exist");
        assert_eq!(session.identity, "u2");
        assert!(session.joined_rooms.is_empty());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn remove_returns_session_with_joined_rooms() {
        let registry = SessionRegistry::default();
        registry.add_connection(conn_1(), "u1", "joe", true).await;
        registry.join_room(conn_1(), room_a()).await;

        let removed = registry.remove_connection(conn_1()).await.expect("session should exist");
        assert!(removed.joined_rooms.contains(&room_a()));
        assert!(registry.get(conn_1()).await.is_none());
        assert!(registry.remove_connection(conn_1()).await.is_none());
    }

    #[tokio::test]
    async fn join_and_leave_mutate_session_set_only() {
        let registry = SessionRegistry::default();
        registry.add_connection(conn_1(), "u1", "joe", true).await;

        assert!(registry.join_room(conn_1(), room_a()).await);
        assert!(registry.leave_room(conn_1(), room_a()).await);
        // Leaving twice reports that nothing was removed.
        assert!(!registry.leave_room(conn_1(), room_a()).await);
        // Unknown connection.
        assert!(!registry.join_room(conn_2(), room_a()).await);
    }

    #[tokio::test]
    async fn send_to_connection_uses_registered_outbound() {
        let registry = SessionRegistry::default();
        registry.add_connection(conn_1(), "u1", "joe", true).await;

        // No outbound yet.
        assert!(
            !registry
                .send_to_connection(conn_1(), ServerEvent::Reconnected { rooms: vec![] })
                .await
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        assert!(registry.register_outbound(conn_1(), tx).await);
        assert!(
            registry
                .send_to_connection(conn_1(), ServerEvent::Reconnected { rooms: vec![] })
                .await
        );
        assert_eq!(rx.recv().await, Some(ServerEvent::Reconnected { rooms: vec![] }));
    }

    #[tokio::test]
    async fn room_senders_respect_membership_and_exclusion() {
        let registry = SessionRegistry::default();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        registry.add_connection(conn_1(), "u1", "joe", true).await;
        registry.add_connection(conn_2(), "u2", "amy", true).await;
        registry.register_outbound(conn_1(), tx1).await;
        registry.register_outbound(conn_2(), tx2).await;
        registry.join_room(conn_1(), room_a()).await;
        registry.join_room(conn_2(), room_a()).await;

        assert_eq!(registry.senders_for_room(room_a(), None).await.len(), 2);
        let excluding = registry.senders_for_room(room_a(), Some(conn_1())).await;
        assert_eq!(excluding.len(), 1);
        assert_eq!(excluding[0].0, conn_2());
    }

    #[tokio::test]
    async fn identity_senders_cover_all_connections_of_identity() {
        let registry = SessionRegistry::default();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        registry.add_connection(conn_1(), "u1", "joe", true).await;
        registry.add_connection(conn_2(), "u1", "joe", true).await;
        registry.register_outbound(conn_1(), tx1).await;
        registry.register_outbound(conn_2(), tx2).await;

        assert_eq!(registry.senders_for_identity("u1").await.len(), 2);
        assert!(registry.identity_is_local("u1").await);
        assert!(!registry.identity_is_local("u2").await);
    }
}
