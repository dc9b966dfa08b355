// Reconnection recovery: rejoin a returning identity to the rooms the
// user store remembers for it.
//
// Every rejoin goes through the fan-out engine's joint join, the same
// path an explicit joinRoom takes, so a reconnection racing a concurrent
// join cannot split the session set from the membership index.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::fanout::FanoutEngine;
use crate::stores::{RoomStore, StoreError, UserStore};

pub struct ReconnectionCoordinator {
    fanout: Arc<FanoutEngine>,
    users: UserStore,
    rooms: RoomStore,
}

impl ReconnectionCoordinator {
    pub fn new(fanout: Arc<FanoutEngine>, users: UserStore, rooms: RoomStore) -> Self {
        Self { fanout, users, rooms }
    }

    /// Rejoin the identity's persisted rooms on a fresh connection.
    ///
    /// Unknown or deleted identities yield an empty list, not an error.
    /// Rooms the room store no longer knows are skipped. Returns the rooms
    /// actually rejoined, in the persisted order, without duplicates.
    pub async fn restore(
        &self,
        identity: &str,
        conn_id: Uuid,
    ) -> Result<Vec<Uuid>, StoreError> {
        let Some(profile) = self.users.find_identity(identity).await? else {
            return Ok(Vec::new());
        };

        let mut rejoined = Vec::new();
        let mut seen = HashSet::new();
        for room_id in profile.previous_rooms {
            if !seen.insert(room_id) {
                continue;
            }
            match self.rooms.exists(room_id).await {
                Ok(true) => {}
                Ok(false) => {
                    info!(%room_id, identity, "skipping vanished room during reconnection");
                    continue;
                }
                Err(error) => {
                    warn!(%room_id, identity, %error, "room lookup failed during reconnection, skipping");
                    continue;
                }
            }
            if !self.fanout.join_room(conn_id, identity, room_id).await {
                // The connection dropped mid-restore; later rooms would
                // fail the same way.
                break;
            }
            rejoined.push(room_id);
        }

        if !rejoined.is_empty() {
            info!(identity, count = rejoined.len(), "restored room memberships on reconnect");
        }
        Ok(rejoined)
    }
}

#[cfg(test)]
mod tests {
    use super::ReconnectionCoordinator;
    use crate::backplane::Backplane;
    use crate::directory::PeerDirectory;
    use crate::fanout::FanoutEngine;
    use crate::rooms::RoomIndex;
    use crate::session::SessionRegistry;
    use crate::stores::{MemoryRoom, MemoryUser, RoomStore, UserStore};
    use std::sync::Arc;
    use uuid::Uuid;

    struct Fixture {
        registry: SessionRegistry,
        rooms_index: RoomIndex,
        users: UserStore,
        rooms: RoomStore,
        coordinator: ReconnectionCoordinator,
    }

    fn fixture() -> Fixture {
        let registry = SessionRegistry::default();
        let rooms_index = RoomIndex::default();
        let fanout = Arc::new(FanoutEngine::new(
            Uuid::new_v4(),
            registry.clone(),
            rooms_index.clone(),
            PeerDirectory::default(),
            Backplane::loopback(),
        ));
        let users = UserStore::memory();
        let rooms = RoomStore::memory();
        let coordinator =
            ReconnectionCoordinator::new(fanout, users.clone(), rooms.clone());
        Fixture { registry, rooms_index, users, rooms, coordinator }
    }

    async fn seed_user(fixture: &Fixture, identity: &str, previous_rooms: Vec<Uuid>) {
        fixture
            .users
            .seed_user(
                identity,
                MemoryUser {
                    display_name: identity.to_string(),
                    previous_rooms,
                    is_online: false,
                },
            )
            .await;
    }

    #[tokio::test]
    async fn unknown_identity_restores_nothing() {
        let fixture = fixture();
        let conn = Uuid::new_v4();
        fixture.registry.add_connection(conn, "ghost", "ghost", true).await;

        let rejoined = fixture.coordinator.restore("ghost", conn).await.unwrap();
        assert!(rejoined.is_empty());
    }

    #[tokio::test]
    async fn restores_exactly_the_persisted_rooms_in_order() {
        let fixture = fixture();
        let room_1 = Uuid::new_v4();
        let room_2 = Uuid::new_v4();
        fixture.rooms.seed_room(room_1, MemoryRoom::open("one")).await;
        fixture.rooms.seed_room(room_2, MemoryRoom::open("two")).await;
        seed_user(&fixture, "u1", vec![room_1, room_2]).await;

        let conn = Uuid::new_v4();
        fixture.registry.add_connection(conn, "u1", "joe", true).await;

        let rejoined = fixture.coordinator.restore("u1", conn).await.unwrap();
        assert_eq!(rejoined, vec![room_1, room_2]);

        let session = fixture.registry.get(conn).await.unwrap();
        assert!(session.joined_rooms.contains(&room_1));
        assert!(session.joined_rooms.contains(&room_2));
        assert_eq!(fixture.rooms_index.members_of(room_1).await, vec!["u1"]);
        assert_eq!(fixture.rooms_index.members_of(room_2).await, vec!["u1"]);
    }

    #[tokio::test]
    async fn vanished_rooms_are_skipped_not_errors() {
        let fixture = fixture();
        let live = Uuid::new_v4();
        let vanished = Uuid::new_v4();
        fixture.rooms.seed_room(live, MemoryRoom::open("live")).await;
        seed_user(&fixture, "u1", vec![vanished, live]).await;

        let conn = Uuid::new_v4();
        fixture.registry.add_connection(conn, "u1", "joe", true).await;

        let rejoined = fixture.coordinator.restore("u1", conn).await.unwrap();
        assert_eq!(rejoined, vec![live]);
        assert!(fixture.rooms_index.members_of(vanished).await.is_empty());
    }

    #[tokio::test]
    async fn duplicate_persisted_rooms_rejoin_once() {
        let fixture = fixture();
        let room = Uuid::new_v4();
        fixture.rooms.seed_room(room, MemoryRoom::open("dup")).await;
        seed_user(&fixture, "u1", vec![room, room, room]).await;

        let conn = Uuid::new_v4();
        fixture.registry.add_connection(conn, "u1", "joe", true).await;

        let rejoined = fixture.coordinator.restore("u1", conn).await.unwrap();
        assert_eq!(rejoined, vec![room]);
    }

    #[tokio::test]
    async fn restore_stops_when_the_connection_is_gone() {
        let fixture = fixture();
        let room = Uuid::new_v4();
        fixture.rooms.seed_room(room, MemoryRoom::open("gone")).await;
        seed_user(&fixture, "u1", vec![room]).await;

        // Never registered: the connection disconnected before restore ran.
        let rejoined = fixture.coordinator.restore("u1", Uuid::new_v4()).await.unwrap();
        assert!(rejoined.is_empty());
        assert!(fixture.rooms_index.members_of(room).await.is_empty());
    }
}
