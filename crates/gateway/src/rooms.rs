// Room Membership Index: room id -> identities currently present.
//
// Identities, not connection ids - one identity may hold several
// simultaneous connections. Rooms are tracked lazily: an entry appears on
// first join and is deleted once its set empties.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct RoomIndex {
    rooms: Arc<RwLock<HashMap<Uuid, HashSet<String>>>>,
}

impl RoomIndex {
    /// Returns true when the identity was not already present.
    pub async fn add(&self, room_id: Uuid, identity: &str) -> bool {
        let mut guard = self.rooms.write().await;
        guard.entry(room_id).or_default().insert(identity.to_string())
    }

    /// Returns true when the identity was present. Deletes the room entry
    /// entirely once its set becomes empty.
    pub async fn remove(&self, room_id: Uuid, identity: &str) -> bool {
        let mut guard = self.rooms.write().await;
        let Some(members) = guard.get_mut(&room_id) else {
            return false;
        };
        let removed = members.remove(identity);
        if members.is_empty() {
            guard.remove(&room_id);
        }
        removed
    }

    /// Snapshot of a room's members, sorted for deterministic output.
    pub async fn members_of(&self, room_id: Uuid) -> Vec<String> {
        let guard = self.rooms.read().await;
        let mut members: Vec<String> = guard
            .get(&room_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    pub async fn member_count(&self, room_id: Uuid) -> usize {
        self.rooms.read().await.get(&room_id).map(HashSet::len).unwrap_or(0)
    }

    pub async fn contains(&self, room_id: Uuid, identity: &str) -> bool {
        self.rooms
            .read()
            .await
            .get(&room_id)
            .is_some_and(|members| members.contains(identity))
    }

    /// Number of rooms with at least one member.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::RoomIndex;
    use uuid::Uuid;

    fn room_a() -> Uuid {
        Uuid::parse_str("00000000-0000-0000-0000-00000000000a").unwrap()
    }

    fn room_b() -> Uuid {
        Uuid::parse_str("00000000-0000-0000-0000-00000000000b").unwrap()
    }

    #[tokio::test]
    async fn add_and_remove_round_trip() {
        let index = RoomIndex::default();
        assert!(index.add(room_a(), "u1").await);
        assert!(!index.add(room_a(), "u1").await);
        assert!(index.contains(room_a(), "u1").await);

        assert!(index.remove(room_a(), "u1").await);
        assert!(!index.remove(room_a(), "u1").await);
        assert!(!index.contains(room_a(), "u1").await);
    }

    #[tokio::test]
    async fn members_are_sorted() {
        let index = RoomIndex::default();
        index.add(room_a(), "zed").await;
        index.add(room_a(), "amy").await;
        index.add(room_a(), "joe").await;

        assert_eq!(index.members_of(room_a()).await, vec!["amy", "joe", "zed"]);
    }

    #[tokio::test]
    async fn empty_rooms_are_pruned() {
        let index = RoomIndex::default();
        index.add(room_a(), "u1").await;
        index.add(room_b(), "u1").await;
        assert_eq!(index.room_count().await, 2);

        index.remove(room_a(), "u1").await;
        assert_eq!(index.room_count().await, 1);
        assert!(index.members_of(room_a()).await.is_empty());
        assert_eq!(index.member_count(room_b()).await, 1);
    }

    #[tokio::test]
    async fn removing_from_unknown_room_is_a_no_op() {
        let index = RoomIndex::default();
        assert!(!index.remove(room_a(), "u1").await);
        assert_eq!(index.room_count().await, 0);
    }
}
