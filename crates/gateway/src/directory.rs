// Identity -> instance directory for backplane-aware direct messages.
//
// Fed by `connect`/`disconnect` backplane announcements from peer
// instances, so any instance can answer "is this identity reachable
// somewhere in the fleet" without scanning its own connection table alone.
// Best-effort and eventually consistent: a stale entry self-heals on the
// peer's next disconnect/reconnect announcement.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct PeerDirectory {
    // identity -> instance id -> live connection count on that instance
    peers: Arc<RwLock<HashMap<String, HashMap<Uuid, u32>>>>,
}

impl PeerDirectory {
    pub async fn note_connect(&self, identity: &str, instance_id: Uuid) {
        let mut guard = self.peers.write().await;
        *guard
            .entry(identity.to_string())
            .or_default()
            .entry(instance_id)
            .or_insert(0) += 1;
    }

    pub async fn note_disconnect(&self, identity: &str, instance_id: Uuid) {
        let mut guard = self.peers.write().await;
        let Some(instances) = guard.get_mut(identity) else {
            return;
        };
        if let Some(count) = instances.get_mut(&instance_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                instances.remove(&instance_id);
            }
        }
        if instances.is_empty() {
            guard.remove(identity);
        }
    }

    /// Whether any instance other than `this_instance` holds a connection
    /// for the identity.
    pub async fn reachable_elsewhere(&self, identity: &str, this_instance: Uuid) -> bool {
        self.peers
            .read()
            .await
            .get(identity)
            .is_some_and(|instances| instances.keys().any(|id| *id != this_instance))
    }

    pub async fn instances_for(&self, identity: &str) -> Vec<Uuid> {
        let mut instances: Vec<Uuid> = self
            .peers
            .read()
            .await
            .get(identity)
            .map(|map| map.keys().copied().collect())
            .unwrap_or_default();
        instances.sort();
        instances
    }
}
