// Broadcast fan-out: delivers events to room members and identities,
// locally over each connection's outbound channel and fleet-wide through
// the backplane.
//
// This is also the joint mutation point for room membership: session set,
// membership index, and backplane announcements always change together
// here, whether the join came from an explicit request or from
// reconnection recovery.

use std::sync::Arc;

use parlor_common::protocol::ws::ServerEvent;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backplane::{Backplane, BackplaneMessage};
use crate::directory::PeerDirectory;
use crate::rooms::RoomIndex;
use crate::session::SessionRegistry;

pub struct FanoutEngine {
    instance_id: Uuid,
    registry: SessionRegistry,
    rooms: RoomIndex,
    directory: PeerDirectory,
    backplane: Backplane,
}

impl FanoutEngine {
    pub fn new(
        instance_id: Uuid,
        registry: SessionRegistry,
        rooms: RoomIndex,
        directory: PeerDirectory,
        backplane: Backplane,
    ) -> Self {
        Self { instance_id, registry, rooms, directory, backplane }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Record a new connection in the fleet directory and tell peers.
    pub async fn announce_connect(&self, identity: &str) {
        self.directory.note_connect(identity, self.instance_id).await;
        self.backplane.publish(&BackplaneMessage::Connect {
            origin: self.instance_id,
            identity: identity.to_string(),
        });
    }

    pub async fn announce_disconnect(&self, identity: &str) {
        self.directory.note_disconnect(identity, self.instance_id).await;
        self.backplane.publish(&BackplaneMessage::Disconnect {
            origin: self.instance_id,
            identity: identity.to_string(),
        });
    }

    /// Joint join: session set, membership index, and the backplane `join`
    /// announcement move together. Returns false (with nothing mutated)
    /// when the connection disappeared underneath the join.
    pub async fn join_room(&self, conn_id: Uuid, identity: &str, room_id: Uuid) -> bool {
        if !self.registry.join_room(conn_id, room_id).await {
            return false;
        }
        self.rooms.add(room_id, identity).await;
        self.backplane.publish(&BackplaneMessage::Join {
            origin: self.instance_id,
            room_id,
            identity: identity.to_string(),
        });
        true
    }

    /// Joint leave for a live connection. Returns false when the session
    /// never listed the room (nothing is mutated or announced).
    pub async fn leave_room(&self, conn_id: Uuid, identity: &str, room_id: Uuid) -> bool {
        if !self.registry.leave_room(conn_id, room_id).await {
            return false;
        }
        self.depart_room(identity, room_id).await;
        true
    }

    /// Index + backplane half of a leave, used directly by the disconnect
    /// sequence after the session record is already gone.
    pub async fn depart_room(&self, identity: &str, room_id: Uuid) {
        self.rooms.remove(room_id, identity).await;
        self.backplane.publish(&BackplaneMessage::Leave {
            origin: self.instance_id,
            room_id,
            identity: identity.to_string(),
        });
    }

    /// Deliver to every connection in the room: local connections exactly
    /// once each, peer instances via the backplane.
    pub async fn broadcast_to_room(
        &self,
        room_id: Uuid,
        event: ServerEvent,
        exclude: Option<Uuid>,
    ) -> usize {
        let delivered = self.deliver_room_local(room_id, &event, exclude).await;
        self.backplane.publish(&BackplaneMessage::EmitRoom {
            origin: self.instance_id,
            room_id,
            event,
        });
        delivered
    }

    /// Deliver to every live connection of an identity, fleet-wide.
    ///
    /// Returns false only when the identity has no connection anywhere we
    /// know of: neither a local session nor a directory entry on a peer.
    pub async fn send_to_identity(&self, identity: &str, event: ServerEvent) -> bool {
        let delivered = self.deliver_identity_local(identity, &event).await;
        self.backplane.publish(&BackplaneMessage::EmitIdentity {
            origin: self.instance_id,
            identity: identity.to_string(),
            event,
        });
        delivered > 0 || self.directory.reachable_elsewhere(identity, self.instance_id).await
    }

    async fn deliver_room_local(
        &self,
        room_id: Uuid,
        event: &ServerEvent,
        exclude: Option<Uuid>,
    ) -> usize {
        let senders = self.registry.senders_for_room(room_id, exclude).await;
        let mut delivered = 0;
        for (_conn_id, sender) in senders {
            if sender.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    async fn deliver_identity_local(&self, identity: &str, event: &ServerEvent) -> usize {
        let senders = self.registry.senders_for_identity(identity).await;
        let mut delivered = 0;
        for (_conn_id, sender) in senders {
            if sender.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Apply a frame published by a peer instance. Frames from this
    /// instance (redis echoes its own publications) are ignored.
    pub async fn apply(&self, message: BackplaneMessage) {
        if message.origin() == self.instance_id {
            return;
        }
        match message {
            BackplaneMessage::Join { room_id, identity, .. } => {
                self.rooms.add(room_id, &identity).await;
            }
            BackplaneMessage::Leave { room_id, identity, .. } => {
                self.rooms.remove(room_id, &identity).await;
            }
            BackplaneMessage::Connect { origin, identity } => {
                self.directory.note_connect(&identity, origin).await;
            }
            BackplaneMessage::Disconnect { origin, identity } => {
                self.directory.note_disconnect(&identity, origin).await;
            }
            BackplaneMessage::EmitRoom { room_id, event, .. } => {
                self.deliver_room_local(room_id, &event, None).await;
            }
            BackplaneMessage::EmitIdentity { identity, event, .. } => {
                self.deliver_identity_local(&identity, &event).await;
            }
        }
    }

    /// Drive `apply` from the backplane's incoming stream until shutdown.
    pub fn spawn_apply_loop(engine: Arc<Self>) -> JoinHandle<()> {
        let mut incoming = engine.backplane.subscribe();
        tokio::spawn(async move {
            loop {
                match incoming.recv().await {
                    Ok(message) => engine.apply(message).await,
                    Err(RecvError::Lagged(skipped)) => {
                        // Membership self-heals from later join/leave replay.
                        warn!(skipped, "backplane apply loop lagged, frames dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("backplane apply loop stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::FanoutEngine;
    use crate::backplane::Backplane;
    use crate::directory::PeerDirectory;
    use crate::rooms::RoomIndex;
    use crate::session::SessionRegistry;
    use parlor_common::protocol::ws::ServerEvent;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    struct Instance {
        engine: Arc<FanoutEngine>,
        registry: SessionRegistry,
        rooms: RoomIndex,
    }

    fn instance(backplane: &Backplane) -> Instance {
        let registry = SessionRegistry::default();
        let rooms = RoomIndex::default();
        let engine = Arc::new(FanoutEngine::new(
            Uuid::new_v4(),
            registry.clone(),
            rooms.clone(),
            PeerDirectory::default(),
            backplane.clone(),
        ));
        FanoutEngine::spawn_apply_loop(Arc::clone(&engine));
        Instance { engine, registry, rooms }
    }

    async fn connect(
        instance: &Instance,
        identity: &str,
    ) -> (Uuid, mpsc::UnboundedReceiver<ServerEvent>) {
        let conn_id = Uuid::new_v4();
        instance.registry.add_connection(conn_id, identity, identity, true).await;
        let (tx, rx) = mpsc::unbounded_channel();
        instance.registry.register_outbound(conn_id, tx).await;
        instance.engine.announce_connect(identity).await;
        (conn_id, rx)
    }

    /// Backplane application is asynchronous even over loopback; tests
    /// poll with this deadline instead of sleeping blindly.
    fn deadline() -> tokio::time::Instant {
        tokio::time::Instant::now() + Duration::from_secs(1)
    }

    macro_rules! wait_until {
        ($condition:expr, $what:literal) => {{
            let deadline = deadline();
            loop {
                if $condition {
                    break;
                }
                assert!(tokio::time::Instant::now() < deadline, $what);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }};
    }

    fn ping() -> ServerEvent {
        ServerEvent::RateLimitExceeded { message: "ping".to_string() }
    }

    #[tokio::test]
    async fn joint_join_and_leave_keep_registry_and_index_consistent() {
        let backplane = Backplane::loopback();
        let a = instance(&backplane);
        let (conn, _rx) = connect(&a, "u1").await;
        let room = Uuid::new_v4();

        assert!(a.engine.join_room(conn, "u1", room).await);
        let session = a.registry.get(conn).await.unwrap();
        assert!(session.joined_rooms.contains(&room));
        assert_eq!(a.rooms.members_of(room).await, vec!["u1"]);

        assert!(a.engine.leave_room(conn, "u1", room).await);
        let session = a.registry.get(conn).await.unwrap();
        assert!(session.joined_rooms.is_empty());
        assert!(a.rooms.members_of(room).await.is_empty());

        // Leaving a room never joined mutates nothing.
        assert!(!a.engine.leave_room(conn, "u1", room).await);
    }

    #[tokio::test]
    async fn join_fails_cleanly_when_connection_is_gone() {
        let backplane = Backplane::loopback();
        let a = instance(&backplane);
        let room = Uuid::new_v4();

        assert!(!a.engine.join_room(Uuid::new_v4(), "ghost", room).await);
        assert!(a.rooms.members_of(room).await.is_empty());
    }

    #[tokio::test]
    async fn local_broadcast_is_exactly_once_per_connection() {
        let backplane = Backplane::loopback();
        let a = instance(&backplane);
        let (conn_1, mut rx_1) = connect(&a, "u1").await;
        let (conn_2, mut rx_2) = connect(&a, "u2").await;
        let room = Uuid::new_v4();
        a.engine.join_room(conn_1, "u1", room).await;
        a.engine.join_room(conn_2, "u2", room).await;

        let delivered = a.engine.broadcast_to_room(room, ping(), None).await;
        assert_eq!(delivered, 2);

        // Give the apply loop a chance to (wrongly) deliver the loopback
        // echo, then check each connection saw the event exactly once.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(rx_1.try_recv().ok(), Some(ping()));
        assert!(rx_1.try_recv().is_err());
        assert_eq!(rx_2.try_recv().ok(), Some(ping()));
        assert!(rx_2.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_exclusion_skips_the_sender() {
        let backplane = Backplane::loopback();
        let a = instance(&backplane);
        let (conn_1, mut rx_1) = connect(&a, "u1").await;
        let (conn_2, mut rx_2) = connect(&a, "u2").await;
        let room = Uuid::new_v4();
        a.engine.join_room(conn_1, "u1", room).await;
        a.engine.join_room(conn_2, "u2", room).await;

        let delivered = a.engine.broadcast_to_room(room, ping(), Some(conn_1)).await;
        assert_eq!(delivered, 1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx_1.try_recv().is_err());
        assert_eq!(rx_2.try_recv().ok(), Some(ping()));
    }

    #[tokio::test]
    async fn peer_instances_learn_membership_and_receive_broadcasts() {
        let backplane = Backplane::loopback();
        let a = instance(&backplane);
        let b = instance(&backplane);
        let room = Uuid::new_v4();

        let (conn_a, mut rx_a) = connect(&a, "u1").await;
        a.engine.join_room(conn_a, "u1", room).await;

        // B's index converges on A's join.
        wait_until!(
            b.rooms.members_of(room).await == vec!["u1".to_string()],
            "peer index should converge on the join"
        );

        let (conn_b, _rx_b) = connect(&b, "u2").await;
        b.engine.join_room(conn_b, "u2", room).await;
        wait_until!(
            a.rooms.member_count(room).await == 2,
            "origin index should converge on the peer join"
        );

        // A broadcast from B reaches A's local connection.
        b.engine.broadcast_to_room(room, ping(), Some(conn_b)).await;
        let received = tokio::time::timeout(Duration::from_secs(1), rx_a.recv())
            .await
            .expect("broadcast should cross the backplane")
            .expect("channel should stay open");
        assert_eq!(received, ping());
    }

    #[tokio::test]
    async fn direct_messages_reach_identities_on_peer_instances() {
        let backplane = Backplane::loopback();
        let a = instance(&backplane);
        let b = instance(&backplane);

        let (_conn_b, mut rx_b) = connect(&b, "u2").await;
        // A learns about u2 through the connect announcement.
        wait_until!(
            a.engine.send_to_identity("u2", ping()).await,
            "directory should converge on the connect announcement"
        );
        let received = tokio::time::timeout(Duration::from_secs(1), rx_b.recv())
            .await
            .expect("direct message should cross the backplane")
            .expect("channel should stay open");
        assert_eq!(received, ping());
    }

    #[tokio::test]
    async fn send_to_unknown_identity_reports_undelivered() {
        let backplane = Backplane::loopback();
        let a = instance(&backplane);
        assert!(!a.engine.send_to_identity("nobody", ping()).await);
    }

    #[tokio::test]
    async fn disconnect_announcements_clear_the_directory() {
        let backplane = Backplane::loopback();
        let a = instance(&backplane);
        let b = instance(&backplane);

        let (_conn_b, _rx_b) = connect(&b, "u2").await;
        wait_until!(
            a.engine.send_to_identity("u2", ping()).await,
            "directory should learn the peer connection"
        );

        b.engine.announce_disconnect("u2").await;
        wait_until!(
            !a.engine.send_to_identity("u2", ping()).await,
            "directory should forget the peer connection"
        );
    }
}
