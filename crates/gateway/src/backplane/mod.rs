// Pub-sub backplane: relays membership changes and fan-out between
// gateway instances so presence and broadcast stay correct across a
// horizontally scaled fleet.
//
// Two transports behind one handle: Redis pub-sub for real deployments,
// and an in-process loopback channel for single-instance mode and tests.
// Delivery is at-most-once; membership is re-derivable from live session
// registries plus join/leave replay, so lost frames self-heal.

mod redis;

use parlor_common::protocol::ws::ServerEvent;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

pub(crate) const BACKPLANE_CHANNEL: &str = "parlor:backplane";

const INCOMING_BUFFER: usize = 1024;

/// The wire unit exchanged between instances. Every message carries its
/// origin instance id; instances ignore their own publications.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BackplaneMessage {
    Join { origin: Uuid, room_id: Uuid, identity: String },
    Leave { origin: Uuid, room_id: Uuid, identity: String },
    Connect { origin: Uuid, identity: String },
    Disconnect { origin: Uuid, identity: String },
    EmitRoom { origin: Uuid, room_id: Uuid, event: ServerEvent },
    EmitIdentity { origin: Uuid, identity: String, event: ServerEvent },
}

impl BackplaneMessage {
    pub fn origin(&self) -> Uuid {
        match self {
            Self::Join { origin, .. }
            | Self::Leave { origin, .. }
            | Self::Connect { origin, .. }
            | Self::Disconnect { origin, .. }
            | Self::EmitRoom { origin, .. }
            | Self::EmitIdentity { origin, .. } => *origin,
        }
    }
}

#[derive(Clone)]
enum Transport {
    Loopback,
    Redis(mpsc::UnboundedSender<redis::RedisCommand>),
}

/// Handle to the backplane. Cheap to clone; all clones share one incoming
/// stream and one outgoing transport.
#[derive(Clone)]
pub struct Backplane {
    transport: Transport,
    incoming: broadcast::Sender<BackplaneMessage>,
}

impl Backplane {
    /// In-process backplane. Instances sharing a clone of this handle see
    /// each other's publications; with a single instance it is a no-op
    /// relay.
    pub fn loopback() -> Self {
        let (incoming, _) = broadcast::channel(INCOMING_BUFFER);
        Self { transport: Transport::Loopback, incoming }
    }

    /// Redis-backed backplane. Spawns a connection task that publishes
    /// outgoing frames and feeds received frames into `subscribe` streams,
    /// reconnecting with backoff until `shutdown`.
    pub fn redis(url: &str) -> Self {
        let (incoming, _) = broadcast::channel(INCOMING_BUFFER);
        let commands = redis::spawn(url.to_string(), incoming.clone());
        Self { transport: Transport::Redis(commands), incoming }
    }

    pub fn publish(&self, message: &BackplaneMessage) {
        match &self.transport {
            Transport::Loopback => {
                // No subscribers means no peer instances; nothing to relay.
                let _ = self.incoming.send(message.clone());
            }
            Transport::Redis(commands) => match serde_json::to_string(message) {
                Ok(payload) => {
                    if commands.send(redis::RedisCommand::Publish(payload)).is_err() {
                        warn!("backplane connection task is gone, dropping publication");
                    }
                }
                Err(error) => {
                    warn!(%error, "failed to encode backplane message");
                }
            },
        }
    }

    /// Stream of messages published by peer instances (and, on redis, this
    /// instance's own echoes - the apply loop filters by origin).
    pub fn subscribe(&self) -> broadcast::Receiver<BackplaneMessage> {
        self.incoming.subscribe()
    }

    pub fn shutdown(&self) {
        if let Transport::Redis(commands) = &self.transport {
            let _ = commands.send(redis::RedisCommand::Shutdown);
        }
        debug!("backplane shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::{Backplane, BackplaneMessage};
    use uuid::Uuid;

    fn origin() -> Uuid {
        Uuid::parse_str("00000000-0000-0000-0000-000000000001").unwrap()
    }

    #[tokio::test]
    async fn loopback_relays_to_subscribers() {
        let backplane = Backplane::loopback();
        let mut receiver = backplane.subscribe();

        let message = BackplaneMessage::Connect { origin: origin(), identity: "u1".to_string() };
        backplane.publish(&message);

        assert_eq!(receiver.recv().await.unwrap(), message);
    }

    #[tokio::test]
    async fn loopback_without_subscribers_is_a_no_op() {
        let backplane = Backplane::loopback();
        backplane.publish(&BackplaneMessage::Connect {
            origin: origin(),
            identity: "u1".to_string(),
        });
    }

    #[test]
    fn every_variant_reports_its_origin() {
        let room = Uuid::new_v4();
        let messages = vec![
            BackplaneMessage::Join { origin: origin(), room_id: room, identity: "u1".into() },
            BackplaneMessage::Leave { origin: origin(), room_id: room, identity: "u1".into() },
            BackplaneMessage::Connect { origin: origin(), identity: "u1".into() },
            BackplaneMessage::Disconnect { origin: origin(), identity: "u1".into() },
        ];
        for message in messages {
            assert_eq!(message.origin(), origin());
        }
    }

    #[test]
    fn wire_format_is_op_tagged_json() {
        let message = BackplaneMessage::Join {
            origin: origin(),
            room_id: Uuid::nil(),
            identity: "u1".to_string(),
        };
        let encoded = serde_json::to_value(&message).unwrap();
        assert_eq!(encoded["op"], "join");
        assert_eq!(encoded["identity"], "u1");

        let decoded: BackplaneMessage = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, message);
    }
}
