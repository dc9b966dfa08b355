// Redis transport for the backplane: one PUBLISH connection and one
// SUBSCRIBE connection per instance, driven by a single task that
// reconnects with exponential backoff until told to shut down.

use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

use super::{BackplaneMessage, BACKPLANE_CHANNEL};

pub(super) enum RedisCommand {
    Publish(String),
    Shutdown,
}

enum RunOutcome {
    Shutdown,
    Error(String),
}

struct Backoff {
    delay: Duration,
}

impl Backoff {
    const INITIAL: Duration = Duration::from_millis(500);
    const MAX: Duration = Duration::from_secs(30);

    fn new() -> Self {
        Self { delay: Self::INITIAL }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.delay;
        self.delay = (self.delay * 2).min(Self::MAX);
        delay
    }

    fn reset(&mut self) {
        self.delay = Self::INITIAL;
    }
}

/// Spawn the connection task. Returns the command channel used for
/// publishing and shutdown.
pub(super) fn spawn(
    url: String,
    incoming: broadcast::Sender<BackplaneMessage>,
) -> mpsc::UnboundedSender<RedisCommand> {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    tokio::spawn(connection_loop(url, incoming, cmd_rx));
    cmd_tx
}

async fn connection_loop(
    url: String,
    incoming: broadcast::Sender<BackplaneMessage>,
    mut cmd_rx: mpsc::UnboundedReceiver<RedisCommand>,
) {
    let mut backoff = Backoff::new();

    loop {
        match connect_and_run(&url, &incoming, &mut cmd_rx, &mut backoff).await {
            RunOutcome::Shutdown => {
                info!("redis backplane shutting down");
                return;
            }
            RunOutcome::Error(reason) => {
                let delay = backoff.next_delay();
                warn!(%reason, delay_ms = delay.as_millis() as u64, "redis backplane connection lost, reconnecting");
                if drain_during_backoff(&mut cmd_rx, delay).await {
                    info!("redis backplane shutting down during backoff");
                    return;
                }
            }
        }
    }
}

async fn connect_and_run(
    url: &str,
    incoming: &broadcast::Sender<BackplaneMessage>,
    cmd_rx: &mut mpsc::UnboundedReceiver<RedisCommand>,
    backoff: &mut Backoff,
) -> RunOutcome {
    let client = match redis::Client::open(url) {
        Ok(client) => client,
        Err(error) => return RunOutcome::Error(format!("failed to open redis client: {error}")),
    };

    let mut publish_conn = match client.get_multiplexed_tokio_connection().await {
        Ok(conn) => conn,
        Err(error) => {
            return RunOutcome::Error(format!("failed to open redis publish connection: {error}"))
        }
    };

    let mut pubsub = match client.get_async_pubsub().await {
        Ok(pubsub) => pubsub,
        Err(error) => {
            return RunOutcome::Error(format!("failed to open redis pubsub connection: {error}"))
        }
    };

    if let Err(error) = pubsub.subscribe(BACKPLANE_CHANNEL).await {
        return RunOutcome::Error(format!("failed to subscribe {BACKPLANE_CHANNEL}: {error}"));
    }

    backoff.reset();
    info!(channel = BACKPLANE_CHANNEL, "redis backplane connected");

    // Publish side: drain the command channel into PUBLISH calls.
    let publish_task = async {
        loop {
            match cmd_rx.recv().await {
                Some(RedisCommand::Publish(payload)) => {
                    let published: Result<i64, _> = redis::cmd("PUBLISH")
                        .arg(BACKPLANE_CHANNEL)
                        .arg(&payload)
                        .query_async(&mut publish_conn)
                        .await;
                    if let Err(error) = published {
                        return RunOutcome::Error(format!("publish failed: {error}"));
                    }
                }
                Some(RedisCommand::Shutdown) | None => return RunOutcome::Shutdown,
            }
        }
    };

    // Subscribe side: decode frames and feed local subscribers.
    let mut messages = pubsub.on_message();
    let subscribe_task = async {
        loop {
            match messages.next().await {
                Some(message) => {
                    let payload: String = match message.get_payload() {
                        Ok(payload) => payload,
                        Err(error) => {
                            warn!(%error, "unreadable backplane frame, skipping");
                            continue;
                        }
                    };
                    match serde_json::from_str::<BackplaneMessage>(&payload) {
                        Ok(decoded) => {
                            let _ = incoming.send(decoded);
                        }
                        Err(error) => {
                            error!(%error, "undecodable backplane frame, skipping");
                        }
                    }
                }
                None => return RunOutcome::Error("subscribe stream ended".to_string()),
            }
        }
    };

    tokio::select! {
        outcome = publish_task => outcome,
        outcome = subscribe_task => outcome,
    }
}

/// Wait out a reconnect delay while still honoring shutdown. Publications
/// arriving while disconnected are dropped (at-most-once delivery).
/// Returns true when shutdown was requested.
async fn drain_during_backoff(
    cmd_rx: &mut mpsc::UnboundedReceiver<RedisCommand>,
    delay: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + delay;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return false,
            command = cmd_rx.recv() => match command {
                Some(RedisCommand::Shutdown) | None => return true,
                Some(RedisCommand::Publish(_)) => {
                    warn!("redis backplane disconnected, dropping publication");
                }
            }
        }
    }
}
