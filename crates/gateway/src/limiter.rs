// Per-conversation rate limiting: a fixed window counter keyed by
// (identity, conversation), where a conversation is a room id or a
// direct-message peer.
//
// The map is touched from every message handler and from the periodic
// sweeper, so check-and-increment runs under one std mutex; nothing awaits
// while holding it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(10);
pub const RATE_LIMIT_MAX_MESSAGES: u32 = 5;
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
struct WindowEntry {
    count: u32,
    reset_at: Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    entries: Mutex<HashMap<(String, String), WindowEntry>>,
    window: Duration,
    limit: u32,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RATE_LIMIT_WINDOW, RATE_LIMIT_MAX_MESSAGES)
    }
}

impl RateLimiter {
    pub fn new(window: Duration, limit: u32) -> Self {
        Self { entries: Mutex::new(HashMap::new()), window, limit }
    }

    /// Whether a message in this conversation is allowed right now.
    ///
    /// A fresh or expired window restarts at count 1. An exhausted window
    /// is not incremented: it stays exhausted until its reset time passes.
    pub fn check(&self, identity: &str, conversation: &str) -> bool {
        self.check_at(identity, conversation, Instant::now())
    }

    pub(crate) fn check_at(&self, identity: &str, conversation: &str, now: Instant) -> bool {
        let key = (identity.to_string(), conversation.to_string());
        let mut entries = self.entries.lock().expect("rate limiter lock poisoned");

        match entries.get_mut(&key) {
            Some(entry) if now <= entry.reset_at => {
                if entry.count >= self.limit {
                    warn!(identity, conversation, "rate limit exceeded");
                    false
                } else {
                    entry.count += 1;
                    true
                }
            }
            _ => {
                entries.insert(key, WindowEntry { count: 1, reset_at: now + self.window });
                true
            }
        }
    }

    /// Drop every window whose reset time has passed.
    pub fn sweep(&self) {
        self.sweep_at(Instant::now());
    }

    pub(crate) fn sweep_at(&self, now: Instant) {
        let mut entries = self.entries.lock().expect("rate limiter lock poisoned");
        let before = entries.len();
        entries.retain(|_, entry| now <= entry.reset_at);
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, remaining = entries.len(), "swept expired rate limit windows");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("rate limiter lock poisoned").len()
    }
}

/// Handle to the background sweeper; dropping it without `stop` leaves the
/// task running until the runtime shuts down.
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

/// Spawn the periodic sweep owned by the process lifecycle.
pub fn spawn_sweeper(limiter: Arc<RateLimiter>, period: Duration) -> SweeperHandle {
    let (shutdown, mut stopped) = watch::channel(false);
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.reset(); // skip the immediate first tick
        loop {
            tokio::select! {
                _ = ticker.tick() => limiter.sweep(),
                _ = stopped.changed() => {
                    info!("rate limit sweeper stopping");
                    break;
                }
            }
        }
    });
    SweeperHandle { shutdown, task }
}
