//! Token Registry
//!
//! In-memory record of issued credentials (identity -> expiry), pruned by a
//! periodic sweep. Tokens are never validated against this table; it exists
//! for reporting and cleanup.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

/// Identity -> expiry table.
#[derive(Default)]
pub struct TokenRegistry {
    tokens: Mutex<BTreeMap<String, DateTime<Utc>>>,
}

impl TokenRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the expiry for `identity`.
    pub async fn put(&self, identity: &str, expiry: DateTime<Utc>) {
        self.tokens.lock().await.insert(identity.to_string(), expiry);
    }

    /// Point-in-time copy of the table.
    pub async fn all(&self) -> BTreeMap<String, DateTime<Utc>> {
        self.tokens.lock().await.clone()
    }

    /// Number of tracked identities.
    pub async fn len(&self) -> usize {
        self.tokens.lock().await.len()
    }

    /// Whether nothing is tracked.
    pub async fn is_empty(&self) -> bool {
        self.tokens.lock().await.is_empty()
    }

    /// Remove every entry expiring at or before `now`. Returns how many went.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let mut tokens = self.tokens.lock().await;
        let before = tokens.len();
        tokens.retain(|_, expiry| *expiry > now);
        before - tokens.len()
    }

    /// Sweep against the wall clock.
    pub async fn sweep(&self) -> usize {
        self.sweep_expired(Utc::now()).await
    }

    /// Start sweeping every `period`. The first sweep runs one period from now.
    ///
    /// `period` must be non-zero.
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> SweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let registry = self.clone();

        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = registry.sweep().await;
                        if removed > 0 {
                            info!("Token sweep removed {} expired entries", removed);
                        } else {
                            debug!("Token sweep found nothing to remove");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("Token sweeper stopping");
                        break;
                    }
                }
            }
        });

        SweeperHandle { shutdown_tx, task }
    }
}

/// Running sweep task.
pub struct SweeperHandle {
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Signal the sweeper and wait for it to exit.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.task.await {
            if e.is_panic() {
                error!("Token sweeper panicked: {}", e);
            }
        }
    }

    /// Whether the task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
