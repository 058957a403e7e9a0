//! Consumer-group maintenance.
//!
//! Every two minutes, re-assigns stream entries pending on an idle consumer
//! back to the user's own consumer id. This is the sole mechanism that
//! resurrects messages whose owning session died after delivery but before
//! ack: the reclaimed entries show up on the next pending read of a live
//! session, or on reconnect.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::metrics::Metrics;
use crate::repository::NotificationStore;
use crate::shutdown::ShutdownSignal;

use super::USER_THROTTLE;

const TICK: Duration = Duration::from_secs(120);

/// Entries must sit idle this long before they are taken over
const MIN_IDLE: Duration = Duration::from_secs(60);

const RECLAIM_LIMIT: usize = 100;

pub struct GroupMaintenance {
    store: Arc<dyn NotificationStore>,
    metrics: Arc<Metrics>,
}

impl GroupMaintenance {
    pub fn new(store: Arc<dyn NotificationStore>, metrics: Arc<Metrics>) -> Self {
        Self { store, metrics }
    }

    pub async fn run(self, shutdown: ShutdownSignal) {
        let mut stop = shutdown.subscribe();
        let mut ticker = tokio::time::interval(TICK);
        ticker.tick().await;

        info!("Group maintenance started");

        loop {
            tokio::select! {
                _ = stop.recv() => {
                    info!("Group maintenance stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if self.sweep(&mut stop).await {
                        info!("Group maintenance stopped");
                        return;
                    }
                }
            }
        }
    }

    async fn sweep(&self, stop: &mut broadcast::Receiver<()>) -> bool {
        let start = Instant::now();

        let users = match self.store.list_users().await {
            Ok(users) => users,
            Err(e) => {
                error!(error = %e, "Failed to list users for reclaim");
                return false;
            }
        };

        if users.is_empty() {
            debug!("No users to maintain");
            return false;
        }

        let mut total_reclaimed: u64 = 0;

        for user in &users {
            match self
                .store
                .reclaim_pending(user, MIN_IDLE, RECLAIM_LIMIT)
                .await
            {
                Ok(reclaimed) if !reclaimed.is_empty() => {
                    info!(
                        user_id = user.id,
                        login = %user.login,
                        count = reclaimed.len(),
                        "Reclaimed pending messages"
                    );
                    total_reclaimed += reclaimed.len() as u64;
                }
                Ok(_) => {}
                Err(e) => {
                    error!(
                        error = %e,
                        user_id = user.id,
                        login = %user.login,
                        "Failed to reclaim pending messages"
                    );
                    continue;
                }
            }

            tokio::select! {
                _ = stop.recv() => return true,
                _ = tokio::time::sleep(USER_THROTTLE) => {}
            }
        }

        self.metrics.record_reclaimed(total_reclaimed);

        debug!(
            total_reclaimed,
            total_users = users.len(),
            duration = ?start.elapsed(),
            "Group maintenance sweep complete"
        );

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::{StreamMessage, Target};
    use crate::testsupport::MemoryStore;

    fn envelope(id: &str) -> StreamMessage {
        StreamMessage {
            id: id.to_string(),
            nid: Some(format!("nid-{id}")),
            created_at: None,
            payload: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_counts_reclaimed() {
        let store = Arc::new(MemoryStore::new());
        let alice = Target::new(1, "alice");
        store.set_users(vec![alice.clone()]);
        store.script_reclaim(&alice, vec![envelope("1-0"), envelope("2-0")]);

        let metrics = Arc::new(Metrics::new());
        let maintenance = GroupMaintenance::new(store, metrics.clone());
        let mut stop = ShutdownSignal::new().subscribe();

        assert!(!maintenance.sweep(&mut stop).await);
        assert_eq!(metrics.reclaimed(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_with_nothing_pending() {
        let store = Arc::new(MemoryStore::new());
        store.set_users(vec![Target::new(1, "alice")]);

        let metrics = Arc::new(Metrics::new());
        let maintenance = GroupMaintenance::new(store, metrics.clone());
        let mut stop = ShutdownSignal::new().subscribe();

        maintenance.sweep(&mut stop).await;
        assert_eq!(metrics.reclaimed(), 0);
    }
}
