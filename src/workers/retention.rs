//! Retention trimmer.
//!
//! Once a minute, trims each user's stream to their retention window via a
//! minimum-id trim. Payload blobs are untouched (their own TTL handles
//! them), and so is the read-state hash.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::repository::NotificationStore;
use crate::shutdown::ShutdownSignal;

use super::USER_THROTTLE;

const TICK: Duration = Duration::from_secs(60);

pub struct RetentionTrimmer {
    store: Arc<dyn NotificationStore>,
}

impl RetentionTrimmer {
    pub fn new(store: Arc<dyn NotificationStore>) -> Self {
        Self { store }
    }

    pub async fn run(self, shutdown: ShutdownSignal) {
        let mut stop = shutdown.subscribe();
        let mut ticker = tokio::time::interval(TICK);
        ticker.tick().await;

        info!("Retention trimmer started");

        loop {
            tokio::select! {
                _ = stop.recv() => {
                    info!("Retention trimmer stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if self.sweep(&mut stop).await {
                        info!("Retention trimmer stopped");
                        return;
                    }
                }
            }
        }
    }

    async fn sweep(&self, stop: &mut broadcast::Receiver<()>) -> bool {
        let users = match self.store.list_users().await {
            Ok(users) => users,
            Err(e) => {
                error!(error = %e, "Failed to list users for retention trim");
                return false;
            }
        };

        let mut total_trimmed: u64 = 0;

        for user in &users {
            match self.store.trim_by_retention(user).await {
                Ok(trimmed) => total_trimmed += trimmed,
                Err(e) => {
                    warn!(
                        error = %e,
                        user_id = user.id,
                        login = %user.login,
                        "Failed to trim stream by retention"
                    );
                }
            }

            tokio::select! {
                _ = stop.recv() => return true,
                _ = tokio::time::sleep(USER_THROTTLE) => {}
            }
        }

        if total_trimmed > 0 {
            info!(total_trimmed, total_users = users.len(), "Retention trim complete");
        } else {
            debug!(total_users = users.len(), "Retention trim complete");
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::Target;
    use crate::testsupport::MemoryStore;

    #[tokio::test(start_paused = true)]
    async fn test_sweep_trims_every_user() {
        let store = Arc::new(MemoryStore::new());
        store.set_users(vec![Target::new(1, "alice"), Target::new(2, "bob")]);

        let trimmer = RetentionTrimmer::new(store.clone());
        let mut stop = ShutdownSignal::new().subscribe();

        assert!(!trimmer.sweep(&mut stop).await);
        assert_eq!(
            store.trim_calls(),
            vec!["1-alice".to_string(), "2-bob".to_string()]
        );
    }
}
