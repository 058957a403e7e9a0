//! TTL janitor.
//!
//! Once a minute, walks every user's expiry schedule and removes
//! notifications whose 15-minute TTL elapsed: payload blob, stream entry
//! and schedule entry go together. Batches are bounded per user to keep
//! individual store calls predictable.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::metrics::Metrics;
use crate::repository::NotificationStore;
use crate::shutdown::ShutdownSignal;

use super::USER_THROTTLE;

const TICK: Duration = Duration::from_secs(60);

/// Per-user batch limit for one sweep
const CLEANUP_LIMIT: usize = 100;

pub struct TtlJanitor {
    store: Arc<dyn NotificationStore>,
    metrics: Arc<Metrics>,
}

impl TtlJanitor {
    pub fn new(store: Arc<dyn NotificationStore>, metrics: Arc<Metrics>) -> Self {
        Self { store, metrics }
    }

    pub async fn run(self, shutdown: ShutdownSignal) {
        let mut stop = shutdown.subscribe();
        let mut ticker = tokio::time::interval(TICK);
        // The first tick completes immediately; skip it
        ticker.tick().await;

        info!("TTL janitor started");

        loop {
            tokio::select! {
                _ = stop.recv() => {
                    info!("TTL janitor stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if self.sweep(&mut stop).await {
                        info!("TTL janitor stopped");
                        return;
                    }
                }
            }
        }
    }

    /// One full pass over all users. Returns `true` when shutdown was
    /// observed mid-sweep.
    async fn sweep(&self, stop: &mut broadcast::Receiver<()>) -> bool {
        let start = Instant::now();

        let users = match self.store.list_users().await {
            Ok(users) => users,
            Err(e) => {
                error!(error = %e, "Failed to list users for TTL sweep");
                return false;
            }
        };

        if users.is_empty() {
            debug!("No users to sweep");
            return false;
        }

        let mut total_cleaned: u64 = 0;
        let mut processed_users: usize = 0;

        for user in &users {
            match self.store.cleanup_expired(user, CLEANUP_LIMIT).await {
                Ok(cleaned) => {
                    if cleaned > 0 {
                        debug!(
                            user_id = user.id,
                            login = %user.login,
                            count = cleaned,
                            "Cleaned expired notifications"
                        );
                    }
                    total_cleaned += cleaned;
                    processed_users += 1;
                }
                Err(e) => {
                    error!(
                        error = %e,
                        user_id = user.id,
                        login = %user.login,
                        "Failed to clean expired notifications"
                    );
                    continue;
                }
            }

            tokio::select! {
                _ = stop.recv() => return true,
                _ = tokio::time::sleep(USER_THROTTLE) => {}
            }
        }

        self.metrics.record_ttl_cleaned(total_cleaned);

        let duration = start.elapsed();
        if total_cleaned > 0 || users.len() > 10 {
            info!(
                total_cleaned,
                processed_users,
                total_users = users.len(),
                ?duration,
                "Expired notification sweep complete"
            );
        } else {
            debug!(
                total_cleaned,
                processed_users,
                total_users = users.len(),
                ?duration,
                "Expired notification sweep complete"
            );
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
    async fn test_sweep_cleans_all_users() {
        let store = Arc::new(MemoryStore::new());
        let alice = Target::new(1, "alice");
        let bob = Target::new(2, "bob");
        store.set_users(vec![alice.clone(), bob.clone()]);
        store.script_cleanup(&alice, vec![3]);
        store.script_cleanup(&bob, vec![2]);

        let metrics = Arc::new(Metrics::new());
        let janitor = TtlJanitor::new(store.clone(), metrics.clone());
        let mut stop = ShutdownSignal::new().subscribe();

        assert!(!janitor.sweep(&mut stop).await);

        assert_eq!(metrics.ttl_cleaned(), 5);
        let calls = store.cleanup_calls();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|(_, limit)| *limit == CLEANUP_LIMIT));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_sweep_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let alice = Target::new(1, "alice");
        store.set_users(vec![alice.clone()]);
        store.script_cleanup(&alice, vec![4]);

        let metrics = Arc::new(Metrics::new());
        let janitor = TtlJanitor::new(store, metrics.clone());
        let mut stop = ShutdownSignal::new().subscribe();

        janitor.sweep(&mut stop).await;
        janitor.sweep(&mut stop).await;

        // Everything expired was cleaned on the first pass
        assert_eq!(metrics.ttl_cleaned(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_sweep() {
        let store = Arc::new(MemoryStore::new());
        store.set_users(vec![Target::new(1, "alice"), Target::new(2, "bob")]);

        let janitor = TtlJanitor::new(store.clone(), Arc::new(Metrics::new()));
        let shutdown = ShutdownSignal::new();
        let mut stop = shutdown.subscribe();
        shutdown.trigger();

        assert!(janitor.sweep(&mut stop).await);
        // The sweep bailed after the first user
        assert_eq!(store.cleanup_calls().len(), 1);
    }
}
