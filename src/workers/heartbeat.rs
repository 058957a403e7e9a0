//! Pod heartbeat.
//!
//! Every 30 seconds this pod writes its own timestamp into the shared
//! heartbeat hash and evicts entries older than 90 seconds (or entries that
//! fail to parse). Whatever directs inbox writes consumes the resulting
//! membership view.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use deadpool_redis::redis::cmd;
use deadpool_redis::Pool;
use tracing::{debug, info, warn};

use crate::shutdown::ShutdownSignal;

const TICK: Duration = Duration::from_secs(30);

/// Entries older than this are considered dead
const STALE_AFTER: Duration = Duration::from_secs(90);

const PODS_HEARTBEAT_KEY: &str = "notif:pods:hb";

pub struct HeartbeatWorker {
    pool: Pool,
    pod_id: String,
}

impl HeartbeatWorker {
    pub fn new(pool: Pool, pod_id: String) -> Self {
        Self { pool, pod_id }
    }

    pub async fn run(self, shutdown: ShutdownSignal) {
        let mut stop = shutdown.subscribe();
        let mut ticker = tokio::time::interval(TICK);
        ticker.tick().await;

        info!(pod = %self.pod_id, "Heartbeat worker started");

        loop {
            tokio::select! {
                _ = stop.recv() => {
                    info!("Heartbeat worker stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.beat().await;
                    self.cleanup_stale().await;
                }
            }
        }
    }

    async fn beat(&self) {
        let now = Utc::now().timestamp();

        let mut conn = match self.pool.get().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "Failed to get connection for heartbeat");
                return;
            }
        };

        let result: Result<(), _> = cmd("HSET")
            .arg(PODS_HEARTBEAT_KEY)
            .arg(&self.pod_id)
            .arg(now)
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => debug!(pod = %self.pod_id, ts = now, "Heartbeat"),
            Err(e) => warn!(error = %e, "Failed to write heartbeat"),
        }
    }

    async fn cleanup_stale(&self) {
        let mut conn = match self.pool.get().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "Failed to get connection for heartbeat sweep");
                return;
            }
        };

        let entries: HashMap<String, String> = match cmd("HGETALL")
            .arg(PODS_HEARTBEAT_KEY)
            .query_async(&mut conn)
            .await
        {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "Failed to read heartbeat registry");
                return;
            }
        };

        if entries.is_empty() {
            return;
        }

        let cutoff = Utc::now().timestamp() - STALE_AFTER.as_secs() as i64;
        let stale = stale_pods(&entries, cutoff);
        if stale.is_empty() {
            return;
        }

        let result: Result<(), _> = cmd("HDEL")
            .arg(PODS_HEARTBEAT_KEY)
            .arg(&stale)
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => info!(count = stale.len(), "Evicted stale pod heartbeats"),
            Err(e) => warn!(error = %e, pods = ?stale, "Failed to evict stale pods"),
        }
    }
}

/// Pods whose timestamp is older than `cutoff` or unparseable.
fn stale_pods(entries: &HashMap<String, String>, cutoff: i64) -> Vec<String> {
    entries
        .iter()
        .filter(|(_, ts)| match ts.parse::<i64>() {
            Ok(ts) => ts < cutoff,
            Err(_) => true,
        })
        .map(|(pod, _)| pod.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_pods_by_age() {
        let mut entries = HashMap::new();
        entries.insert("pod-live".to_string(), "1000".to_string());
        entries.insert("pod-dead".to_string(), "800".to_string());

        let stale = stale_pods(&entries, 900);
        assert_eq!(stale, vec!["pod-dead".to_string()]);
    }

    #[test]
    fn test_unparseable_entries_are_stale() {
        let mut entries = HashMap::new();
        entries.insert("pod-bad".to_string(), "not-a-number".to_string());

        let stale = stale_pods(&entries, 0);
        assert_eq!(stale, vec!["pod-bad".to_string()]);
    }

    #[test]
    fn test_no_stale_pods() {
        let mut entries = HashMap::new();
        entries.insert("pod-a".to_string(), "1000".to_string());

        assert!(stale_pods(&entries, 1000).is_empty());
        assert!(!stale_pods(&entries, 1001).is_empty());
    }
}
