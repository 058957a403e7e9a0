//! Inter-pod bus router.
//!
//! Each pod owns one inbox stream. When another pod wants to push to a user
//! whose session lives here, it appends a [`BusEnvelope`] to that stream;
//! this router consumes the inbox through its own consumer group and hands
//! the frame to the local connection registry. Entries are acked only on
//! successful local delivery; everything else stays pending and is picked
//! up again by consumer-group reclaim on a later cycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use deadpool_redis::redis::streams::{
    StreamAutoClaimOptions, StreamAutoClaimReply, StreamReadOptions, StreamReadReply,
};
use deadpool_redis::redis::{cmd, AsyncCommands, RedisError, Value as RedisValue};
use deadpool_redis::{Connection, Pool};
use tracing::{debug, error, info, warn};

use crate::metrics::Metrics;
use crate::notification::Target;
use crate::protocol::{BusEnvelope, ServerFrame};
use crate::registry::ConnectionRegistry;
use crate::repository::{bus_stream_key, field_str, is_empty_read};
use crate::shutdown::ShutdownSignal;
use crate::BUS_GROUP;

const READ_BLOCK: Duration = Duration::from_secs(30);
const READ_BATCH: usize = 100;
const ERROR_BACKOFF: Duration = Duration::from_millis(200);

/// Idle age after which an undelivered envelope is claimed back
const RECLAIM_IDLE: Duration = Duration::from_secs(60);

pub struct BusRouter {
    pool: Pool,
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<Metrics>,
    pod_id: String,
}

impl BusRouter {
    pub fn new(
        pool: Pool,
        registry: Arc<ConnectionRegistry>,
        metrics: Arc<Metrics>,
        pod_id: String,
    ) -> Self {
        Self {
            pool,
            registry,
            metrics,
            pod_id,
        }
    }

    pub async fn run(self, shutdown: ShutdownSignal) {
        let stream = bus_stream_key(&self.pod_id);
        let consumer = format!("consumer:{}", self.pod_id);

        if let Err(e) = self.ensure_group(&stream).await {
            warn!(error = %e, stream = %stream, "Failed to create bus consumer group");
        }

        info!(stream = %stream, "Inter-pod router started");

        let mut stop = shutdown.subscribe();
        loop {
            tokio::select! {
                _ = stop.recv() => {
                    info!("Inter-pod router stopped");
                    return;
                }
                _ = self.consume_batch(&stream, &consumer) => {}
            }
        }
    }

    async fn ensure_group(&self, stream: &str) -> Result<(), RedisError> {
        let mut conn = match self.pool.get().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "Failed to get connection for bus group setup");
                return Ok(());
            }
        };

        let result: Result<(), RedisError> = cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(BUS_GROUP)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn consume_batch(&self, stream: &str, consumer: &str) {
        let mut conn = match self.pool.get().await {
            Ok(conn) => conn,
            Err(e) => {
                error!(error = %e, "Failed to get connection for bus read");
                tokio::time::sleep(Duration::from_secs(1)).await;
                return;
            }
        };

        // Envelopes whose local delivery failed on an earlier cycle sit
        // pending; retry them once their idle time passes the threshold.
        self.reclaim_own_pending(&mut conn, stream, consumer).await;

        let opts = StreamReadOptions::default()
            .group(BUS_GROUP, consumer)
            .block(READ_BLOCK.as_millis() as usize)
            .count(READ_BATCH);

        let result: Result<StreamReadReply, RedisError> =
            conn.xread_options(&[stream], &[">"], &opts).await;

        let reply = match result {
            Ok(reply) => reply,
            Err(e) if is_empty_read(&e) => return,
            Err(e) => {
                warn!(error = %e, "Bus stream read failed");
                tokio::time::sleep(ERROR_BACKOFF).await;
                return;
            }
        };

        for stream_key in reply.keys {
            for entry in stream_key.ids {
                self.deliver_entry(&mut conn, stream, &entry.id, &entry.map)
                    .await;
            }
        }
    }

    async fn reclaim_own_pending(&self, conn: &mut Connection, stream: &str, consumer: &str) {
        let opts = StreamAutoClaimOptions::default().count(READ_BATCH);
        let result: Result<StreamAutoClaimReply, RedisError> = conn
            .xautoclaim_options(
                stream,
                BUS_GROUP,
                consumer,
                RECLAIM_IDLE.as_millis() as u64,
                "0-0",
                opts,
            )
            .await;

        match result {
            Ok(reply) => {
                for entry in reply.claimed {
                    self.deliver_entry(conn, stream, &entry.id, &entry.map).await;
                }
            }
            Err(e) => {
                debug!(error = %e, "Bus pending reclaim failed");
            }
        }
    }

    /// Forward one inbox entry to the local session; ack only on delivery.
    async fn deliver_entry(
        &self,
        conn: &mut Connection,
        stream: &str,
        entry_id: &str,
        map: &HashMap<String, RedisValue>,
    ) {
        let Some((target, frame)) = parse_envelope(map) else {
            debug!(id = %entry_id, "Skipping malformed bus envelope");
            return;
        };

        let delivered = self
            .registry
            .send_to_user(target.id, &target.login, frame)
            .await;

        if delivered {
            let ack: Result<i64, RedisError> = conn.xack(stream, BUS_GROUP, &[entry_id]).await;
            if let Err(e) = ack {
                warn!(error = %e, id = %entry_id, "Failed to ack bus entry");
            }
            self.metrics.record_bus_delivered();
        }
        // Undelivered entries remain pending for a later reclaim cycle
    }
}

/// Decode one inbox entry into its target and the frame to forward.
fn parse_envelope(map: &HashMap<String, RedisValue>) -> Option<(Target, ServerFrame)> {
    let raw = field_str(map, "payload")?;
    let envelope: BusEnvelope = serde_json::from_str(&raw).ok()?;
    let target = Target::from_user_key(&envelope.user_key)?;
    let frame: ServerFrame = serde_json::from_value(envelope.data).ok()?;
    Some((target, frame))
}
