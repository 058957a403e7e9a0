//! Store adapter for the notification pipeline.
//!
//! [`RedisRepository`] is the single place that knows the key layout. Every
//! state transition (create, pending/new reads, ack, reclaim, expiry sweep,
//! retention trim, locks, idempotency) is expressed here in terms of the
//! Redis primitives: streams, consumer groups, sorted sets, hashes,
//! pipelines. Everything above this module talks to the
//! [`NotificationStore`] trait.
//!
//! # Key layout
//!
//! ```text
//! stream:user:<id>-<login>          per-user stream of {nid, created_at}
//! notification:<nid>                payload blob, 15-minute TTL
//! notif:ttl:<id>-<login>            ZSET "<stream_id>|<nid>" -> unix expiry
//! notification_state:<id>-<login>   hash nid -> "read"
//! notify:req:<token>                idempotency cache, 10-minute TTL
//! notif:lock:consumer:<id>-<login>  consumer lock, 60-second TTL
//! notif:retention:<id>-<login>      retention days, no TTL
//! notif:bus:<pod_id>                per-pod inbox stream
//! ```

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::redis::streams::{
    StreamAutoClaimOptions, StreamAutoClaimReply, StreamReadOptions, StreamReadReply,
};
use deadpool_redis::redis::{cmd, pipe, AsyncCommands, RedisError, Value as RedisValue};
use deadpool_redis::Pool;
use thiserror::Error;
use tracing::{debug, warn};

use crate::notification::{NotificationPayload, NotifyResponse, StreamMessage, Target};
use crate::protocol::BusEnvelope;
use crate::{CONSUMER_GROUP, NOTIFICATION_TTL, STREAM_MAX_LEN};

/// Idempotency cache lifetime
const IDEMPOTENCY_TTL: Duration = Duration::from_secs(10 * 60);

/// Retention window bounds, in days
pub const RETENTION_MIN_DAYS: i64 = 1;
pub const RETENTION_MAX_DAYS: i64 = 15;
pub const RETENTION_DEFAULT_DAYS: i64 = 7;

const STREAM_KEY_PREFIX: &str = "stream:user:";
const NOTIFICATION_KEY_PREFIX: &str = "notification:";
const TTL_SCHEDULE_KEY_PREFIX: &str = "notif:ttl:";
const STATE_KEY_PREFIX: &str = "notification_state:";
const IDEMPOTENCY_KEY_PREFIX: &str = "notify:req:";
const LOCK_KEY_PREFIX: &str = "notif:lock:consumer:";
const RETENTION_KEY_PREFIX: &str = "notif:retention:";
const BUS_KEY_PREFIX: &str = "notif:bus:";

fn stream_key(target: &Target) -> String {
    format!("{}{}", STREAM_KEY_PREFIX, target.user_key())
}

fn notification_key(nid: &str) -> String {
    format!("{NOTIFICATION_KEY_PREFIX}{nid}")
}

fn ttl_schedule_key(target: &Target) -> String {
    format!("{}{}", TTL_SCHEDULE_KEY_PREFIX, target.user_key())
}

fn state_key(target: &Target) -> String {
    format!("{}{}", STATE_KEY_PREFIX, target.user_key())
}

fn idempotency_key(token: &str) -> String {
    format!("{IDEMPOTENCY_KEY_PREFIX}{token}")
}

fn lock_key(target: &Target) -> String {
    format!("{}{}", LOCK_KEY_PREFIX, target.user_key())
}

fn retention_key(target: &Target) -> String {
    format!("{}{}", RETENTION_KEY_PREFIX, target.user_key())
}

/// Inbox stream of the given pod.
pub fn bus_stream_key(pod_id: &str) -> String {
    format!("{BUS_KEY_PREFIX}{pod_id}")
}

/// ZSET member tying a stream entry to its payload: `"<stream_id>|<nid>"`.
fn ttl_entry(stream_id: &str, nid: &str) -> String {
    format!("{stream_id}|{nid}")
}

fn parse_ttl_entry(entry: &str) -> Option<(&str, &str)> {
    entry.split_once('|')
}

/// Errors surfaced by the store adapter.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to get redis connection: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    #[error("redis command failed: {0}")]
    Redis(#[from] RedisError),

    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Capability interface over the notification store.
///
/// The session driver, ingestion service and background workers depend on
/// this trait; [`RedisRepository`] is the production implementation.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Persist a payload and append its envelope to the target's stream.
    /// Returns the new stream entry id.
    async fn create_notification(&self, payload: &NotificationPayload)
        -> Result<String, StoreError>;

    /// Fetch a payload blob. `None` when it expired or never existed.
    async fn get_notification(&self, nid: &str)
        -> Result<Option<NotificationPayload>, StoreError>;

    /// Create the consumer group on the user's stream if it does not exist.
    async fn ensure_consumer_group(&self, target: &Target) -> Result<(), StoreError>;

    /// Read entries already delivered to this consumer but not acked.
    async fn read_pending(
        &self,
        target: &Target,
        count: usize,
    ) -> Result<Vec<StreamMessage>, StoreError>;

    /// Blocking read of entries never delivered to any consumer. Returns
    /// empty on deadline, never blocks past it.
    async fn read_new(
        &self,
        target: &Target,
        block: Duration,
        count: usize,
    ) -> Result<Vec<StreamMessage>, StoreError>;

    /// Ack an entry and flag the notification read. The stream entry stays
    /// for history; only retention trimming removes it.
    async fn ack(&self, target: &Target, stream_id: &str, nid: &str) -> Result<(), StoreError>;

    /// Re-assign entries pending on an idle consumer to this user's
    /// consumer id.
    async fn reclaim_pending(
        &self,
        target: &Target,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamMessage>, StoreError>;

    /// Remove up to `limit` notifications whose TTL elapsed. Returns the
    /// number cleaned.
    async fn cleanup_expired(&self, target: &Target, limit: usize) -> Result<u64, StoreError>;

    /// Trim the user's stream to their retention window. Returns the number
    /// of entries evicted.
    async fn trim_by_retention(&self, target: &Target) -> Result<u64, StoreError>;

    async fn set_retention_days(&self, target: &Target, days: i64) -> Result<(), StoreError>;

    async fn retention_days(&self, target: &Target) -> Result<i64, StoreError>;

    /// Try to take the per-user consumer lock for `pod_id`.
    async fn acquire_consumer_lock(
        &self,
        target: &Target,
        pod_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Extend the lock if `pod_id` still holds it. `false` means lost.
    async fn renew_consumer_lock(
        &self,
        target: &Target,
        pod_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Drop the lock if `pod_id` holds it; a foreign holder is left alone.
    async fn release_consumer_lock(&self, target: &Target, pod_id: &str)
        -> Result<(), StoreError>;

    /// Read flags for a set of notification ids.
    async fn read_statuses(
        &self,
        target: &Target,
        nids: &[String],
    ) -> Result<HashMap<String, bool>, StoreError>;

    /// Up to `count` most recent stream entries, oldest first, payloads
    /// joined (`None` for tombstones).
    async fn range_last(
        &self,
        target: &Target,
        count: usize,
    ) -> Result<Vec<StreamMessage>, StoreError>;

    async fn save_idempotent_response(
        &self,
        token: &str,
        response: &NotifyResponse,
    ) -> Result<(), StoreError>;

    async fn idempotent_response(&self, token: &str)
        -> Result<Option<NotifyResponse>, StoreError>;

    /// All users with a TTL schedule; closely tracks users with recent
    /// activity, which is what the sweepers want.
    async fn list_users(&self) -> Result<Vec<Target>, StoreError>;
}

/// Production [`NotificationStore`] backed by a Redis connection pool.
#[derive(Clone)]
pub struct RedisRepository {
    pool: Pool,
}

impl RedisRepository {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Join stream entries with their payload blobs.
    ///
    /// A missing blob is not an error; the envelope is kept with a `None`
    /// payload so the client can render it auto-cleared. Load failures are
    /// logged and treated the same way.
    async fn hydrate(
        &self,
        entries: Vec<(String, HashMap<String, RedisValue>)>,
    ) -> Result<Vec<StreamMessage>, StoreError> {
        let mut messages = Vec::with_capacity(entries.len());

        for (id, map) in entries {
            let nid = field_str(&map, "nid");
            let created_at = field_str(&map, "created_at")
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|dt| dt.with_timezone(&Utc));

            let payload = match &nid {
                Some(nid) => match self.get_notification(nid).await {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(error = %e, nid = %nid, "Failed to load payload for stream entry");
                        None
                    }
                },
                None => None,
            };

            messages.push(StreamMessage {
                id,
                nid,
                created_at,
                payload,
            });
        }

        Ok(messages)
    }

    async fn read_group(
        &self,
        target: &Target,
        cursor: &str,
        block: Option<Duration>,
        count: usize,
    ) -> Result<Vec<StreamMessage>, StoreError> {
        let key = stream_key(target);
        let consumer = target.consumer_id();

        let mut opts = StreamReadOptions::default()
            .group(CONSUMER_GROUP, &consumer)
            .count(count);
        if let Some(block) = block {
            opts = opts.block(block.as_millis() as usize);
        }

        let mut conn = self.pool.get().await?;
        let result: Result<StreamReadReply, RedisError> =
            conn.xread_options(&[&key], &[cursor], &opts).await;

        let reply = match result {
            Ok(reply) => reply,
            // Timeout / nil replies mean "nothing to read", not failure
            Err(e) if is_empty_read(&e) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let entries = reply
            .keys
            .into_iter()
            .flat_map(|stream| stream.ids)
            .map(|entry| (entry.id, entry.map))
            .collect();

        self.hydrate(entries).await
    }

    /// Append a push envelope onto another pod's inbox stream.
    ///
    /// Which pod hosts a given user is resolved by the caller; the bus
    /// itself only addresses pods.
    pub async fn publish_bus(
        &self,
        pod_id: &str,
        envelope: &BusEnvelope,
    ) -> Result<String, StoreError> {
        let json = serde_json::to_string(envelope)?;

        let mut conn = self.pool.get().await?;
        let id: String = cmd("XADD")
            .arg(bus_stream_key(pod_id))
            .arg("*")
            .arg("payload")
            .arg(json)
            .query_async(&mut conn)
            .await?;

        Ok(id)
    }
}

#[async_trait]
impl NotificationStore for RedisRepository {
    async fn create_notification(
        &self,
        payload: &NotificationPayload,
    ) -> Result<String, StoreError> {
        let target = &payload.target;
        let nid = &payload.notification_id;
        let payload_json = serde_json::to_string(payload)?;

        // Group creation cannot share the pipeline: a BUSYGROUP reply would
        // poison the whole pipeline response.
        self.ensure_consumer_group(target).await?;

        let skey = stream_key(target);
        let mut conn = self.pool.get().await?;

        let mut p = pipe();
        p.cmd("SET")
            .arg(notification_key(nid))
            .arg(&payload_json)
            .arg("EX")
            .arg(NOTIFICATION_TTL.as_secs())
            .ignore();
        p.cmd("XADD")
            .arg(&skey)
            .arg("MAXLEN")
            .arg(STREAM_MAX_LEN)
            .arg("*")
            .arg("nid")
            .arg(nid)
            .arg("created_at")
            .arg(payload.created_at.to_rfc3339());

        let (stream_id,): (String,) = p.query_async(&mut conn).await?;

        // Schedule expiry. The payload's own TTL bounds the damage if this
        // fails, so it is logged and swallowed.
        let expires_at = Utc::now().timestamp() + NOTIFICATION_TTL.as_secs() as i64;
        let zadd: Result<(), RedisError> = cmd("ZADD")
            .arg(ttl_schedule_key(target))
            .arg(expires_at)
            .arg(ttl_entry(&stream_id, nid))
            .query_async(&mut conn)
            .await;
        if let Err(e) = zadd {
            warn!(error = %e, user = %target, "Failed to schedule notification expiry");
        }

        debug!(
            notification_id = %nid,
            stream_id = %stream_id,
            user = %target,
            "Created notification"
        );

        Ok(stream_id)
    }

    async fn get_notification(
        &self,
        nid: &str,
    ) -> Result<Option<NotificationPayload>, StoreError> {
        let mut conn = self.pool.get().await?;

        let raw: Option<String> = conn.get(notification_key(nid)).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None), // expired or never existed
        }
    }

    async fn ensure_consumer_group(&self, target: &Target) -> Result<(), StoreError> {
        let mut conn = self.pool.get().await?;

        let result: Result<(), RedisError> = cmd("XGROUP")
            .arg("CREATE")
            .arg(stream_key(target))
            .arg(CONSUMER_GROUP)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_pending(
        &self,
        target: &Target,
        count: usize,
    ) -> Result<Vec<StreamMessage>, StoreError> {
        // Cursor "0" returns everything delivered to this consumer but not
        // yet acked.
        self.read_group(target, "0", None, count).await
    }

    async fn read_new(
        &self,
        target: &Target,
        block: Duration,
        count: usize,
    ) -> Result<Vec<StreamMessage>, StoreError> {
        self.read_group(target, ">", Some(block), count).await
    }

    async fn ack(&self, target: &Target, stream_id: &str, nid: &str) -> Result<(), StoreError> {
        let mut conn = self.pool.get().await?;

        let mut p = pipe();
        p.cmd("XACK")
            .arg(stream_key(target))
            .arg(CONSUMER_GROUP)
            .arg(stream_id)
            .ignore();
        p.cmd("HSET")
            .arg(state_key(target))
            .arg(nid)
            .arg("read")
            .ignore();
        let _: () = p.query_async(&mut conn).await?;

        debug!(
            notification_id = %nid,
            stream_id = %stream_id,
            user = %target,
            "Acked notification"
        );

        Ok(())
    }

    async fn reclaim_pending(
        &self,
        target: &Target,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamMessage>, StoreError> {
        let mut conn = self.pool.get().await?;

        // XAUTOCLAIM key group consumer min-idle-time start COUNT count
        let opts = StreamAutoClaimOptions::default().count(count);
        let reply: StreamAutoClaimReply = conn
            .xautoclaim_options(
                stream_key(target),
                CONSUMER_GROUP,
                target.consumer_id(),
                min_idle.as_millis() as u64,
                "0-0",
                opts,
            )
            .await?;

        let entries = reply
            .claimed
            .into_iter()
            .map(|entry| (entry.id, entry.map))
            .collect();
        let messages = self.hydrate(entries).await?;

        if !messages.is_empty() {
            debug!(user = %target, count = messages.len(), "Reclaimed pending messages");
        }

        Ok(messages)
    }

    async fn cleanup_expired(&self, target: &Target, limit: usize) -> Result<u64, StoreError> {
        let zkey = ttl_schedule_key(target);
        let skey = stream_key(target);
        let now = Utc::now().timestamp();

        let mut conn = self.pool.get().await?;

        let expired: Vec<String> = cmd("ZRANGEBYSCORE")
            .arg(&zkey)
            .arg("-inf")
            .arg(now)
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut conn)
            .await?;

        if expired.is_empty() {
            return Ok(0);
        }

        let mut cleaned: u64 = 0;
        let mut p = pipe();

        for entry in &expired {
            let Some((stream_id, nid)) = parse_ttl_entry(entry) else {
                continue;
            };

            p.cmd("XACK")
                .arg(&skey)
                .arg(CONSUMER_GROUP)
                .arg(stream_id)
                .ignore();
            p.cmd("XDEL").arg(&skey).arg(stream_id).ignore();
            p.cmd("DEL").arg(notification_key(nid)).ignore();
            cleaned += 1;
        }

        p.cmd("ZREM").arg(&zkey).arg(&expired).ignore();
        let _: () = p.query_async(&mut conn).await?;

        debug!(user = %target, count = cleaned, "Cleaned expired notifications");

        Ok(cleaned)
    }

    async fn trim_by_retention(&self, target: &Target) -> Result<u64, StoreError> {
        let days = self.retention_days(target).await?;
        let cutoff = Utc::now() - chrono::Duration::days(days);
        // Stream ids are "<unix_ms>-<seq>", so the id floor for a timestamp
        // is just its millisecond value.
        let min_id = format!("{}-0", cutoff.timestamp_millis());

        let mut conn = self.pool.get().await?;
        let trimmed: u64 = cmd("XTRIM")
            .arg(stream_key(target))
            .arg("MINID")
            .arg(min_id)
            .query_async(&mut conn)
            .await?;

        Ok(trimmed)
    }

    async fn set_retention_days(&self, target: &Target, days: i64) -> Result<(), StoreError> {
        let days = days.clamp(RETENTION_MIN_DAYS, RETENTION_MAX_DAYS);

        let mut conn = self.pool.get().await?;
        let _: () = conn.set(retention_key(target), days).await?;
        Ok(())
    }

    async fn retention_days(&self, target: &Target) -> Result<i64, StoreError> {
        let mut conn = self.pool.get().await?;

        let raw: Option<String> = conn.get(retention_key(target)).await?;
        let days = raw
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(RETENTION_DEFAULT_DAYS);

        Ok(days.clamp(RETENTION_MIN_DAYS, RETENTION_MAX_DAYS))
    }

    async fn acquire_consumer_lock(
        &self,
        target: &Target,
        pod_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.pool.get().await?;

        let set: Option<String> = cmd("SET")
            .arg(lock_key(target))
            .arg(pod_id)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs())
            .query_async(&mut conn)
            .await?;

        Ok(set.is_some())
    }

    async fn renew_consumer_lock(
        &self,
        target: &Target,
        pod_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let key = lock_key(target);
        let mut conn = self.pool.get().await?;

        let holder: Option<String> = conn.get(&key).await?;
        match holder {
            Some(holder) if holder == pod_id => {
                let extended: i64 = cmd("PEXPIRE")
                    .arg(&key)
                    .arg(ttl.as_millis() as u64)
                    .query_async(&mut conn)
                    .await?;
                Ok(extended == 1)
            }
            _ => Ok(false),
        }
    }

    async fn release_consumer_lock(
        &self,
        target: &Target,
        pod_id: &str,
    ) -> Result<(), StoreError> {
        let key = lock_key(target);
        let mut conn = self.pool.get().await?;

        let holder: Option<String> = conn.get(&key).await?;
        if holder.as_deref() == Some(pod_id) {
            let _: () = conn.del(&key).await?;
        }
        Ok(())
    }

    async fn read_statuses(
        &self,
        target: &Target,
        nids: &[String],
    ) -> Result<HashMap<String, bool>, StoreError> {
        let mut statuses = HashMap::with_capacity(nids.len());
        if nids.is_empty() {
            return Ok(statuses);
        }

        let mut conn = self.pool.get().await?;
        let values: Vec<Option<String>> = cmd("HMGET")
            .arg(state_key(target))
            .arg(nids)
            .query_async(&mut conn)
            .await?;

        for (nid, value) in nids.iter().zip(values) {
            statuses.insert(nid.clone(), value.as_deref() == Some("read"));
        }

        Ok(statuses)
    }

    async fn range_last(
        &self,
        target: &Target,
        count: usize,
    ) -> Result<Vec<StreamMessage>, StoreError> {
        let mut conn = self.pool.get().await?;

        let mut entries: Vec<(String, HashMap<String, RedisValue>)> = cmd("XREVRANGE")
            .arg(stream_key(target))
            .arg("+")
            .arg("-")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;

        // Back into chronological order
        entries.reverse();

        self.hydrate(entries).await
    }

    async fn save_idempotent_response(
        &self,
        token: &str,
        response: &NotifyResponse,
    ) -> Result<(), StoreError> {
        let json = serde_json::to_string(response)?;

        let mut conn = self.pool.get().await?;
        let _: () = cmd("SET")
            .arg(idempotency_key(token))
            .arg(json)
            .arg("EX")
            .arg(IDEMPOTENCY_TTL.as_secs())
            .query_async(&mut conn)
            .await?;

        Ok(())
    }

    async fn idempotent_response(
        &self,
        token: &str,
    ) -> Result<Option<NotifyResponse>, StoreError> {
        let mut conn = self.pool.get().await?;

        let raw: Option<String> = conn.get(idempotency_key(token)).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn list_users(&self) -> Result<Vec<Target>, StoreError> {
        let mut conn = self.pool.get().await?;
        let mut users = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(format!("{TTL_SCHEDULE_KEY_PREFIX}*"))
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;

            for key in keys {
                let Some(user_key) = key.strip_prefix(TTL_SCHEDULE_KEY_PREFIX) else {
                    continue;
                };
                match Target::from_user_key(user_key) {
                    Some(target) => users.push(target),
                    None => warn!(user_key = %user_key, "Skipping malformed user key"),
                }
            }

            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        Ok(users)
    }

}

/// Extract a string field from stream entry data.
pub(crate) fn field_str(map: &HashMap<String, RedisValue>, key: &str) -> Option<String> {
    map.get(key).and_then(|val| match val {
        RedisValue::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).to_string()),
        RedisValue::SimpleString(s) => Some(s.clone()),
        _ => None,
    })
}

/// Blocked stream reads signal "nothing arrived" through errors rather
/// than an empty reply; recognise those and map them to an empty batch.
pub(crate) fn is_empty_read(err: &RedisError) -> bool {
    let msg = err.to_string();
    msg.contains("timed out") || msg.contains("response was nil")
}
