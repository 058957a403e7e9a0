//! In-memory doubles shared across unit tests.
//!
//! [`MemoryStore`] implements [`NotificationStore`] over plain maps with a
//! few scripting hooks (failing targets, scripted sweeps, lock behaviour).
//! [`ScriptChannel`] replays a fixed set of inbound frames and records
//! everything the session sends; it reports the channel closed once the
//! expected number of outbound frames has been observed.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::redis::{ErrorKind, RedisError};

use crate::notification::{NotificationPayload, NotifyResponse, StreamMessage, Target};
use crate::protocol::{ClientFrame, ServerFrame};
use crate::repository::{NotificationStore, StoreError, RETENTION_MAX_DAYS, RETENTION_MIN_DAYS};
use crate::session::{Channel, SessionError};

fn simulated_error() -> StoreError {
    StoreError::Redis(RedisError::from((ErrorKind::IoError, "simulated failure")))
}

#[derive(Default)]
struct MemoryState {
    created: Vec<NotificationPayload>,
    fail_create: HashSet<String>,
    fail_acks: bool,
    payloads: HashMap<String, NotificationPayload>,
    pending: HashMap<String, Vec<StreamMessage>>,
    new_batches: HashMap<String, VecDeque<Vec<StreamMessage>>>,
    history: HashMap<String, Vec<StreamMessage>>,
    read_state: HashMap<String, HashMap<String, bool>>,
    acks: Vec<(String, String)>,
    retention: HashMap<String, i64>,
    lock_available: bool,
    renew_ok: bool,
    locks: HashMap<String, String>,
    released: Vec<String>,
    idempotency: HashMap<String, NotifyResponse>,
    users: Vec<Target>,
    cleanup_counts: HashMap<String, VecDeque<u64>>,
    cleanup_calls: Vec<(String, usize)>,
    reclaim_batches: HashMap<String, VecDeque<Vec<StreamMessage>>>,
    trim_calls: Vec<String>,
    range_requests: Vec<usize>,
}

pub struct MemoryStore {
    state: Mutex<MemoryState>,
    read_pending_calls: AtomicUsize,
    read_new_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                lock_available: true,
                renew_ok: true,
                ..Default::default()
            }),
            read_pending_calls: AtomicUsize::new(0),
            read_new_calls: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap()
    }

    // -- scripting hooks ---------------------------------------------------

    pub fn fail_create_for(&self, target: Target) {
        self.lock().fail_create.insert(target.user_key());
    }

    pub fn fail_acks(&self) {
        self.lock().fail_acks = true;
    }

    pub fn push_pending(&self, target: &Target, msg: StreamMessage) {
        self.lock()
            .pending
            .entry(target.user_key())
            .or_default()
            .push(msg);
    }

    pub fn push_new(&self, target: &Target, batch: Vec<StreamMessage>) {
        self.lock()
            .new_batches
            .entry(target.user_key())
            .or_default()
            .push_back(batch);
    }

    pub fn set_history(&self, target: &Target, messages: Vec<StreamMessage>) {
        self.lock().history.insert(target.user_key(), messages);
    }

    pub fn mark_read(&self, target: &Target, nid: &str) {
        self.lock()
            .read_state
            .entry(target.user_key())
            .or_default()
            .insert(nid.to_string(), true);
    }

    pub fn set_lock_available(&self, available: bool) {
        self.lock().lock_available = available;
    }

    pub fn set_renew_ok(&self, ok: bool) {
        self.lock().renew_ok = ok;
    }

    pub fn set_users(&self, users: Vec<Target>) {
        self.lock().users = users;
    }

    pub fn script_cleanup(&self, target: &Target, counts: Vec<u64>) {
        self.lock()
            .cleanup_counts
            .insert(target.user_key(), counts.into());
    }

    pub fn script_reclaim(&self, target: &Target, batch: Vec<StreamMessage>) {
        self.lock()
            .reclaim_batches
            .entry(target.user_key())
            .or_default()
            .push_back(batch);
    }

    // -- observations ------------------------------------------------------

    pub fn created(&self) -> Vec<NotificationPayload> {
        self.lock().created.clone()
    }

    pub fn acks(&self) -> Vec<(String, String)> {
        self.lock().acks.clone()
    }

    pub fn retention_for(&self, target: &Target) -> Option<i64> {
        self.lock().retention.get(&target.user_key()).copied()
    }

    pub fn released(&self) -> Vec<String> {
        self.lock().released.clone()
    }

    pub fn read_pending_calls(&self) -> usize {
        self.read_pending_calls.load(Ordering::Relaxed)
    }

    pub fn read_new_calls(&self) -> usize {
        self.read_new_calls.load(Ordering::Relaxed)
    }

    pub fn range_requests(&self) -> Vec<usize> {
        self.lock().range_requests.clone()
    }

    pub fn cleanup_calls(&self) -> Vec<(String, usize)> {
        self.lock().cleanup_calls.clone()
    }

    pub fn trim_calls(&self) -> Vec<String> {
        self.lock().trim_calls.clone()
    }
}

#[async_trait]
impl NotificationStore for MemoryStore {
    async fn create_notification(
        &self,
        payload: &NotificationPayload,
    ) -> Result<String, StoreError> {
        let mut state = self.lock();

        if state.fail_create.contains(&payload.target.user_key()) {
            return Err(simulated_error());
        }

        state.created.push(payload.clone());
        state
            .payloads
            .insert(payload.notification_id.clone(), payload.clone());
        Ok(format!("{}-0", state.created.len()))
    }

    async fn get_notification(
        &self,
        nid: &str,
    ) -> Result<Option<NotificationPayload>, StoreError> {
        Ok(self.lock().payloads.get(nid).cloned())
    }

    async fn ensure_consumer_group(&self, _target: &Target) -> Result<(), StoreError> {
        Ok(())
    }

    async fn read_pending(
        &self,
        target: &Target,
        _count: usize,
    ) -> Result<Vec<StreamMessage>, StoreError> {
        self.read_pending_calls.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .lock()
            .pending
            .get(&target.user_key())
            .cloned()
            .unwrap_or_default())
    }

    async fn read_new(
        &self,
        target: &Target,
        block: Duration,
        _count: usize,
    ) -> Result<Vec<StreamMessage>, StoreError> {
        self.read_new_calls.fetch_add(1, Ordering::Relaxed);

        let batch = self
            .lock()
            .new_batches
            .get_mut(&target.user_key())
            .and_then(|q| q.pop_front());

        match batch {
            Some(batch) => Ok(batch),
            None => {
                // Nothing queued: behave like a blocked read timing out
                tokio::time::sleep(block).await;
                Ok(Vec::new())
            }
        }
    }

    async fn ack(&self, target: &Target, stream_id: &str, nid: &str) -> Result<(), StoreError> {
        let mut state = self.lock();

        if state.fail_acks {
            return Err(simulated_error());
        }

        state.acks.push((stream_id.to_string(), nid.to_string()));
        state
            .read_state
            .entry(target.user_key())
            .or_default()
            .insert(nid.to_string(), true);
        Ok(())
    }

    async fn reclaim_pending(
        &self,
        target: &Target,
        _min_idle: Duration,
        _count: usize,
    ) -> Result<Vec<StreamMessage>, StoreError> {
        Ok(self
            .lock()
            .reclaim_batches
            .get_mut(&target.user_key())
            .and_then(|q| q.pop_front())
            .unwrap_or_default())
    }

    async fn cleanup_expired(&self, target: &Target, limit: usize) -> Result<u64, StoreError> {
        let mut state = self.lock();
        let key = target.user_key();
        state.cleanup_calls.push((key.clone(), limit));

        Ok(state
            .cleanup_counts
            .get_mut(&key)
            .and_then(|q| q.pop_front())
            .unwrap_or(0))
    }

    async fn trim_by_retention(&self, target: &Target) -> Result<u64, StoreError> {
        self.lock().trim_calls.push(target.user_key());
        Ok(0)
    }

    async fn set_retention_days(&self, target: &Target, days: i64) -> Result<(), StoreError> {
        let days = days.clamp(RETENTION_MIN_DAYS, RETENTION_MAX_DAYS);
        self.lock().retention.insert(target.user_key(), days);
        Ok(())
    }

    async fn retention_days(&self, target: &Target) -> Result<i64, StoreError> {
        Ok(self
            .lock()
            .retention
            .get(&target.user_key())
            .copied()
            .unwrap_or(7))
    }

    async fn acquire_consumer_lock(
        &self,
        target: &Target,
        pod_id: &str,
        _ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock();
        if !state.lock_available {
            return Ok(false);
        }

        let key = target.user_key();
        if state.locks.contains_key(&key) {
            return Ok(false);
        }
        state.locks.insert(key, pod_id.to_string());
        Ok(true)
    }

    async fn renew_consumer_lock(
        &self,
        target: &Target,
        pod_id: &str,
        _ttl: Duration,
    ) -> Result<bool, StoreError> {
        let state = self.lock();
        Ok(state.renew_ok
            && state.locks.get(&target.user_key()).map(String::as_str) == Some(pod_id))
    }

    async fn release_consumer_lock(
        &self,
        target: &Target,
        pod_id: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        let key = target.user_key();

        if state.locks.get(&key).map(String::as_str) == Some(pod_id) {
            state.locks.remove(&key);
        }
        state.released.push(key);
        Ok(())
    }

    async fn read_statuses(
        &self,
        target: &Target,
        nids: &[String],
    ) -> Result<HashMap<String, bool>, StoreError> {
        let state = self.lock();
        let flags = state.read_state.get(&target.user_key());

        Ok(nids
            .iter()
            .map(|nid| {
                let read = flags
                    .and_then(|m| m.get(nid))
                    .copied()
                    .unwrap_or(false);
                (nid.clone(), read)
            })
            .collect())
    }

    async fn range_last(
        &self,
        target: &Target,
        count: usize,
    ) -> Result<Vec<StreamMessage>, StoreError> {
        let mut state = self.lock();
        state.range_requests.push(count);

        let mut messages = state
            .history
            .get(&target.user_key())
            .cloned()
            .unwrap_or_default();
        if messages.len() > count {
            messages = messages.split_off(messages.len() - count);
        }
        Ok(messages)
    }

    async fn save_idempotent_response(
        &self,
        token: &str,
        response: &NotifyResponse,
    ) -> Result<(), StoreError> {
        self.lock()
            .idempotency
            .insert(token.to_string(), response.clone());
        Ok(())
    }

    async fn idempotent_response(
        &self,
        token: &str,
    ) -> Result<Option<NotifyResponse>, StoreError> {
        Ok(self.lock().idempotency.get(token).cloned())
    }

    async fn list_users(&self) -> Result<Vec<Target>, StoreError> {
        Ok(self.lock().users.clone())
    }
}

/// Scripted [`Channel`]: replays `inbound`, records sends, and closes once
/// `close_after` outbound frames have been observed.
pub struct ScriptChannel {
    inbound: Mutex<VecDeque<ClientFrame>>,
    sent: Mutex<Vec<ServerFrame>>,
    close_after: usize,
}

impl ScriptChannel {
    pub fn new(inbound: Vec<ClientFrame>, close_after: usize) -> Self {
        Self {
            inbound: Mutex::new(inbound.into()),
            sent: Mutex::new(Vec::new()),
            close_after,
        }
    }

    pub fn sent(&self) -> Vec<ServerFrame> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Channel for ScriptChannel {
    fn send(&self, frame: ServerFrame) -> Result<(), SessionError> {
        self.sent.lock().unwrap().push(frame);
        Ok(())
    }

    async fn recv(&self) -> Result<Option<ClientFrame>, SessionError> {
        loop {
            if let Some(frame) = self.inbound.lock().unwrap().pop_front() {
                return Ok(Some(frame));
            }
            if self.sent.lock().unwrap().len() >= self.close_after {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
