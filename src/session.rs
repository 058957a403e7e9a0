//! Per-connection session driver.
//!
//! One [`SessionDriver::run`] call serves one accepted WebSocket for a given
//! user. The driver enforces the cross-pod single-reader rule with a
//! consumer lock, seeds the client with pending and historical entries, and
//! then forwards new stream entries as they arrive while concurrently
//! handling inbound commands on the same channel.
//!
//! Holder states:
//!
//! ```text
//!   NEW → ACQUIRE_LOCK → {HELD, SHADOW}
//!   HELD → (renew success) → HELD
//!   HELD → (renew fail | read error | ctx done) → TERMINATING
//!   SHADOW → (read error | ctx done) → TERMINATING
//!   TERMINATING → CLOSED  (release lock if HELD; unregister)
//! ```
//!
//! A shadow session does not touch the consumer group at all; it stays in
//! the connection registry and receives only pushes forwarded by the
//! inter-pod bus router.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::metrics::Metrics;
use crate::notification::{StreamMessage, Target};
use crate::protocol::{ClientFrame, HistoryEntry, PushPayload, ReadReceipt, ServerFrame};
use crate::repository::{NotificationStore, StoreError, RETENTION_MAX_DAYS, RETENTION_MIN_DAYS};
use crate::shutdown::ShutdownSignal;

/// Consumer lock lifetime; renewed at one third of this
const LOCK_TTL: Duration = Duration::from_secs(60);
const LOCK_RENEW_INTERVAL: Duration = Duration::from_secs(20);

/// Deadline for one blocking group read
const READ_BLOCK: Duration = Duration::from_secs(30);

/// Batch sizes for pending, new and history reads
const READ_BATCH: usize = 100;

/// History window served when the client does not say otherwise
const DEFAULT_SYNC_LIMIT: i64 = 100;
const MAX_SYNC_LIMIT: i64 = 1000;

/// Errors that end a session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("store operation failed: {0}")]
    Store(#[from] StoreError),

    /// Read or write on the bidirectional channel failed
    #[error("transport error: {0}")]
    Transport(String),

    /// The lock renewer observed a different holder or a missing lock
    #[error("consumer lock lost")]
    LockLost,
}

/// Bidirectional frame channel to one client.
///
/// Writes are enqueue-only; the transport serializes them on its own writer
/// task, so `send` never blocks and may be called from concurrent loops.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Queue a frame for delivery to the client.
    fn send(&self, frame: ServerFrame) -> Result<(), SessionError>;

    /// Receive the next inbound frame. `Ok(None)` means the peer closed.
    async fn recv(&self) -> Result<Option<ClientFrame>, SessionError>;
}

/// Drives sessions against the store on behalf of this pod.
#[derive(Clone)]
pub struct SessionDriver {
    store: Arc<dyn NotificationStore>,
    metrics: Arc<Metrics>,
    pod_id: String,
}

impl SessionDriver {
    pub fn new(store: Arc<dyn NotificationStore>, metrics: Arc<Metrics>, pod_id: String) -> Self {
        Self {
            store,
            metrics,
            pod_id,
        }
    }

    /// Serve one connection until the channel closes, `shutdown` fires, or
    /// the consumer lock is lost.
    pub async fn run(
        &self,
        target: &Target,
        channel: &dyn Channel,
        shutdown: &ShutdownSignal,
    ) -> Result<(), SessionError> {
        info!(user_id = target.id, login = %target.login, "Session starting");

        self.store.ensure_consumer_group(target).await?;

        let held = match self
            .store
            .acquire_consumer_lock(target, &self.pod_id, LOCK_TTL)
            .await
        {
            Ok(held) => held,
            Err(e) => {
                warn!(error = %e, user_id = target.id, "Failed to acquire consumer lock");
                false
            }
        };

        if held {
            debug!(user_id = target.id, pod = %self.pod_id, "Consumer lock acquired");
        } else {
            info!(
                user_id = target.id,
                login = %target.login,
                "Consumer lock held elsewhere, continuing in shadow mode"
            );
        }

        let mut stop = shutdown.subscribe();

        // Biased order: cancellation wins, and the delivery loop gets to
        // seed pending + history before inbound commands are looked at.
        let result = tokio::select! {
            biased;
            _ = stop.recv() => Ok(()),
            res = self.deliver_loop(target, channel), if held => res,
            res = self.renew_loop(target), if held => res,
            res = self.inbound_loop(target, channel) => res,
        };

        if held {
            if let Err(e) = self
                .store
                .release_consumer_lock(target, &self.pod_id)
                .await
            {
                warn!(error = %e, user_id = target.id, "Failed to release consumer lock");
            }
        }

        info!(user_id = target.id, login = %target.login, "Session ended");
        result
    }

    /// Seed the client, then forward new entries until the read fails.
    async fn deliver_loop(
        &self,
        target: &Target,
        channel: &dyn Channel,
    ) -> Result<(), SessionError> {
        // Entries delivered to a previous session but never acked come
        // first; this session inherits them.
        self.deliver_pending(target, channel).await?;

        // Initial sync: recent history with current read flags. Failure
        // here is not fatal; the client can always issue sync.request.
        if let Err(e) = self.deliver_history(target, channel).await {
            warn!(error = %e, user_id = target.id, "Initial history sync failed");
        }

        loop {
            let batch = self.store.read_new(target, READ_BLOCK, READ_BATCH).await?;
            for msg in &batch {
                self.push(channel, msg, false)?;
            }
        }
    }

    async fn deliver_pending(
        &self,
        target: &Target,
        channel: &dyn Channel,
    ) -> Result<(), SessionError> {
        let pending = self.store.read_pending(target, READ_BATCH).await?;

        debug!(
            user_id = target.id,
            count = pending.len(),
            "Delivering pending messages"
        );

        for msg in &pending {
            self.push(channel, msg, false)?;
        }

        Ok(())
    }

    /// Push the most recent history entries with their read flags, expired
    /// payloads included as tombstones so the client can mark them cleared.
    async fn deliver_history(
        &self,
        target: &Target,
        channel: &dyn Channel,
    ) -> Result<(), SessionError> {
        let messages = self.store.range_last(target, READ_BATCH).await?;
        let read_map = self.read_map(target, &messages).await?;

        for msg in &messages {
            let read = msg
                .nid
                .as_ref()
                .is_some_and(|nid| read_map.get(nid).copied().unwrap_or(false));
            self.push(channel, msg, read)?;
        }

        Ok(())
    }

    fn push(
        &self,
        channel: &dyn Channel,
        msg: &StreamMessage,
        read: bool,
    ) -> Result<(), SessionError> {
        let payload = PushPayload::from_message(msg, read);

        if msg.payload.is_some() {
            self.metrics.record_sent();
        } else {
            self.metrics.record_auto_cleared();
        }

        channel.send(ServerFrame::Push(payload))
    }

    /// Handle inbound commands until the peer closes the channel.
    async fn inbound_loop(
        &self,
        target: &Target,
        channel: &dyn Channel,
    ) -> Result<(), SessionError> {
        loop {
            let Some(frame) = channel.recv().await? else {
                debug!(user_id = target.id, "Client closed the channel");
                return Ok(());
            };

            match frame {
                ClientFrame::NotificationRead(receipt) => {
                    self.handle_read(target, channel, receipt).await?;
                }
                ClientFrame::RetentionSet(req) => {
                    let days = req.days.clamp(RETENTION_MIN_DAYS, RETENTION_MAX_DAYS);
                    if let Err(e) = self.store.set_retention_days(target, days).await {
                        warn!(error = %e, user_id = target.id, "Failed to set retention");
                    }
                }
                ClientFrame::SyncRequest(req) => {
                    self.handle_sync(target, channel, req.limit).await?;
                }
                ClientFrame::Unknown => {
                    // Silently discarded
                }
            }
        }
    }

    async fn handle_read(
        &self,
        target: &Target,
        channel: &dyn Channel,
        receipt: ReadReceipt,
    ) -> Result<(), SessionError> {
        if let Err(e) = self
            .store
            .ack(target, &receipt.stream_id, &receipt.notification_id)
            .await
        {
            // The entry stays pending and will be re-delivered; the session
            // itself survives.
            error!(
                error = %e,
                notification_id = %receipt.notification_id,
                user_id = target.id,
                "Failed to ack notification"
            );
            return Ok(());
        }

        self.metrics.record_acked();
        channel.send(ServerFrame::ReadAck(receipt))
    }

    async fn handle_sync(
        &self,
        target: &Target,
        channel: &dyn Channel,
        limit: i64,
    ) -> Result<(), SessionError> {
        let limit = if limit <= 0 || limit > MAX_SYNC_LIMIT {
            DEFAULT_SYNC_LIMIT
        } else {
            limit
        };

        let messages = match self.store.range_last(target, limit as usize).await {
            Ok(messages) => messages,
            Err(e) => {
                warn!(error = %e, user_id = target.id, "sync.request failed");
                return Ok(());
            }
        };

        let read_map = match self.read_map(target, &messages).await {
            Ok(map) => map,
            Err(e) => {
                warn!(error = %e, user_id = target.id, "sync.request read lookup failed");
                return Ok(());
            }
        };

        let entries: Vec<HistoryEntry> = messages
            .iter()
            .map(|msg| {
                let read = msg
                    .nid
                    .as_ref()
                    .is_some_and(|nid| read_map.get(nid).copied().unwrap_or(false));
                HistoryEntry::from_message(msg, read)
            })
            .collect();

        channel.send(ServerFrame::SyncResponse(entries))
    }

    async fn read_map(
        &self,
        target: &Target,
        messages: &[StreamMessage],
    ) -> Result<std::collections::HashMap<String, bool>, SessionError> {
        let ids: Vec<String> = messages
            .iter()
            .filter(|m| m.payload.is_some())
            .filter_map(|m| m.nid.clone())
            .collect();

        Ok(self.store.read_statuses(target, &ids).await?)
    }

    /// Keep the consumer lock alive; any failed renewal ends the session.
    async fn renew_loop(&self, target: &Target) -> Result<(), SessionError> {
        let mut ticker = tokio::time::interval(LOCK_RENEW_INTERVAL);
        // The first tick completes immediately; skip it
        ticker.tick().await;

        loop {
            ticker.tick().await;

            match self
                .store
                .renew_consumer_lock(target, &self.pod_id, LOCK_TTL)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    info!(user_id = target.id, "Consumer lock lost during renewal");
                    return Err(SessionError::LockLost);
                }
                Err(e) => {
                    warn!(error = %e, user_id = target.id, "Consumer lock renewal failed");
                    return Err(SessionError::LockLost);
                }
            }
        }
    }
}
