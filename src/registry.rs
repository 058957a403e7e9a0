//! In-process registry of live sessions.
//!
//! One entry per user key; inserting over an existing entry shuts the
//! previous session down, so at most one local session exists per user.
//! The inter-pod bus router and anything else that wants to push to a
//! local session goes through [`ConnectionRegistry::send_to_user`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::notification::Target;
use crate::protocol::ServerFrame;
use crate::shutdown::ShutdownSignal;

/// Send side of a live session.
struct SessionHandle {
    target: Target,
    connected_at: DateTime<Utc>,
    outbound: mpsc::UnboundedSender<ServerFrame>,
    shutdown: ShutdownSignal,
    conn_id: u64,
}

/// Thread-safe map of live sessions keyed by user key.
///
/// Exactly one registry exists per process; it is passed around as an
/// `Arc` rather than living in a module-level singleton so tests stay
/// deterministic.
#[derive(Default)]
pub struct ConnectionRegistry {
    clients: RwLock<HashMap<String, SessionHandle>>,
    next_conn_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session, closing any previous session for the same user.
    ///
    /// Returns a connection id the caller must hand back to
    /// [`unregister`](Self::unregister) so a tearing-down session cannot
    /// remove its own replacement.
    pub async fn register(
        &self,
        target: &Target,
        outbound: mpsc::UnboundedSender<ServerFrame>,
        shutdown: ShutdownSignal,
    ) -> u64 {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let handle = SessionHandle {
            target: target.clone(),
            connected_at: Utc::now(),
            outbound,
            shutdown,
            conn_id,
        };

        let mut clients = self.clients.write().await;
        if let Some(previous) = clients.insert(target.user_key(), handle) {
            info!(
                user_id = target.id,
                login = %target.login,
                "Closing previous session for reconnecting client"
            );
            previous.shutdown.trigger();
        }

        info!(
            user_id = target.id,
            login = %target.login,
            total_clients = clients.len(),
            "Client connected"
        );

        conn_id
    }

    /// Remove a session if it is still the registered one.
    pub async fn unregister(&self, target: &Target, conn_id: u64) {
        let mut clients = self.clients.write().await;
        let key = target.user_key();

        if clients.get(&key).is_some_and(|h| h.conn_id == conn_id) {
            clients.remove(&key);
            info!(
                user_id = target.id,
                login = %target.login,
                total_clients = clients.len(),
                "Client disconnected"
            );
        }
    }

    /// Push a frame to the local session for this user, if one exists.
    ///
    /// Returns whether a matching session existed and accepted the frame.
    pub async fn send_to_user(&self, user_id: i64, login: &str, frame: ServerFrame) -> bool {
        let key = Target::new(user_id, login).user_key();
        let clients = self.clients.read().await;

        match clients.get(&key) {
            Some(handle) => {
                let delivered = handle.outbound.send(frame).is_ok();
                if !delivered {
                    debug!(user_id, login, "Session outbound channel already closed");
                }
                delivered
            }
            None => false,
        }
    }

    pub async fn is_connected(&self, target: &Target) -> bool {
        self.clients.read().await.contains_key(&target.user_key())
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Enumerate connected users with their connection times.
    pub async fn connected_users(&self) -> Vec<(Target, DateTime<Utc>)> {
        self.clients
            .read()
            .await
            .values()
            .map(|h| (h.target.clone(), h.connected_at))
            .collect()
    }
}
