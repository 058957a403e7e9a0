//! Delivery pipeline counters.
//!
//! Lock-free atomics shared by `Arc`; no registry or exporter is wired
//! here. Counters only accrue, except the connection gauge.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    /// Currently open WebSocket sessions
    ws_connections: AtomicI64,
    /// Pushes sent server -> client
    notifications_sent: AtomicU64,
    /// Acks received client -> server
    notifications_acked: AtomicU64,
    /// Tombstones sent in place of expired payloads
    notifications_auto_cleared: AtomicU64,
    /// Entries re-assigned from idle consumers
    messages_reclaimed: AtomicU64,
    /// Envelopes delivered locally off the inter-pod bus
    bus_delivered: AtomicU64,
    /// Entries removed by the TTL janitor
    ttl_cleaned: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ws_connected(&self) {
        self.ws_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ws_disconnected(&self) {
        self.ws_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn ws_connections(&self) -> i64 {
        self.ws_connections.load(Ordering::Relaxed)
    }

    pub fn record_sent(&self) {
        self.notifications_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_acked(&self) {
        self.notifications_acked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_auto_cleared(&self) {
        self.notifications_auto_cleared.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reclaimed(&self, count: u64) {
        self.messages_reclaimed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_bus_delivered(&self) {
        self.bus_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ttl_cleaned(&self, count: u64) {
        self.ttl_cleaned.fetch_add(count, Ordering::Relaxed);
    }

    pub fn sent(&self) -> u64 {
        self.notifications_sent.load(Ordering::Relaxed)
    }

    pub fn acked(&self) -> u64 {
        self.notifications_acked.load(Ordering::Relaxed)
    }

    pub fn auto_cleared(&self) -> u64 {
        self.notifications_auto_cleared.load(Ordering::Relaxed)
    }

    pub fn reclaimed(&self) -> u64 {
        self.messages_reclaimed.load(Ordering::Relaxed)
    }

    pub fn bus_delivered(&self) -> u64 {
        self.bus_delivered.load(Ordering::Relaxed)
    }

    pub fn ttl_cleaned(&self) -> u64 {
        self.ttl_cleaned.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accrue() {
        let metrics = Metrics::new();

        metrics.record_sent();
        metrics.record_sent();
        metrics.record_reclaimed(5);

        assert_eq!(metrics.sent(), 2);
        assert_eq!(metrics.reclaimed(), 5);
        assert_eq!(metrics.acked(), 0);
    }

    #[test]
    fn test_ws_gauge() {
        let metrics = Metrics::new();

        metrics.ws_connected();
        metrics.ws_connected();
        metrics.ws_disconnected();

        assert_eq!(metrics.ws_connections(), 1);
    }
}
