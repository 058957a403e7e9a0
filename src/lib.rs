//! # Courier Notification Engine
//!
//! Real-time user-addressed notification delivery backed by Redis Streams.
//!
//! ## Architecture
//!
//! ```text
//! Producer -> HTTP API -> per-user Redis Stream -> Session -> WebSocket client
//!                                    |                ^
//!                                    v                |
//!                          TTL janitor / reclaim / retention trimmer
//! ```
//!
//! Every end user owns one stream; a consumer group over that stream gives
//! at-least-once delivery with pending-entry bookkeeping. Sessions hold a
//! cross-pod consumer lock so exactly one connection drives the group at a
//! time; everyone else falls back to shadow mode and receives pushes over
//! the inter-pod bus.
//!
//! ## Modules
//!
//! - [`notification`]: Core domain types shared across the pipeline
//! - [`protocol`]: Tagged WebSocket frame types (client and server)
//! - [`repository`]: The store adapter; single owner of the key layout
//! - [`service`]: Producer-side ingestion with idempotency
//! - [`session`]: Per-connection delivery driver and lock state machine
//! - [`registry`]: In-process map of live sessions
//! - [`workers`]: Background maintenance (janitor, reclaim, retention,
//!   heartbeat, inter-pod bus)

pub mod config;
pub mod metrics;
pub mod notification;
pub mod protocol;
pub mod registry;
pub mod repository;
pub mod service;
pub mod session;
pub mod shutdown;
pub mod workers;

#[cfg(test)]
pub(crate) mod testsupport;

// Re-export commonly used types at crate root
pub use notification::{NotificationPayload, Target};
pub use registry::ConnectionRegistry;
pub use repository::{NotificationStore, RedisRepository};

/// Consumer group name on every per-user stream
pub const CONSUMER_GROUP: &str = "notifications";

/// Consumer group name on per-pod inbox streams
pub const BUS_GROUP: &str = "router";

/// How long a notification payload blob lives in the store
pub const NOTIFICATION_TTL: std::time::Duration = std::time::Duration::from_secs(15 * 60);

/// Hard cap on per-user stream length applied at create time
pub const STREAM_MAX_LEN: usize = 100;
