//! Background maintenance workers.
//!
//! Each worker owns a periodic loop driven by a tick interval and a
//! [`ShutdownSignal`](crate::shutdown::ShutdownSignal) subscription; on
//! cancel it quiesces within the current tick. Sweeps that walk all users
//! throttle between users to bound store load.
//!
//! - [`TtlJanitor`]: removes notifications whose 15-minute TTL elapsed
//! - [`GroupMaintenance`]: reclaims entries pending on dead consumers
//! - [`RetentionTrimmer`]: trims per-user streams to their retention window
//! - [`HeartbeatWorker`]: pod liveness beacon for bus membership
//! - [`BusRouter`]: consumes this pod's inbox and forwards to local sessions

pub mod bus;
pub mod heartbeat;
pub mod janitor;
pub mod reclaim;
pub mod retention;

pub use bus::BusRouter;
pub use heartbeat::HeartbeatWorker;
pub use janitor::TtlJanitor;
pub use reclaim::GroupMaintenance;
pub use retention::RetentionTrimmer;

use std::time::Duration;

/// Pause between per-user store calls inside a sweep
pub(crate) const USER_THROTTLE: Duration = Duration::from_millis(10);
