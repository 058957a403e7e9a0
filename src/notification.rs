//! Core domain types for Courier.
//!
//! A [`NotificationPayload`] is the immutable message stored in Redis; a
//! [`Target`] identifies the user it is addressed to. Per-user streams hold
//! [`StreamMessage`] envelopes referencing payloads by notification id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The recipient of a notification.
///
/// Rendered as `"<id>-<login>"` wherever a user keys store state. The pair
/// is treated as an opaque routing identity; no user directory exists.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub id: i64,
    pub login: String,
}

impl Target {
    pub fn new(id: i64, login: impl Into<String>) -> Self {
        Self {
            id,
            login: login.into(),
        }
    }

    /// Key under which all per-user state is stored, `"<id>-<login>"`.
    pub fn user_key(&self) -> String {
        format!("{}-{}", self.id, self.login)
    }

    /// Consumer id this user's sessions read the group with.
    pub fn consumer_id(&self) -> String {
        format!("user:{}", self.id)
    }

    /// Parse a `"<id>-<login>"` key back into a target.
    ///
    /// Splits on the first `-` only, so logins containing hyphens survive
    /// the round trip.
    pub fn from_user_key(key: &str) -> Option<Self> {
        let (id, login) = key.split_once('-')?;
        let id: i64 = id.parse().ok()?;
        if login.is_empty() {
            return None;
        }
        Some(Self::new(id, login))
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.id, self.login)
    }
}

/// The stored notification blob, serialized as JSON at `notification:<nid>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub notification_id: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub source: String,
    pub target: Target,
}

/// Producer request to create notifications for one or more targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyRequest {
    /// Recipients; the request fans out to one notification per entry
    #[serde(rename = "target")]
    pub targets: Vec<Target>,

    pub message: String,

    /// Defaults to ingress time when the producer omits it
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,

    pub source: String,
}

/// Response to a [`NotifyRequest`]; one result per successfully created
/// notification. Targets that failed are simply absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifyResponse {
    pub results: Vec<NotifyResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifyResult {
    pub target: Target,
    pub notification_id: String,
}

/// A per-user stream envelope, optionally joined with its payload.
///
/// `payload` is `None` when the blob has already expired; such entries are
/// delivered to clients as `auto_cleared` tombstones.
#[derive(Debug, Clone)]
pub struct StreamMessage {
    /// Redis stream entry id (e.g. `"1234567890123-0"`)
    pub id: String,

    /// Notification id referenced by the entry
    pub nid: Option<String>,

    /// Creation timestamp recorded in the entry itself
    pub created_at: Option<DateTime<Utc>>,

    /// Joined payload; `None` for tombstones
    pub payload: Option<NotificationPayload>,
}
