//! WebSocket frame types.
//!
//! Every frame on the session transport is a JSON object
//! `{"type": "...", "data": {...}}`. Frames are modelled as tagged sums with
//! one variant per `type`, not as open maps with optional fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::notification::{NotificationPayload, StreamMessage};

/// Frames the client may send.
///
/// Unrecognized types deserialize to [`ClientFrame::Unknown`] and are
/// silently discarded by the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientFrame {
    /// Acknowledge receipt of a notification
    #[serde(rename = "notification.read")]
    NotificationRead(ReadReceipt),

    /// Set this user's history retention window in days
    #[serde(rename = "retention.set")]
    RetentionSet(RetentionSet),

    /// Request a history window
    #[serde(rename = "sync.request")]
    SyncRequest(SyncRequest),

    #[serde(other)]
    Unknown,
}

/// Frames the server may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerFrame {
    #[serde(rename = "notification.push")]
    Push(PushPayload),

    /// Confirms a [`ClientFrame::NotificationRead`]
    #[serde(rename = "notification.read.ack")]
    ReadAck(ReadReceipt),

    #[serde(rename = "sync.response")]
    SyncResponse(Vec<HistoryEntry>),

    #[serde(rename = "error")]
    Error(ErrorInfo),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadReceipt {
    pub notification_id: String,
    pub stream_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionSet {
    pub days: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRequest {
    #[serde(default)]
    pub limit: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub message: String,
}

/// Delivery state of a pushed notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Unread,
    /// The payload blob expired before delivery; only the envelope remains
    AutoCleared,
}

/// Body of a `notification.push` frame.
///
/// Tombstones carry no `message` or `source`; the fields are omitted from
/// the JSON entirely rather than sent as null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushPayload {
    pub notification_id: String,
    pub stream_id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    pub status: DeliveryStatus,
    pub read: bool,
}

impl PushPayload {
    /// Render a stream envelope for the client.
    ///
    /// Entries whose payload is gone become `auto_cleared` tombstones and
    /// are always flagged read; live entries carry the supplied read flag.
    pub fn from_message(msg: &StreamMessage, read: bool) -> Self {
        match &msg.payload {
            Some(payload) => Self {
                notification_id: payload.notification_id.clone(),
                stream_id: msg.id.clone(),
                message: Some(payload.message.clone()),
                created_at: Some(payload.created_at),
                source: Some(payload.source.clone()),
                status: DeliveryStatus::Unread,
                read,
            },
            None => Self {
                notification_id: msg.nid.clone().unwrap_or_default(),
                stream_id: msg.id.clone(),
                message: None,
                created_at: msg.created_at,
                source: None,
                status: DeliveryStatus::AutoCleared,
                read: true,
            },
        }
    }
}

/// One element of a `sync.response` window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Stream entry id
    pub id: String,
    pub payload: Option<NotificationPayload>,
    pub read: bool,
    pub status: DeliveryStatus,
}

impl HistoryEntry {
    pub fn from_message(msg: &StreamMessage, read: bool) -> Self {
        match &msg.payload {
            Some(payload) => Self {
                id: msg.id.clone(),
                payload: Some(payload.clone()),
                read,
                status: DeliveryStatus::Unread,
            },
            None => Self {
                id: msg.id.clone(),
                payload: None,
                read: true,
                status: DeliveryStatus::AutoCleared,
            },
        }
    }
}

/// Envelope carried on a pod's inbox stream.
///
/// `data` holds a complete [`ServerFrame`] as raw JSON; the router on the
/// destination pod forwards it verbatim to the local session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEnvelope {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(rename = "userKey")]
    pub user_key: String,

    pub data: Value,
}
