//! Event payloads: confirmed remote events and queued local ones.

use serde::{Deserialize, Serialize};

use crate::ids::{EventId, TxnId};
use crate::sort_key::SortKey;

/// A confirmed remote event as stored in the timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub event_id: EventId,
    pub sender: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub content: serde_json::Value,
    #[serde(default)]
    pub origin_server_ts: u64,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub unsigned: serde_json::Value,
}

impl TimelineEvent {
    pub fn new(
        event_id: EventId,
        sender: impl Into<String>,
        event_type: impl Into<String>,
        content: serde_json::Value,
    ) -> Self {
        Self {
            event_id,
            sender: sender.into(),
            event_type: event_type.into(),
            content,
            origin_server_ts: crate::now_millis(),
            unsigned: serde_json::Value::Null,
        }
    }

    /// Local transaction id echoed back by the server for our own sends.
    pub fn transaction_id(&self) -> Option<TxnId> {
        self.unsigned
            .get("transaction_id")
            .and_then(|v| v.as_str())
            .and_then(|s| TxnId::parse(s).ok())
    }

    pub fn is_encrypted(&self) -> bool {
        self.event_type == "m.room.encrypted"
    }
}

/// A message queued locally and not yet confirmed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEvent {
    /// Position in the local send queue; orders pending entries.
    pub queue_index: u32,
    pub txn_id: TxnId,
    pub event_type: String,
    pub content: serde_json::Value,
}

impl PendingEvent {
    pub fn sort_key(&self) -> SortKey {
        SortKey::pending(self.queue_index)
    }
}
