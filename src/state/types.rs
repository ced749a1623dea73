use chrono::{DateTime, Utc};
use galleryd_common::InstanceId;
use galleryd_db::ImageRecord;
use serde::{Deserialize, Serialize};

/// Aggregate status of the external generation system, as seen through
/// pushed events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationStatus {
    pub jobs_received: u64,
    pub outputs_accepted: u64,
    pub outputs_duplicate: u64,
    pub outputs_rejected: u64,
    /// Enqueued outputs whose outcome was not known before the event timeout
    #[serde(default)]
    pub outputs_queued: u64,
    pub last_job_id: Option<String>,
    pub last_event_at: Option<DateTime<Utc>>,
}

/// A committed change, as published to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum StateDiff {
    RecordAdded(Box<ImageRecord>),
    RecordUpdated(Box<ImageRecord>),
    RecordRemoved { filename: String },
    Generation(GenerationStatus),
}

impl StateDiff {
    /// Whether the change can alter which records are in the projected page.
    pub fn changes_membership(&self) -> bool {
        matches!(self, Self::RecordAdded(_) | Self::RecordRemoved { .. })
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Self::RecordAdded(_) => MessageKind::RecordAdded,
            Self::RecordUpdated(_) => MessageKind::RecordUpdated,
            Self::RecordRemoved { .. } => MessageKind::RecordRemoved,
            Self::Generation(_) => MessageKind::GenerationStatus,
        }
    }

    fn data(&self) -> serde_json::Value {
        let value = match self {
            Self::RecordAdded(record) | Self::RecordUpdated(record) => {
                serde_json::to_value(record.as_ref())
            }
            Self::RecordRemoved { filename } => {
                Ok(serde_json::json!({ "filename": filename }))
            }
            Self::Generation(status) => serde_json::to_value(status),
        };
        value.unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Full snapshot
    State,
    RecordAdded,
    RecordUpdated,
    RecordRemoved,
    GenerationStatus,
    Pong,
}

/// Wire message: `{ type, data, version }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub data: serde_json::Value,
    pub version: u64,
}

impl StateMessage {
    pub fn from_diff(diff: &StateDiff, version: u64) -> Self {
        Self {
            kind: diff.kind(),
            data: diff.data(),
            version,
        }
    }

    pub fn snapshot(snapshot: &Snapshot) -> Self {
        Self {
            kind: MessageKind::State,
            data: serde_json::to_value(snapshot).unwrap_or(serde_json::Value::Null),
            version: snapshot.version,
        }
    }

    pub fn pong(version: u64) -> Self {
        Self {
            kind: MessageKind::Pong,
            data: serde_json::Value::Null,
            version,
        }
    }
}

/// Full view of the projection at one version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub instance_id: InstanceId,
    pub version: u64,
    pub records: Vec<ImageRecord>,
    pub total: u64,
    pub generation: GenerationStatus,
}

/// Freshly queried page, supplied by the store when a diff changes membership.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionRefresh {
    pub records: Vec<ImageRecord>,
    pub total: u64,
}

/// Messages a client may send over the subscription channel.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    RequestState,
    Ping,
    Ack { version: u64 },
}
