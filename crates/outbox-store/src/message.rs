use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::AggregateId;

/// Unique identifier for an event, shared with downstream consumers as the
/// deduplication key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Creates a new random event ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an event ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EventId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Primary key of an outbox row: the aggregate plus its per-aggregate
/// sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageKey {
    pub aggregate_id: AggregateId,
    pub sequence: i64,
}

impl MessageKey {
    pub fn new(aggregate_id: AggregateId, sequence: i64) -> Self {
        Self {
            aggregate_id,
            sequence,
        }
    }
}

impl std::fmt::Display for MessageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.aggregate_id, self.sequence)
    }
}

/// Delivery status of an outbox row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    /// Written, not yet acknowledged by the broker.
    #[default]
    Pending,
    /// Acknowledged by the broker.
    Published,
    /// Quarantined after exhausting its attempts; waits for operator replay.
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Published => "published",
            OutboxStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OutboxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OutboxStatus::Pending),
            "published" => Ok(OutboxStatus::Published),
            "failed" => Ok(OutboxStatus::Failed),
            other => Err(format!("unknown outbox status '{other}'")),
        }
    }
}

/// An event waiting to be written to the outbox as part of a unit of work.
///
/// The aggregate id, type and sequence are filled in by the store at commit
/// time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewOutboxMessage {
    pub event_id: EventId,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl NewOutboxMessage {
    /// Creates a message from a serializable event payload.
    pub fn from_event<T: Serialize>(
        event_type: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::from_raw(event_type, serde_json::to_value(payload)?))
    }

    /// Creates a message from a raw JSON payload.
    pub fn from_raw(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_id: EventId::new(),
            event_type: event_type.into(),
            payload,
            metadata: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Adds a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// A row of the outbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub aggregate_id: AggregateId,

    /// 1-based, strictly increasing within `aggregate_id`.
    pub sequence: i64,

    pub event_id: EventId,
    pub aggregate_type: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub metadata: HashMap<String, serde_json::Value>,
    pub status: OutboxStatus,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,

    /// Earliest time the relay may try this row again.
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl OutboxMessage {
    /// Materializes a pending row from a unit-of-work message.
    pub fn pending(
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        sequence: i64,
        message: NewOutboxMessage,
    ) -> Self {
        Self {
            aggregate_id,
            sequence,
            event_id: message.event_id,
            aggregate_type: aggregate_type.into(),
            event_type: message.event_type,
            payload: message.payload,
            metadata: message.metadata,
            status: OutboxStatus::Pending,
            attempt_count: 0,
            last_error: None,
            created_at: message.created_at,
            published_at: None,
            next_attempt_at: None,
        }
    }

    pub fn key(&self) -> MessageKey {
        MessageKey::new(self.aggregate_id, self.sequence)
    }

    pub fn is_pending(&self) -> bool {
        self.status == OutboxStatus::Pending
    }

    /// Returns true if a retry backoff is still running at `now`.
    pub fn is_deferred(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.is_some_and(|at| at > now)
    }
}
