use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::AggregateId;

/// Version number for an aggregate, used for optimistic concurrency control.
///
/// A freshly provisioned aggregate is written at version 1; every committed
/// transition advances the version by the number of events it produced.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    /// Creates a new version from a raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the initial version (0): the aggregate does not exist yet.
    pub fn initial() -> Self {
        Self(0)
    }

    /// Returns the first version (1) of a stored aggregate.
    pub fn first() -> Self {
        Self(1)
    }

    /// Returns the next version.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the version after `count` more changes.
    pub fn advance(&self, count: usize) -> Self {
        Self(self.0 + count as i64)
    }

    /// Returns the raw version value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Version {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<Version> for i64 {
    fn from(version: Version) -> Self {
        version.0
    }
}

/// The persisted state of one aggregate.
///
/// The store treats `state` as opaque JSON; only `version` takes part in
/// the compare-and-swap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateRecord {
    /// The aggregate this row belongs to.
    pub aggregate_id: AggregateId,

    /// The type of aggregate (e.g., "InventoryItem").
    pub aggregate_type: String,

    /// The version this row is written at.
    pub version: Version,

    /// When the row was last written.
    pub updated_at: DateTime<Utc>,

    /// The serialized aggregate state.
    pub state: serde_json::Value,
}

impl AggregateRecord {
    /// Creates a record from a serializable state.
    pub fn from_state<T: Serialize>(
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        version: Version,
        state: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            version,
            updated_at: Utc::now(),
            state: serde_json::to_value(state)?,
        })
    }

    /// Deserializes the record state into a concrete type.
    pub fn into_state<T: for<'de> Deserialize<'de>>(self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.state)
    }
}
