use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for an aggregate instance.
///
/// Wraps a UUID to provide type safety and prevent mixing up
/// aggregate IDs with other UUID-based identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AggregateId(Uuid);

impl AggregateId {
    /// Creates a new random aggregate ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an aggregate ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Stable non-negative hash of the UUID: its low 63 bits.
    ///
    /// Stored next to outbox rows so the database can filter by partition
    /// with `partition_hash % count = index`.
    pub fn partition_hash(&self) -> i64 {
        (self.0.as_u128() as u64 & i64::MAX as u64) as i64
    }

    /// Maps this ID onto one of `count` partitions.
    ///
    /// The mapping only depends on the UUID bits, so every process agrees on
    /// which partition owns an aggregate.
    pub fn partition(&self, count: u32) -> u32 {
        if count <= 1 {
            return 0;
        }
        (self.partition_hash() % i64::from(count)) as u32
    }
}

impl Default for AggregateId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AggregateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for AggregateId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<AggregateId> for Uuid {
    fn from(id: AggregateId) -> Self {
        id.0
    }
}

/// One slice of the aggregate space: the aggregates whose partition among
/// `count` equals `index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Shard {
    index: u32,
    count: u32,
}

impl Shard {
    /// Creates shard `index` of `count`. A zero count is treated as one and
    /// an out-of-range index wraps.
    pub fn new(index: u32, count: u32) -> Self {
        let count = count.max(1);
        Self {
            index: index % count,
            count,
        }
    }

    /// The single shard covering every aggregate.
    pub fn all() -> Self {
        Self { index: 0, count: 1 }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// Returns true if `aggregate_id` belongs to this shard.
    pub fn contains(&self, aggregate_id: AggregateId) -> bool {
        aggregate_id.partition(self.count) == self.index
    }
}

impl Default for Shard {
    fn default() -> Self {
        Self::all()
    }
}

impl std::fmt::Display for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.index, self.count)
    }
}

/// Caller-supplied key identifying one reservation attempt.
///
/// Doubles as the idempotency key for reserve/release commands.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReservationId(String);

impl ReservationId {
    /// Creates a reservation ID from a caller-supplied value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh random reservation ID.
    pub fn generate() -> Self {
        Self(format!("res-{}", Uuid::new_v4()))
    }

    /// Returns the ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the ID is empty or only whitespace.
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::fmt::Display for ReservationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ReservationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ReservationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}
