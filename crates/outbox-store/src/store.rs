use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    AggregateId, AggregateRecord, MessageKey, NewOutboxMessage, OutboxMessage, OutboxQuery,
    Result, Shard, StoreError, Version,
};

/// One atomic write: the new aggregate row plus the outbox rows describing
/// the change.
///
/// Either everything in the unit is persisted or nothing is.
#[derive(Debug, Clone)]
pub struct UnitOfWork {
    /// The aggregate row to write, carrying its new version.
    pub record: AggregateRecord,

    /// The version the writer loaded. `Version::initial()` means the
    /// aggregate must not exist yet.
    pub expected_version: Version,

    /// Events produced by the change, in order.
    pub messages: Vec<NewOutboxMessage>,
}

impl UnitOfWork {
    pub fn new(
        record: AggregateRecord,
        expected_version: Version,
        messages: Vec<NewOutboxMessage>,
    ) -> Self {
        Self {
            record,
            expected_version,
            messages,
        }
    }

    pub fn aggregate_id(&self) -> AggregateId {
        self.record.aggregate_id
    }

    /// Checks the write-ahead contract before touching storage.
    ///
    /// A mutation must carry at least one outbox message and must advance the
    /// version by exactly one per message, so that the outbox sequence of
    /// message `n` is `expected_version + n`.
    pub fn validate(&self) -> Result<()> {
        if self.messages.is_empty() {
            return Err(StoreError::InvalidUnitOfWork(
                "an aggregate change must produce at least one outbox message".to_string(),
            ));
        }

        let advanced = self.expected_version.advance(self.messages.len());
        if self.record.version != advanced {
            return Err(StoreError::InvalidUnitOfWork(format!(
                "new version {} must be expected version {} plus {} message(s)",
                self.record.version,
                self.expected_version,
                self.messages.len()
            )));
        }

        Ok(())
    }

    /// Outbox sequences of the unit's messages, in order.
    ///
    /// Derived from the version rather than from the rows already stored, so
    /// purging Published rows never makes a sequence repeat.
    pub fn sequences(&self) -> std::ops::Range<i64> {
        let first = self.expected_version.as_i64() + 1;
        first..first + self.messages.len() as i64
    }
}

/// Write side of the persistence substrate.
#[async_trait]
pub trait AggregateStore: Send + Sync {
    /// Loads the current row of an aggregate, or None if it doesn't exist.
    async fn load(&self, aggregate_id: AggregateId) -> Result<Option<AggregateRecord>>;

    /// Atomically writes the aggregate row (compare-and-swap on version) and
    /// appends the unit's messages to the outbox as Pending rows.
    ///
    /// Fails with `ConcurrencyConflict` if the stored version differs from
    /// `unit.expected_version`. Returns the outbox rows as written.
    async fn commit(&self, unit: UnitOfWork) -> Result<Vec<OutboxMessage>>;
}

/// Relay side of the persistence substrate.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Returns up to `limit` Pending rows of aggregates in `shard`, ordered by
    /// `(aggregate_id, sequence)`.
    ///
    /// Aggregates with a Failed row are excluded entirely so that nothing is
    /// delivered past a quarantined message. Aggregates with a Pending row
    /// still backing off are excluded too, so they never take batch slots
    /// from aggregates that can make progress. The limit is filled breadth
    /// first: every eligible aggregate gets its first row before any gets a
    /// second.
    async fn fetch_deliverable(&self, shard: Shard, limit: usize) -> Result<Vec<OutboxMessage>>;

    /// Marks a row Published. Marking an already published row is a no-op.
    async fn mark_published(&self, key: MessageKey, published_at: DateTime<Utc>) -> Result<()>;

    /// Records a failed delivery attempt and schedules the next one.
    ///
    /// Returns the updated attempt count.
    async fn record_failure(
        &self,
        key: MessageKey,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<u32>;

    /// Moves a row to Failed (quarantine).
    async fn mark_failed(&self, key: MessageKey, error: &str) -> Result<()>;

    /// Lists quarantined rows, oldest aggregate/sequence first.
    async fn failed_messages(&self, limit: usize) -> Result<Vec<OutboxMessage>>;

    /// Returns a quarantined row to Pending with a fresh attempt budget.
    async fn requeue(&self, key: MessageKey) -> Result<()>;

    /// Runs an ad-hoc query over the outbox.
    async fn query_messages(&self, query: OutboxQuery) -> Result<Vec<OutboxMessage>>;

    /// Deletes Published rows published before `before`. Pending and Failed
    /// rows are never deleted.
    async fn purge_published(&self, before: DateTime<Utc>) -> Result<u64>;

    /// Claims the right to publish for one aggregate.
    ///
    /// Succeeds if no lease exists, the existing lease expired, or `owner`
    /// already holds it (renewal).
    async fn try_acquire_lease(
        &self,
        aggregate_id: AggregateId,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool>;

    /// Gives up a lease held by `owner`.
    async fn release_lease(&self, aggregate_id: AggregateId, owner: &str) -> Result<()>;
}

/// Converts a std duration into a chrono one, capped at roughly a century so
/// that adding it to a timestamp cannot overflow.
pub fn chrono_duration(duration: Duration) -> chrono::Duration {
    let cap = chrono::Duration::days(36_500);
    chrono::Duration::from_std(duration)
        .map(|d| d.min(cap))
        .unwrap_or(cap)
}
