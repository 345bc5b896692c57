use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::{
    AggregateId, AggregateRecord, MessageKey, OutboxMessage, OutboxQuery, OutboxStatus, Result,
    Shard, StoreError, Version,
    store::{AggregateStore, OutboxStore, UnitOfWork, chrono_duration},
};

#[derive(Debug, Clone)]
struct Lease {
    owner: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct State {
    aggregates: HashMap<AggregateId, AggregateRecord>,
    outbox: BTreeMap<MessageKey, OutboxMessage>,
    leases: HashMap<AggregateId, Lease>,
}

impl State {
    /// Aggregates that cannot deliver right now: quarantined, or with a
    /// Pending row still backing off.
    fn blocked_aggregates(&self, now: DateTime<Utc>) -> HashSet<AggregateId> {
        self.outbox
            .values()
            .filter(|m| {
                m.status == OutboxStatus::Failed || (m.is_pending() && m.is_deferred(now))
            })
            .map(|m| m.aggregate_id)
            .collect()
    }

    fn message_mut(&mut self, key: MessageKey) -> Result<&mut OutboxMessage> {
        self.outbox
            .get_mut(&key)
            .ok_or(StoreError::MessageNotFound(key))
    }
}

/// In-memory store implementation.
///
/// A single lock guards aggregates, outbox rows and leases, which makes
/// every `commit` atomic. Clones share the same state.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<State>>,
}

impl InMemoryStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of outbox rows stored.
    pub async fn message_count(&self) -> usize {
        self.state.read().await.outbox.len()
    }

    /// Returns every outbox row, ordered by `(aggregate_id, sequence)`.
    pub async fn all_messages(&self) -> Vec<OutboxMessage> {
        self.state.read().await.outbox.values().cloned().collect()
    }

    /// Clears all aggregates, messages and leases.
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        state.aggregates.clear();
        state.outbox.clear();
        state.leases.clear();
    }
}

#[async_trait]
impl AggregateStore for InMemoryStore {
    async fn load(&self, aggregate_id: AggregateId) -> Result<Option<AggregateRecord>> {
        Ok(self.state.read().await.aggregates.get(&aggregate_id).cloned())
    }

    async fn commit(&self, unit: UnitOfWork) -> Result<Vec<OutboxMessage>> {
        unit.validate()?;

        let aggregate_id = unit.aggregate_id();
        let mut state = self.state.write().await;

        let actual = state
            .aggregates
            .get(&aggregate_id)
            .map(|r| r.version)
            .unwrap_or(Version::initial());

        if actual != unit.expected_version {
            return Err(StoreError::ConcurrencyConflict {
                aggregate_id,
                expected: unit.expected_version,
                actual,
            });
        }

        let aggregate_type = unit.record.aggregate_type.clone();
        let sequences = unit.sequences();
        let mut written = Vec::with_capacity(unit.messages.len());

        for (sequence, message) in sequences.zip(unit.messages) {
            let row = OutboxMessage::pending(aggregate_id, aggregate_type.clone(), sequence, message);
            state.outbox.insert(row.key(), row.clone());
            written.push(row);
        }

        state.aggregates.insert(aggregate_id, unit.record);

        Ok(written)
    }
}

#[async_trait]
impl OutboxStore for InMemoryStore {
    async fn fetch_deliverable(&self, shard: Shard, limit: usize) -> Result<Vec<OutboxMessage>> {
        let state = self.state.read().await;
        let blocked = state.blocked_aggregates(Utc::now());

        // Rank each row within its aggregate; the outbox map is already
        // ordered by (aggregate_id, sequence).
        let mut ranked: Vec<(usize, &OutboxMessage)> = Vec::new();
        let mut current: Option<(AggregateId, usize)> = None;
        for message in state.outbox.values().filter(|m| {
            m.is_pending() && shard.contains(m.aggregate_id) && !blocked.contains(&m.aggregate_id)
        }) {
            let rank = match current {
                Some((id, rank)) if id == message.aggregate_id => rank + 1,
                _ => 0,
            };
            current = Some((message.aggregate_id, rank));
            ranked.push((rank, message));
        }

        ranked.sort_by_key(|(rank, m)| (*rank, m.aggregate_id));
        ranked.truncate(limit);

        let mut messages: Vec<OutboxMessage> = ranked.into_iter().map(|(_, m)| m.clone()).collect();
        messages.sort_by_key(OutboxMessage::key);
        Ok(messages)
    }

    async fn mark_published(&self, key: MessageKey, published_at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.write().await;
        let message = state.message_mut(key)?;

        if message.status == OutboxStatus::Published {
            return Ok(());
        }

        message.status = OutboxStatus::Published;
        message.published_at = Some(published_at);
        message.next_attempt_at = None;
        Ok(())
    }

    async fn record_failure(
        &self,
        key: MessageKey,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<u32> {
        let mut state = self.state.write().await;
        let message = state.message_mut(key)?;

        message.attempt_count += 1;
        message.last_error = Some(error.to_string());
        message.next_attempt_at = Some(next_attempt_at);
        Ok(message.attempt_count)
    }

    async fn mark_failed(&self, key: MessageKey, error: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let message = state.message_mut(key)?;

        message.status = OutboxStatus::Failed;
        message.last_error = Some(error.to_string());
        message.next_attempt_at = None;
        Ok(())
    }

    async fn failed_messages(&self, limit: usize) -> Result<Vec<OutboxMessage>> {
        let state = self.state.read().await;
        Ok(state
            .outbox
            .values()
            .filter(|m| m.status == OutboxStatus::Failed)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn requeue(&self, key: MessageKey) -> Result<()> {
        let mut state = self.state.write().await;
        let message = state.message_mut(key)?;

        if message.status != OutboxStatus::Failed {
            return Ok(());
        }

        message.status = OutboxStatus::Pending;
        message.attempt_count = 0;
        message.next_attempt_at = None;
        Ok(())
    }

    async fn query_messages(&self, query: OutboxQuery) -> Result<Vec<OutboxMessage>> {
        let state = self.state.read().await;

        let messages = state
            .outbox
            .values()
            .filter(|m| {
                if let Some(id) = query.aggregate_id
                    && m.aggregate_id != id
                {
                    return false;
                }
                if let Some(status) = query.status
                    && m.status != status
                {
                    return false;
                }
                if let Some(ref types) = query.event_types
                    && !types.contains(&m.event_type)
                {
                    return false;
                }
                if let Some(from) = query.from_sequence
                    && m.sequence < from
                {
                    return false;
                }
                true
            })
            .skip(query.offset.unwrap_or(0))
            .take(query.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();

        Ok(messages)
    }

    async fn purge_published(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.write().await;
        let before_len = state.outbox.len();

        state.outbox.retain(|_, m| {
            !(m.status == OutboxStatus::Published && m.published_at.is_some_and(|at| at < before))
        });

        Ok((before_len - state.outbox.len()) as u64)
    }

    async fn try_acquire_lease(
        &self,
        aggregate_id: AggregateId,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let now = Utc::now();
        let mut state = self.state.write().await;

        if let Some(lease) = state.leases.get(&aggregate_id)
            && lease.owner != owner
            && lease.expires_at > now
        {
            return Ok(false);
        }

        state.leases.insert(
            aggregate_id,
            Lease {
                owner: owner.to_string(),
                expires_at: now + chrono_duration(ttl),
            },
        );
        Ok(true)
    }

    async fn release_lease(&self, aggregate_id: AggregateId, owner: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if state
            .leases
            .get(&aggregate_id)
            .is_some_and(|lease| lease.owner == owner)
        {
            state.leases.remove(&aggregate_id);
        }
        Ok(())
    }
}
