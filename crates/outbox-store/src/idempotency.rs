//! Relay-side deduplication markers.
//!
//! A marker records that the broker acknowledged a given event. The relay
//! checks it before publishing so a row whose `mark_published` write was lost
//! is not sent twice. Consumers must still deduplicate on their own.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{AggregateId, EventId, Result};

/// Tracks which events have already been delivered.
#[async_trait]
pub trait IdempotencyGuard: Send + Sync {
    /// Returns true if the event was already handed to the broker.
    async fn is_handled(&self, aggregate_id: AggregateId, event_id: EventId) -> Result<bool>;

    /// Records that the broker acknowledged the event.
    async fn mark_handled(&self, aggregate_id: AggregateId, event_id: EventId) -> Result<()>;
}

/// Formats the key consumers use to deduplicate an event.
pub fn dedup_key(aggregate_id: AggregateId, event_id: EventId) -> String {
    format!("{aggregate_id}:{event_id}")
}

#[derive(Debug, Default)]
struct Markers {
    seen: HashSet<(AggregateId, EventId)>,
    order: VecDeque<(AggregateId, EventId)>,
}

/// Bounded in-memory guard. Oldest markers are evicted first once
/// `capacity` is reached.
#[derive(Debug, Clone)]
pub struct InMemoryIdempotencyGuard {
    markers: Arc<Mutex<Markers>>,
    capacity: usize,
}

impl InMemoryIdempotencyGuard {
    pub const DEFAULT_CAPACITY: usize = 100_000;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            markers: Arc::new(Mutex::new(Markers::default())),
            capacity: capacity.max(1),
        }
    }

    /// Returns the number of markers currently retained.
    pub async fn len(&self) -> usize {
        self.markers.lock().await.seen.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for InMemoryIdempotencyGuard {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdempotencyGuard for InMemoryIdempotencyGuard {
    async fn is_handled(&self, aggregate_id: AggregateId, event_id: EventId) -> Result<bool> {
        Ok(self
            .markers
            .lock()
            .await
            .seen
            .contains(&(aggregate_id, event_id)))
    }

    async fn mark_handled(&self, aggregate_id: AggregateId, event_id: EventId) -> Result<()> {
        let mut markers = self.markers.lock().await;
        let key = (aggregate_id, event_id);

        if !markers.seen.insert(key) {
            return Ok(());
        }
        markers.order.push_back(key);

        while markers.order.len() > self.capacity {
            if let Some(evicted) = markers.order.pop_front() {
                markers.seen.remove(&evicted);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn marks_and_reports_handled_events() {
        let guard = InMemoryIdempotencyGuard::new();
        let aggregate_id = AggregateId::new();
        let event_id = EventId::new();

        assert!(!guard.is_handled(aggregate_id, event_id).await.unwrap());
        guard.mark_handled(aggregate_id, event_id).await.unwrap();
        assert!(guard.is_handled(aggregate_id, event_id).await.unwrap());

        // Same event under another aggregate is a different key.
        assert!(!guard.is_handled(AggregateId::new(), event_id).await.unwrap());
    }

    #[tokio::test]
    async fn marking_twice_keeps_one_marker() {
        let guard = InMemoryIdempotencyGuard::new();
        let aggregate_id = AggregateId::new();
        let event_id = EventId::new();

        guard.mark_handled(aggregate_id, event_id).await.unwrap();
        guard.mark_handled(aggregate_id, event_id).await.unwrap();

        assert_eq!(guard.len().await, 1);
    }

    #[tokio::test]
    async fn evicts_oldest_when_full() {
        let guard = InMemoryIdempotencyGuard::with_capacity(2);
        let aggregate_id = AggregateId::new();
        let first = EventId::new();
        let second = EventId::new();
        let third = EventId::new();

        guard.mark_handled(aggregate_id, first).await.unwrap();
        guard.mark_handled(aggregate_id, second).await.unwrap();
        guard.mark_handled(aggregate_id, third).await.unwrap();

        assert_eq!(guard.len().await, 2);
        assert!(!guard.is_handled(aggregate_id, first).await.unwrap());
        assert!(guard.is_handled(aggregate_id, third).await.unwrap());
    }

    #[test]
    fn dedup_key_combines_aggregate_and_event() {
        let aggregate_id = AggregateId::new();
        let event_id = EventId::new();
        assert_eq!(
            dedup_key(aggregate_id, event_id),
            format!("{aggregate_id}:{event_id}")
        );
    }
}
