//! Broker contract and the envelope handed to it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::AggregateId;
use outbox_store::{EventId, OutboxMessage, dedup_key};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

/// Delivery failures. All of them are transient from the relay's point of
/// view: the message stays Pending and is retried with backoff.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// The broker did not acknowledge within the publish timeout.
    #[error("publish timed out after {0:?}")]
    Timeout(Duration),

    /// The broker rejected the message.
    #[error("broker rejected message: {0}")]
    Nack(String),

    /// The broker could not be reached.
    #[error("broker connection failed: {0}")]
    Connection(String),
}

/// The message as seen by subscribers.
///
/// Consumers must deduplicate on `dedup_key` (or `event_id`); delivery is
/// at-least-once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedEvent {
    pub event_type: String,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,
    pub event_id: EventId,

    /// Position of the event within its aggregate's stream.
    pub sequence: i64,

    pub occurred_at: DateTime<Utc>,
    pub dedup_key: String,
    pub payload: serde_json::Value,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl PublishedEvent {
    pub fn from_message(message: &OutboxMessage) -> Self {
        Self {
            event_type: message.event_type.clone(),
            aggregate_id: message.aggregate_id,
            aggregate_type: message.aggregate_type.clone(),
            event_id: message.event_id,
            sequence: message.sequence,
            occurred_at: message.created_at,
            dedup_key: dedup_key(message.aggregate_id, message.event_id),
            payload: message.payload.clone(),
            metadata: message.metadata.clone(),
        }
    }

    /// Returns `{prefix}.{aggregate_type}.{event_type}`.
    pub fn subject(&self, prefix: &str) -> String {
        format!("{prefix}.{}.{}", self.aggregate_type, self.event_type)
    }
}

/// A message broker with at-least-once semantics.
///
/// `publish` must only return `Ok` once the broker has durably accepted the
/// message.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, subject: &str, event: &PublishedEvent) -> Result<(), BrokerError>;
}

#[async_trait]
impl<B: Broker + ?Sized> Broker for Arc<B> {
    async fn publish(&self, subject: &str, event: &PublishedEvent) -> Result<(), BrokerError> {
        (**self).publish(subject, event).await
    }
}

/// A delivery recorded by [`InMemoryBroker`].
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub subject: String,
    pub event: PublishedEvent,
}

#[derive(Debug, Default)]
struct BrokerState {
    deliveries: Vec<Delivery>,
    scripted_failures: VecDeque<BrokerError>,
    unavailable: HashSet<AggregateId>,
    latency: Option<Duration>,
    attempts: usize,
}

/// Broker that keeps deliveries in memory, with injectable failures and
/// latency.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` publishes fail with `error`.
    pub async fn fail_next(&self, count: usize, error: BrokerError) {
        let mut state = self.state.lock().await;
        state
            .scripted_failures
            .extend(std::iter::repeat_n(error, count));
    }

    /// Rejects every publish for `aggregate_id` until [`Self::restore`].
    pub async fn reject_aggregate(&self, aggregate_id: AggregateId) {
        self.state.lock().await.unavailable.insert(aggregate_id);
    }

    pub async fn restore(&self, aggregate_id: AggregateId) {
        self.state.lock().await.unavailable.remove(&aggregate_id);
    }

    /// Delays every publish by `latency`.
    pub async fn set_latency(&self, latency: Option<Duration>) {
        self.state.lock().await.latency = latency;
    }

    /// Returns successful deliveries in order.
    pub async fn deliveries(&self) -> Vec<Delivery> {
        self.state.lock().await.deliveries.clone()
    }

    pub async fn events(&self) -> Vec<PublishedEvent> {
        self.deliveries().await.into_iter().map(|d| d.event).collect()
    }

    /// Returns the successfully delivered events of one aggregate.
    pub async fn events_for(&self, aggregate_id: AggregateId) -> Vec<PublishedEvent> {
        self.events()
            .await
            .into_iter()
            .filter(|e| e.aggregate_id == aggregate_id)
            .collect()
    }

    /// Number of publish calls, successful or not.
    pub async fn attempts(&self) -> usize {
        self.state.lock().await.attempts
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(&self, subject: &str, event: &PublishedEvent) -> Result<(), BrokerError> {
        let latency = {
            let mut state = self.state.lock().await;
            state.attempts += 1;
            state.latency
        };

        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock().await;

        if let Some(error) = state.scripted_failures.pop_front() {
            return Err(error);
        }

        if state.unavailable.contains(&event.aggregate_id) {
            return Err(BrokerError::Nack(format!(
                "aggregate {} rejected",
                event.aggregate_id
            )));
        }

        state.deliveries.push(Delivery {
            subject: subject.to_string(),
            event: event.clone(),
        });
        Ok(())
    }
}

/// Broker that only logs. Useful when running the relay without a real
/// broker.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingBroker;

#[async_trait]
impl Broker for TracingBroker {
    async fn publish(&self, subject: &str, event: &PublishedEvent) -> Result<(), BrokerError> {
        tracing::info!(
            subject,
            aggregate_id = %event.aggregate_id,
            sequence = event.sequence,
            dedup_key = %event.dedup_key,
            "event published"
        );
        Ok(())
    }
}
