//! Core aggregate and domain event traits.

use common::AggregateId;
use outbox_store::Version;
use serde::{Serialize, de::DeserializeOwned};

/// Trait for domain events.
///
/// Domain events represent facts that have happened in the domain.
/// They are immutable and should be named in past tense. Every event an
/// aggregate produces is written to the outbox as one message.
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync + Clone {
    /// Returns the event type name.
    ///
    /// Used as the outbox `event_type` and in the broker subject.
    fn event_type(&self) -> &'static str;
}

/// Trait for aggregates persisted as a single state row.
///
/// The whole state is serialized into the aggregate row on every commit,
/// next to the outbox messages describing the change. Aggregates:
/// - Validate commands against their current state and return events
/// - Apply events to update state (pure, deterministic)
/// - Re-check their invariants before anything is written
pub trait Aggregate: Default + Clone + Serialize + DeserializeOwned + Send + Sync + Sized {
    /// The type of events this aggregate produces.
    type Event: DomainEvent;

    /// The type of errors this aggregate can produce.
    type Error: std::error::Error + Send + Sync;

    /// Returns the aggregate type name stored with the row and every message.
    fn aggregate_type() -> &'static str;

    /// Returns the aggregate's unique identifier.
    ///
    /// Returns None for a new, uninitialized aggregate.
    fn id(&self) -> Option<AggregateId>;

    /// Returns the current version of the aggregate.
    ///
    /// Version is 0 for an aggregate that has never been stored and grows by
    /// one per applied event.
    fn version(&self) -> Version;

    /// Sets the aggregate version.
    ///
    /// Called by the command handler after loading and after committing.
    fn set_version(&mut self, version: Version);

    /// Applies an event to the aggregate, updating its state.
    ///
    /// This method must be pure and deterministic and must not fail.
    fn apply(&mut self, event: Self::Event);

    /// Verifies state invariants after events have been applied.
    ///
    /// A violation aborts the unit of work before anything is persisted.
    fn check_invariants(&self) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Applies multiple events in sequence.
    fn apply_events(&mut self, events: impl IntoIterator<Item = Self::Event>) {
        for event in events {
            self.apply(event);
        }
    }
}
