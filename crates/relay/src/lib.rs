//! Outbox relay.
//!
//! Polls the outbox for Pending rows and hands them to a [`Broker`],
//! preserving per-aggregate order, backing off on failure and quarantining
//! rows that keep failing. Delivery is at-least-once; every published event
//! carries a `dedup_key` consumers can deduplicate on.

pub mod broker;
pub mod config;
pub mod error;
#[cfg(feature = "nats")]
pub mod nats;
pub mod relay;

pub use broker::{Broker, BrokerError, Delivery, InMemoryBroker, PublishedEvent, TracingBroker};
pub use config::RelayConfig;
pub use error::{RelayError, Result};
#[cfg(feature = "nats")]
pub use nats::JetStreamBroker;
pub use relay::{DrainReport, OutboxRelay};
