//! Shared types for the inventory outbox system.

mod retry;
mod types;

pub use retry::RetryPolicy;
pub use types::{AggregateId, ReservationId, Shard};
