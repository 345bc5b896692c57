pub mod error;
pub mod idempotency;
pub mod memory;
pub mod message;
pub mod postgres;
pub mod query;
pub mod record;
pub mod store;

pub use common::{AggregateId, Shard};
pub use error::{Result, StoreError};
pub use idempotency::{IdempotencyGuard, InMemoryIdempotencyGuard, dedup_key};
pub use memory::InMemoryStore;
pub use message::{EventId, MessageKey, NewOutboxMessage, OutboxMessage, OutboxStatus};
pub use postgres::{PostgresIdempotencyGuard, PostgresStore};
pub use query::OutboxQuery;
pub use record::{AggregateRecord, Version};
pub use store::{AggregateStore, OutboxStore, UnitOfWork, chrono_duration};
