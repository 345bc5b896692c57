//! Command handling infrastructure.
//!
//! The handler turns a command closure into one atomic unit of work: the new
//! aggregate row and one outbox message per produced event are committed
//! together, guarded by a compare-and-swap on the aggregate version.

use std::collections::HashMap;
use std::marker::PhantomData;

use common::{AggregateId, RetryPolicy};
use outbox_store::{
    AggregateRecord, AggregateStore, NewOutboxMessage, OutboxMessage, StoreError, UnitOfWork,
    Version,
};

use crate::aggregate::{Aggregate, DomainEvent};
use crate::error::DomainError;

/// Result of command execution.
#[derive(Debug)]
pub struct CommandResult<A: Aggregate> {
    /// The aggregate after applying the new events.
    pub aggregate: A,

    /// The events that were generated and persisted.
    ///
    /// Empty when the command was an idempotent no-op.
    pub events: Vec<A::Event>,

    /// The version of the aggregate after the command.
    pub new_version: Version,

    /// The outbox rows written alongside the aggregate.
    pub outbox: Vec<OutboxMessage>,
}

/// Trait for commands that can be executed against an aggregate.
///
/// Commands represent an intention to perform an action. They may be rejected
/// if the aggregate's current state doesn't allow the action.
pub trait Command: Send + Sync {
    /// The type of aggregate this command targets.
    type Aggregate: Aggregate;

    /// Returns the ID of the aggregate this command targets.
    fn aggregate_id(&self) -> AggregateId;
}

/// Handler for executing commands against aggregates.
///
/// The handler is responsible for:
/// 1. Loading the aggregate row
/// 2. Executing the command to produce events
/// 3. Committing the new row and its outbox messages atomically
/// 4. Reloading and retrying when another writer won the version race
pub struct CommandHandler<S, A>
where
    S: AggregateStore,
    A: Aggregate,
{
    store: S,
    retry_policy: RetryPolicy,
    _phantom: PhantomData<A>,
}

impl<S, A> CommandHandler<S, A>
where
    S: AggregateStore,
    A: Aggregate,
{
    /// Creates a new command handler with the default retry policy.
    pub fn new(store: S) -> Self {
        Self::with_retry_policy(store, RetryPolicy::default())
    }

    /// Creates a new command handler with a custom conflict retry policy.
    pub fn with_retry_policy(store: S, retry_policy: RetryPolicy) -> Self {
        Self {
            store,
            retry_policy,
            _phantom: PhantomData,
        }
    }

    /// Returns a reference to the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Loads an aggregate from the store.
    ///
    /// If the aggregate doesn't exist, returns a default instance.
    pub async fn load(&self, aggregate_id: AggregateId) -> Result<A, DomainError> {
        Ok(self.load_existing(aggregate_id).await?.unwrap_or_default())
    }

    /// Loads an aggregate, returning None if it doesn't exist.
    pub async fn load_existing(&self, aggregate_id: AggregateId) -> Result<Option<A>, DomainError> {
        let Some(record) = self.store.load(aggregate_id).await? else {
            return Ok(None);
        };

        let version = record.version;
        let mut aggregate: A = record.into_state()?;
        aggregate.set_version(version);
        Ok(Some(aggregate))
    }

    /// Executes a command that may create the aggregate.
    ///
    /// The command function receives the current aggregate state (default
    /// for a new aggregate) and returns the events to apply or an error. It
    /// may run more than once when a concurrent writer forces a retry.
    pub async fn execute<F>(
        &self,
        aggregate_id: AggregateId,
        command_fn: F,
    ) -> Result<CommandResult<A>, DomainError>
    where
        F: Fn(&A) -> Result<Vec<A::Event>, A::Error>,
        DomainError: From<A::Error>,
    {
        self.run(aggregate_id, false, &HashMap::new(), command_fn)
            .await
    }

    /// Executes a command against an aggregate that must already exist.
    ///
    /// Fails with `AggregateNotFound` if there is no stored row.
    pub async fn execute_existing<F>(
        &self,
        aggregate_id: AggregateId,
        command_fn: F,
    ) -> Result<CommandResult<A>, DomainError>
    where
        F: Fn(&A) -> Result<Vec<A::Event>, A::Error>,
        DomainError: From<A::Error>,
    {
        self.run(aggregate_id, true, &HashMap::new(), command_fn)
            .await
    }

    /// Like `execute` / `execute_existing`, attaching `metadata` to every
    /// outbox message the command produces.
    pub async fn execute_with_metadata<F>(
        &self,
        aggregate_id: AggregateId,
        require_existing: bool,
        metadata: &HashMap<String, serde_json::Value>,
        command_fn: F,
    ) -> Result<CommandResult<A>, DomainError>
    where
        F: Fn(&A) -> Result<Vec<A::Event>, A::Error>,
        DomainError: From<A::Error>,
    {
        self.run(aggregate_id, require_existing, metadata, command_fn)
            .await
    }

    async fn run<F>(
        &self,
        aggregate_id: AggregateId,
        require_existing: bool,
        metadata: &HashMap<String, serde_json::Value>,
        command_fn: F,
    ) -> Result<CommandResult<A>, DomainError>
    where
        F: Fn(&A) -> Result<Vec<A::Event>, A::Error>,
        DomainError: From<A::Error>,
    {
        let mut attempt = 0;

        loop {
            attempt += 1;

            let aggregate = match self.load_existing(aggregate_id).await? {
                Some(aggregate) => aggregate,
                None if require_existing => {
                    return Err(DomainError::AggregateNotFound {
                        aggregate_type: A::aggregate_type(),
                        aggregate_id,
                    });
                }
                None => A::default(),
            };

            match self
                .try_commit(aggregate_id, aggregate, metadata, &command_fn)
                .await
            {
                Err(DomainError::Persistence(StoreError::ConcurrencyConflict {
                    expected,
                    actual,
                    ..
                })) => {
                    metrics::counter!("inventory_concurrency_retries_total").increment(1);

                    if !self.retry_policy.should_retry(attempt) {
                        tracing::warn!(
                            %aggregate_id,
                            attempts = attempt,
                            "giving up after repeated version conflicts"
                        );
                        return Err(DomainError::ConcurrencyConflict {
                            aggregate_id,
                            attempts: attempt,
                        });
                    }

                    let delay = self.retry_policy.delay_for_attempt(attempt);
                    tracing::debug!(
                        %aggregate_id,
                        %expected,
                        %actual,
                        attempt,
                        ?delay,
                        "version conflict, reloading"
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    async fn try_commit<F>(
        &self,
        aggregate_id: AggregateId,
        mut aggregate: A,
        metadata: &HashMap<String, serde_json::Value>,
        command_fn: &F,
    ) -> Result<CommandResult<A>, DomainError>
    where
        F: Fn(&A) -> Result<Vec<A::Event>, A::Error>,
        DomainError: From<A::Error>,
    {
        let current_version = aggregate.version();

        let events = command_fn(&aggregate)?;

        if events.is_empty() {
            return Ok(CommandResult {
                aggregate,
                events: vec![],
                new_version: current_version,
                outbox: vec![],
            });
        }

        let messages = Self::build_messages(&events, metadata)?;

        for event in &events {
            aggregate.apply(event.clone());
        }
        aggregate.check_invariants()?;

        let new_version = current_version.advance(events.len());
        aggregate.set_version(new_version);

        let record =
            AggregateRecord::from_state(aggregate_id, A::aggregate_type(), new_version, &aggregate)?;

        let outbox = self
            .store
            .commit(UnitOfWork::new(record, current_version, messages))
            .await?;

        Ok(CommandResult {
            aggregate,
            events,
            new_version,
            outbox,
        })
    }

    /// Builds outbox messages from domain events.
    fn build_messages(
        events: &[A::Event],
        metadata: &HashMap<String, serde_json::Value>,
    ) -> Result<Vec<NewOutboxMessage>, DomainError> {
        events
            .iter()
            .map(|event| {
                let mut message = NewOutboxMessage::from_event(event.event_type(), event)?;
                message.metadata.extend(metadata.clone());
                Ok(message)
            })
            .collect()
    }
}
