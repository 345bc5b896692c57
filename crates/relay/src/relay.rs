//! The outbox relay: moves Pending rows to the broker.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use common::{AggregateId, RetryPolicy};
use futures_util::future::join_all;
use outbox_store::{
    IdempotencyGuard, InMemoryIdempotencyGuard, OutboxMessage, OutboxQuery, OutboxStatus,
    OutboxStore, chrono_duration,
};
use tokio::sync::watch;

use crate::Result;
use crate::broker::{Broker, BrokerError, PublishedEvent};
use crate::config::RelayConfig;

/// Counts of what one drain did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Rows acknowledged by the broker and marked Published.
    pub published: usize,

    /// Rows the idempotency guard already knew about; marked Published
    /// without a broker call.
    pub skipped_duplicates: usize,

    /// Failed publishes that were rescheduled.
    pub retried: usize,

    /// Rows moved to Failed after exhausting their attempts.
    pub quarantined: usize,

    /// Aggregates whose next row was still backing off.
    pub deferred: usize,

    /// Aggregates skipped, or cut short, because another worker held their
    /// lease.
    pub contended: usize,
}

impl DrainReport {
    fn merge(&mut self, other: DrainReport) {
        self.published += other.published;
        self.skipped_duplicates += other.skipped_duplicates;
        self.retried += other.retried;
        self.quarantined += other.quarantined;
        self.deferred += other.deferred;
        self.contended += other.contended;
    }

    /// Returns true if the drain made no progress.
    pub fn is_idle(&self) -> bool {
        self.published == 0 && self.skipped_duplicates == 0 && self.retried == 0 && self.quarantined == 0
    }
}

/// Publishes outbox rows in per-aggregate order.
///
/// Rows of one aggregate are sent strictly by sequence; a row is only
/// attempted once every earlier row of the same aggregate is Published.
/// A failing row blocks its own aggregate and nothing else. Aggregates are
/// split across workers by partition and, within a partition, guarded by a
/// lease so two workers never publish for the same aggregate at once. The
/// lease is renewed before every publish; a worker that cannot renew it
/// stops publishing for that aggregate.
pub struct OutboxRelay<S: OutboxStore> {
    store: S,
    broker: Arc<dyn Broker>,
    guard: Arc<dyn IdempotencyGuard>,
    config: RelayConfig,
    backoff: RetryPolicy,
}

impl<S: OutboxStore> OutboxRelay<S> {
    /// Creates a relay with a private in-memory idempotency guard.
    pub fn new(store: S, broker: Arc<dyn Broker>, config: RelayConfig) -> Self {
        let config = config.normalized();
        let backoff = config.backoff_policy();
        Self {
            store,
            broker,
            guard: Arc::new(InMemoryIdempotencyGuard::new()),
            config,
            backoff,
        }
    }

    /// Replaces the idempotency guard. Workers that may see the same rows
    /// should share one.
    pub fn with_idempotency_guard(mut self, guard: Arc<dyn IdempotencyGuard>) -> Self {
        self.guard = guard;
        self
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Runs one pass over the deliverable rows of this worker's shard.
    ///
    /// Broker failures are recorded on the rows and never returned; an error
    /// here means the store itself failed.
    #[tracing::instrument(skip(self), fields(worker = %self.config.worker_id, shard = %self.config.shard()))]
    pub async fn drain_once(&self) -> Result<DrainReport> {
        let rows = self
            .store
            .fetch_deliverable(self.config.shard(), self.config.batch_size)
            .await?;

        let mut groups: BTreeMap<AggregateId, Vec<OutboxMessage>> = BTreeMap::new();
        for row in rows {
            groups.entry(row.aggregate_id).or_default().push(row);
        }

        if groups.is_empty() {
            return Ok(DrainReport::default());
        }

        let results = join_all(
            groups
                .into_iter()
                .map(|(aggregate_id, messages)| self.drain_aggregate(aggregate_id, messages)),
        )
        .await;

        let mut report = DrainReport::default();
        for result in results {
            match result {
                Ok(partial) => report.merge(partial),
                Err(e) => tracing::error!(error = %e, "failed to drain aggregate"),
            }
        }

        if !report.is_idle() {
            tracing::debug!(?report, "drain complete");
        }

        Ok(report)
    }

    async fn drain_aggregate(
        &self,
        aggregate_id: AggregateId,
        messages: Vec<OutboxMessage>,
    ) -> Result<DrainReport> {
        let mut report = DrainReport::default();
        let owner = self.config.worker_id.as_str();

        if !self
            .store
            .try_acquire_lease(aggregate_id, owner, self.config.lease_ttl)
            .await?
        {
            metrics::counter!("outbox_lease_contended_total").increment(1);
            report.contended = 1;
            return Ok(report);
        }

        let result = match self.reread(aggregate_id, &messages).await {
            Ok(current) => self.deliver_in_order(aggregate_id, current, &mut report).await,
            Err(e) => Err(e),
        };

        if let Err(e) = self.store.release_lease(aggregate_id, owner).await {
            tracing::warn!(%aggregate_id, error = %e, "failed to release lease");
        }

        result.map(|()| report)
    }

    /// Reloads the fetched rows now that the lease is held; the batch was
    /// read before it and another worker may have moved them on since.
    async fn reread(
        &self,
        aggregate_id: AggregateId,
        fetched: &[OutboxMessage],
    ) -> Result<Vec<OutboxMessage>> {
        let Some(first) = fetched.first() else {
            return Ok(Vec::new());
        };
        let query = OutboxQuery::for_aggregate(aggregate_id)
            .from_sequence(first.sequence)
            .limit(fetched.len());
        Ok(self.store.query_messages(query).await?)
    }

    async fn deliver_in_order(
        &self,
        aggregate_id: AggregateId,
        messages: Vec<OutboxMessage>,
        report: &mut DrainReport,
    ) -> Result<()> {
        let owner = self.config.worker_id.as_str();

        for (index, message) in messages.into_iter().enumerate() {
            match message.status {
                OutboxStatus::Published => continue,
                OutboxStatus::Failed => break,
                OutboxStatus::Pending => {}
            }

            // The lease was just taken for the first row; renew it for the rest.
            if index > 0
                && !self
                    .store
                    .try_acquire_lease(aggregate_id, owner, self.config.lease_ttl)
                    .await?
            {
                metrics::counter!("outbox_lease_lost_total").increment(1);
                tracing::warn!(%aggregate_id, key = %message.key(), "lease taken over, stopping");
                report.contended += 1;
                break;
            }

            if message.is_deferred(Utc::now()) {
                report.deferred += 1;
                break;
            }

            if self
                .guard
                .is_handled(message.aggregate_id, message.event_id)
                .await?
            {
                self.store.mark_published(message.key(), Utc::now()).await?;
                metrics::counter!("outbox_duplicates_skipped_total").increment(1);
                tracing::debug!(key = %message.key(), "already delivered, marking published");
                report.skipped_duplicates += 1;
                continue;
            }

            match self.publish(&message).await {
                Ok(()) => {
                    self.guard
                        .mark_handled(message.aggregate_id, message.event_id)
                        .await?;
                    self.store.mark_published(message.key(), Utc::now()).await?;
                    metrics::counter!("outbox_messages_published_total", "event_type" => message.event_type.clone())
                        .increment(1);
                    report.published += 1;
                }
                Err(error) => {
                    if self.record_failure(&message, &error).await? {
                        report.quarantined += 1;
                    } else {
                        report.retried += 1;
                    }
                    break;
                }
            }
        }

        Ok(())
    }

    async fn publish(&self, message: &OutboxMessage) -> std::result::Result<(), BrokerError> {
        let event = PublishedEvent::from_message(message);
        let subject = event.subject(&self.config.topic_prefix);
        let timeout = self.config.publish_timeout;

        let started = Instant::now();
        let outcome = tokio::time::timeout(timeout, self.broker.publish(&subject, &event))
            .await
            .unwrap_or(Err(BrokerError::Timeout(timeout)));
        metrics::histogram!("outbox_publish_duration_seconds").record(started.elapsed().as_secs_f64());

        outcome
    }

    /// Records a failed attempt. Returns true if the row was quarantined.
    async fn record_failure(&self, message: &OutboxMessage, error: &BrokerError) -> Result<bool> {
        let key = message.key();
        let reason = error.to_string();
        let delay = self.backoff.delay_for_attempt(message.attempt_count + 1);
        let next_attempt_at = Utc::now() + chrono_duration(delay);

        let attempts = self
            .store
            .record_failure(key, &reason, next_attempt_at)
            .await?;
        metrics::counter!("outbox_publish_failures_total").increment(1);

        if self.backoff.should_retry(attempts) {
            tracing::warn!(%key, attempts, ?delay, error = %reason, "publish failed, will retry");
            return Ok(false);
        }

        self.store.mark_failed(key, &reason).await?;
        metrics::counter!("outbox_messages_quarantined_total").increment(1);
        tracing::error!(
            %key,
            event_id = %message.event_id,
            attempts,
            error = %reason,
            "message quarantined, aggregate blocked until requeued"
        );
        Ok(true)
    }

    /// Drains until `shutdown` flips to true.
    ///
    /// Sleeps `poll_interval` between idle drains; when a drain made progress
    /// the next one starts immediately.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            worker = %self.config.worker_id,
            shard = %self.config.shard(),
            "relay started"
        );

        while !*shutdown.borrow() {
            let busy = match self.drain_once().await {
                Ok(report) => !report.is_idle(),
                Err(e) => {
                    metrics::counter!("outbox_drain_errors_total").increment(1);
                    tracing::error!(error = %e, "drain failed");
                    false
                }
            };

            if busy {
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!(worker = %self.config.worker_id, "relay stopped");
    }
}
