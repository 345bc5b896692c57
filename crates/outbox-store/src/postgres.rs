use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};
use uuid::Uuid;

use crate::{
    AggregateId, AggregateRecord, EventId, IdempotencyGuard, MessageKey, OutboxMessage,
    OutboxQuery, Result, Shard, StoreError, Version,
    store::{AggregateStore, OutboxStore, UnitOfWork, chrono_duration},
};

const MESSAGE_COLUMNS: &str = "aggregate_id, sequence, event_id, aggregate_type, event_type, \
     payload, metadata, status, attempt_count, last_error, created_at, published_at, next_attempt_at";

/// PostgreSQL-backed aggregate and outbox store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Creates a new PostgreSQL store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_record(row: PgRow) -> Result<AggregateRecord> {
        Ok(AggregateRecord {
            aggregate_id: AggregateId::from_uuid(row.try_get::<Uuid, _>("aggregate_id")?),
            aggregate_type: row.try_get("aggregate_type")?,
            version: Version::new(row.try_get("version")?),
            updated_at: row.try_get("updated_at")?,
            state: row.try_get("state")?,
        })
    }

    fn row_to_message(row: PgRow) -> Result<OutboxMessage> {
        let metadata_json: serde_json::Value = row.try_get("metadata")?;
        let metadata: HashMap<String, serde_json::Value> = serde_json::from_value(metadata_json)?;

        let status: String = row.try_get("status")?;
        let attempt_count: i32 = row.try_get("attempt_count")?;

        Ok(OutboxMessage {
            aggregate_id: AggregateId::from_uuid(row.try_get::<Uuid, _>("aggregate_id")?),
            sequence: row.try_get("sequence")?,
            event_id: EventId::from_uuid(row.try_get::<Uuid, _>("event_id")?),
            aggregate_type: row.try_get("aggregate_type")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            metadata,
            status: status.parse().map_err(StoreError::CorruptRow)?,
            attempt_count: u32::try_from(attempt_count).map_err(|_| {
                StoreError::CorruptRow(format!("negative attempt_count {attempt_count}"))
            })?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            published_at: row.try_get("published_at")?,
            next_attempt_at: row.try_get("next_attempt_at")?,
        })
    }

    async fn stored_version(
        tx: &mut Transaction<'_, Postgres>,
        aggregate_id: AggregateId,
    ) -> Result<Version> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT version FROM aggregates WHERE aggregate_id = $1")
                .bind(aggregate_id.as_uuid())
                .fetch_optional(&mut **tx)
                .await?;

        Ok(version.map(Version::new).unwrap_or(Version::initial()))
    }
}

#[async_trait]
impl AggregateStore for PostgresStore {
    async fn load(&self, aggregate_id: AggregateId) -> Result<Option<AggregateRecord>> {
        let row: Option<PgRow> = sqlx::query(
            r#"
            SELECT aggregate_id, aggregate_type, version, state, updated_at
            FROM aggregates
            WHERE aggregate_id = $1
            "#,
        )
        .bind(aggregate_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_record).transpose()
    }

    async fn commit(&self, unit: UnitOfWork) -> Result<Vec<OutboxMessage>> {
        unit.validate()?;

        let aggregate_id = unit.aggregate_id();
        let expected = unit.expected_version;
        let mut tx = self.pool.begin().await?;

        // Sequences come from the version, so the compare-and-swap below is
        // what keeps them unique per aggregate.
        let written = if expected == Version::initial() {
            sqlx::query(
                r#"
                INSERT INTO aggregates (aggregate_id, aggregate_type, version, state, updated_at)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (aggregate_id) DO NOTHING
                "#,
            )
            .bind(aggregate_id.as_uuid())
            .bind(&unit.record.aggregate_type)
            .bind(unit.record.version.as_i64())
            .bind(&unit.record.state)
            .bind(unit.record.updated_at)
            .execute(&mut *tx)
            .await?
        } else {
            sqlx::query(
                r#"
                UPDATE aggregates
                SET aggregate_type = $2, version = $3, state = $4, updated_at = $5
                WHERE aggregate_id = $1 AND version = $6
                "#,
            )
            .bind(aggregate_id.as_uuid())
            .bind(&unit.record.aggregate_type)
            .bind(unit.record.version.as_i64())
            .bind(&unit.record.state)
            .bind(unit.record.updated_at)
            .bind(expected.as_i64())
            .execute(&mut *tx)
            .await?
        };

        if written.rows_affected() == 0 {
            let actual = Self::stored_version(&mut tx, aggregate_id).await?;
            tracing::debug!(%aggregate_id, %expected, %actual, "aggregate version conflict");
            return Err(StoreError::ConcurrencyConflict {
                aggregate_id,
                expected,
                actual,
            });
        }

        let aggregate_type = unit.record.aggregate_type.clone();
        let sequences = unit.sequences();
        let mut rows = Vec::with_capacity(unit.messages.len());

        for (sequence, message) in sequences.zip(unit.messages) {
            let row = OutboxMessage::pending(aggregate_id, aggregate_type.clone(), sequence, message);
            let metadata_json = serde_json::to_value(&row.metadata)?;

            sqlx::query(
                r#"
                INSERT INTO outbox_messages
                    (aggregate_id, sequence, event_id, aggregate_type, event_type, payload, metadata, status, created_at, partition_hash)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(row.aggregate_id.as_uuid())
            .bind(row.sequence)
            .bind(row.event_id.as_uuid())
            .bind(&row.aggregate_type)
            .bind(&row.event_type)
            .bind(&row.payload)
            .bind(metadata_json)
            .bind(row.status.as_str())
            .bind(row.created_at)
            .bind(aggregate_id.partition_hash())
            .execute(&mut *tx)
            .await?;

            rows.push(row);
        }

        tx.commit().await?;
        Ok(rows)
    }
}

#[async_trait]
impl OutboxStore for PostgresStore {
    async fn fetch_deliverable(&self, shard: Shard, limit: usize) -> Result<Vec<OutboxMessage>> {
        // Blocked aggregates are those with a quarantined row or a Pending
        // row still backing off. Rows are ranked within their aggregate so
        // the limit is filled breadth first.
        let sql = format!(
            r#"
            SELECT {MESSAGE_COLUMNS}
            FROM (
                SELECT m.*,
                       ROW_NUMBER() OVER (PARTITION BY m.aggregate_id ORDER BY m.sequence) AS row_rank
                FROM outbox_messages m
                WHERE m.status = 'pending'
                  AND m.partition_hash % $1 = $2
                  AND NOT EXISTS (
                      SELECT 1 FROM outbox_messages b
                      WHERE b.aggregate_id = m.aggregate_id
                        AND (b.status = 'failed'
                             OR (b.status = 'pending' AND b.next_attempt_at > $3))
                  )
            ) ranked
            ORDER BY row_rank ASC, aggregate_id ASC
            LIMIT $4
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(i64::from(shard.count()))
            .bind(i64::from(shard.index()))
            .bind(Utc::now())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        let mut messages = rows
            .into_iter()
            .map(Self::row_to_message)
            .collect::<Result<Vec<_>>>()?;
        messages.sort_by_key(OutboxMessage::key);
        Ok(messages)
    }

    async fn mark_published(&self, key: MessageKey, published_at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET status = 'published', published_at = $3, next_attempt_at = NULL
            WHERE aggregate_id = $1 AND sequence = $2 AND status <> 'published'
            "#,
        )
        .bind(key.aggregate_id.as_uuid())
        .bind(key.sequence)
        .bind(published_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let exists: bool = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM outbox_messages WHERE aggregate_id = $1 AND sequence = $2)",
            )
            .bind(key.aggregate_id.as_uuid())
            .bind(key.sequence)
            .fetch_one(&self.pool)
            .await?;

            if !exists {
                return Err(StoreError::MessageNotFound(key));
            }
        }
        Ok(())
    }

    async fn record_failure(
        &self,
        key: MessageKey,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<u32> {
        let attempts: Option<i32> = sqlx::query_scalar(
            r#"
            UPDATE outbox_messages
            SET attempt_count = attempt_count + 1, last_error = $3, next_attempt_at = $4
            WHERE aggregate_id = $1 AND sequence = $2
            RETURNING attempt_count
            "#,
        )
        .bind(key.aggregate_id.as_uuid())
        .bind(key.sequence)
        .bind(error)
        .bind(next_attempt_at)
        .fetch_optional(&self.pool)
        .await?;

        let attempts = attempts.ok_or(StoreError::MessageNotFound(key))?;
        u32::try_from(attempts)
            .map_err(|_| StoreError::CorruptRow(format!("negative attempt_count {attempts}")))
    }

    async fn mark_failed(&self, key: MessageKey, error: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET status = 'failed', last_error = $3, next_attempt_at = NULL
            WHERE aggregate_id = $1 AND sequence = $2
            "#,
        )
        .bind(key.aggregate_id.as_uuid())
        .bind(key.sequence)
        .bind(error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::MessageNotFound(key));
        }
        Ok(())
    }

    async fn failed_messages(&self, limit: usize) -> Result<Vec<OutboxMessage>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM outbox_messages WHERE status = 'failed' \
             ORDER BY aggregate_id ASC, sequence ASC LIMIT $1"
        );

        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Self::row_to_message).collect()
    }

    async fn requeue(&self, key: MessageKey) -> Result<()> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM outbox_messages WHERE aggregate_id = $1 AND sequence = $2)",
        )
        .bind(key.aggregate_id.as_uuid())
        .bind(key.sequence)
        .fetch_one(&self.pool)
        .await?;

        if !exists {
            return Err(StoreError::MessageNotFound(key));
        }

        sqlx::query(
            r#"
            UPDATE outbox_messages
            SET status = 'pending', attempt_count = 0, next_attempt_at = NULL
            WHERE aggregate_id = $1 AND sequence = $2 AND status = 'failed'
            "#,
        )
        .bind(key.aggregate_id.as_uuid())
        .bind(key.sequence)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn query_messages(&self, query: OutboxQuery) -> Result<Vec<OutboxMessage>> {
        let mut sql = format!("SELECT {MESSAGE_COLUMNS} FROM outbox_messages WHERE 1=1");
        let mut param_count = 0;

        if query.aggregate_id.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND aggregate_id = ${param_count}"));
        }
        if query.status.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND status = ${param_count}"));
        }
        if query.event_types.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND event_type = ANY(${param_count})"));
        }
        if query.from_sequence.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND sequence >= ${param_count}"));
        }

        sql.push_str(" ORDER BY aggregate_id ASC, sequence ASC");

        if query.limit.is_some() {
            param_count += 1;
            sql.push_str(&format!(" LIMIT ${param_count}"));
        }
        if query.offset.is_some() {
            param_count += 1;
            sql.push_str(&format!(" OFFSET ${param_count}"));
        }

        let mut sqlx_query = sqlx::query(&sql);

        if let Some(id) = query.aggregate_id {
            sqlx_query = sqlx_query.bind(id.as_uuid());
        }
        if let Some(status) = query.status {
            sqlx_query = sqlx_query.bind(status.as_str());
        }
        if let Some(event_types) = query.event_types {
            sqlx_query = sqlx_query.bind(event_types);
        }
        if let Some(from) = query.from_sequence {
            sqlx_query = sqlx_query.bind(from);
        }
        if let Some(limit) = query.limit {
            sqlx_query = sqlx_query.bind(limit as i64);
        }
        if let Some(offset) = query.offset {
            sqlx_query = sqlx_query.bind(offset as i64);
        }

        let rows = sqlx_query.fetch_all(&self.pool).await?;
        rows.into_iter().map(Self::row_to_message).collect()
    }

    async fn purge_published(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM outbox_messages WHERE status = 'published' AND published_at < $1",
        )
        .bind(before)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn try_acquire_lease(
        &self,
        aggregate_id: AggregateId,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO outbox_leases (aggregate_id, owner, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (aggregate_id) DO UPDATE
            SET owner = EXCLUDED.owner, expires_at = EXCLUDED.expires_at
            WHERE outbox_leases.expires_at <= $4 OR outbox_leases.owner = EXCLUDED.owner
            "#,
        )
        .bind(aggregate_id.as_uuid())
        .bind(owner)
        .bind(now + chrono_duration(ttl))
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_lease(&self, aggregate_id: AggregateId, owner: &str) -> Result<()> {
        sqlx::query("DELETE FROM outbox_leases WHERE aggregate_id = $1 AND owner = $2")
            .bind(aggregate_id.as_uuid())
            .bind(owner)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Idempotency markers kept in `relay_processed_messages`.
///
/// Shares the outbox database so markers survive relay restarts.
#[derive(Clone)]
pub struct PostgresIdempotencyGuard {
    pool: PgPool,
}

impl PostgresIdempotencyGuard {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Deletes markers recorded before `before`.
    pub async fn purge_before(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM relay_processed_messages WHERE processed_at < $1")
            .bind(before)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl IdempotencyGuard for PostgresIdempotencyGuard {
    async fn is_handled(&self, aggregate_id: AggregateId, event_id: EventId) -> Result<bool> {
        let handled: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM relay_processed_messages WHERE aggregate_id = $1 AND event_id = $2)",
        )
        .bind(aggregate_id.as_uuid())
        .bind(event_id.as_uuid())
        .fetch_one(&self.pool)
        .await?;

        Ok(handled)
    }

    async fn mark_handled(&self, aggregate_id: AggregateId, event_id: EventId) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO relay_processed_messages (aggregate_id, event_id, processed_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (aggregate_id, event_id) DO NOTHING
            "#,
        )
        .bind(aggregate_id.as_uuid())
        .bind(event_id.as_uuid())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
