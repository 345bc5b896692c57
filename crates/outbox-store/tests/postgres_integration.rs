//! PostgreSQL integration tests
//!
//! These tests share one PostgreSQL container and truncate the tables
//! before each test, so they are serialized.
//! Run with:
//!
//! ```bash
//! cargo test -p outbox-store --test postgres_integration
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use outbox_store::{
    AggregateId, AggregateRecord, AggregateStore, EventId, IdempotencyGuard, MessageKey,
    NewOutboxMessage, OutboxQuery, OutboxStatus, OutboxStore, PostgresIdempotencyGuard,
    PostgresStore, Shard, StoreError, UnitOfWork, Version,
};
use serial_test::serial;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();

            sqlx::raw_sql(include_str!(
                "../../../migrations/001_create_outbox_tables.sql"
            ))
            .execute(&temp_pool)
            .await
            .unwrap();

            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Get a fresh pool with cleared tables
async fn get_test_pool() -> PgPool {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query(
        "TRUNCATE TABLE aggregates, outbox_messages, outbox_leases, relay_processed_messages",
    )
    .execute(&pool)
    .await
    .unwrap();

    pool
}

async fn get_test_store() -> PostgresStore {
    PostgresStore::new(get_test_pool().await)
}

fn unit(
    aggregate_id: AggregateId,
    expected: i64,
    new_version: i64,
    event_types: &[&str],
) -> UnitOfWork {
    let record = AggregateRecord::from_state(
        aggregate_id,
        "InventoryItem",
        Version::new(new_version),
        &serde_json::json!({"on_hand": new_version}),
    )
    .unwrap();

    let messages = event_types
        .iter()
        .map(|t| {
            NewOutboxMessage::from_raw(*t, serde_json::json!({"type": t}))
                .with_metadata("correlation_id", serde_json::json!("corr-1"))
        })
        .collect();

    UnitOfWork::new(record, Version::new(expected), messages)
}

#[tokio::test]
#[serial]
async fn commit_persists_record_and_outbox_rows() {
    let store = get_test_store().await;
    let id = AggregateId::new();

    let written = store
        .commit(unit(id, 0, 1, &["StockProvisioned"]))
        .await
        .unwrap();
    assert_eq!(written.len(), 1);
    assert_eq!(written[0].sequence, 1);

    let record = store.load(id).await.unwrap().unwrap();
    assert_eq!(record.version, Version::first());
    assert_eq!(record.state, serde_json::json!({"on_hand": 1}));

    let rows = store
        .query_messages(OutboxQuery::for_aggregate(id))
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].event_id, written[0].event_id);
    assert_eq!(rows[0].status, OutboxStatus::Pending);
    assert_eq!(
        rows[0].metadata.get("correlation_id"),
        Some(&serde_json::json!("corr-1"))
    );
}

#[tokio::test]
#[serial]
async fn stale_commit_is_rolled_back() {
    let store = get_test_store().await;
    let id = AggregateId::new();

    store.commit(unit(id, 0, 1, &["StockProvisioned"])).await.unwrap();
    store.commit(unit(id, 1, 2, &["StockReserved"])).await.unwrap();

    let result = store.commit(unit(id, 1, 2, &["StockReserved"])).await;
    match result {
        Err(StoreError::ConcurrencyConflict {
            expected, actual, ..
        }) => {
            assert_eq!(expected, Version::new(1));
            assert_eq!(actual, Version::new(2));
        }
        other => panic!("expected conflict, got {other:?}"),
    }

    let rows = store
        .query_messages(OutboxQuery::for_aggregate(id))
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
}

#[tokio::test]
#[serial]
async fn duplicate_creation_conflicts() {
    let store = get_test_store().await;
    let id = AggregateId::new();

    store.commit(unit(id, 0, 1, &["StockProvisioned"])).await.unwrap();
    let result = store.commit(unit(id, 0, 1, &["StockProvisioned"])).await;

    assert!(matches!(result, Err(StoreError::ConcurrencyConflict { .. })));
}

#[tokio::test]
#[serial]
async fn concurrent_writers_produce_one_winner() {
    let store = get_test_store().await;
    let id = AggregateId::new();
    store.commit(unit(id, 0, 1, &["StockProvisioned"])).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.commit(unit(id, 1, 2, &["StockReserved"])).await
        }));
    }

    let mut wins = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => wins += 1,
            Err(e) => assert!(e.is_conflict()),
        }
    }

    assert_eq!(wins, 1);
    let rows = store
        .query_messages(OutboxQuery::for_aggregate(id))
        .await
        .unwrap();
    let sequences: Vec<i64> = rows.iter().map(|m| m.sequence).collect();
    assert_eq!(sequences, vec![1, 2]);
}

#[tokio::test]
#[serial]
async fn multi_event_commit_allocates_contiguous_sequences() {
    let store = get_test_store().await;
    let id = AggregateId::new();

    store.commit(unit(id, 0, 1, &["StockProvisioned"])).await.unwrap();
    let written = store
        .commit(unit(id, 1, 3, &["StockReserved", "StockReleased"]))
        .await
        .unwrap();

    assert_eq!(written[0].sequence, 2);
    assert_eq!(written[1].sequence, 3);
}

#[tokio::test]
#[serial]
async fn sequences_survive_purge_of_published_rows() {
    let store = get_test_store().await;
    let id = AggregateId::new();

    store.commit(unit(id, 0, 1, &["StockProvisioned"])).await.unwrap();
    store.commit(unit(id, 1, 2, &["StockReserved"])).await.unwrap();

    let long_ago = Utc::now() - chrono::Duration::hours(200);
    for sequence in [1, 2] {
        store
            .mark_published(MessageKey::new(id, sequence), long_ago)
            .await
            .unwrap();
    }
    let purged = store
        .purge_published(Utc::now() - chrono::Duration::hours(168))
        .await
        .unwrap();
    assert_eq!(purged, 2);

    let written = store
        .commit(unit(id, 2, 3, &["StockReleased"]))
        .await
        .unwrap();
    assert_eq!(written[0].sequence, 3);
}

#[tokio::test]
#[serial]
async fn deliverable_rows_skip_backing_off_aggregates_and_other_shards() {
    let store = get_test_store().await;
    let a = AggregateId::new();
    let b = AggregateId::new();

    store
        .commit(unit(a, 0, 3, &["StockProvisioned", "StockReserved", "StockReleased"]))
        .await
        .unwrap();
    store.commit(unit(b, 0, 1, &["StockProvisioned"])).await.unwrap();

    let retry_at = Utc::now() + chrono::Duration::seconds(60);
    store
        .record_failure(MessageKey::new(a, 1), "timeout", retry_at)
        .await
        .unwrap();

    let deliverable = store.fetch_deliverable(Shard::all(), 3).await.unwrap();
    let keys: Vec<_> = deliverable.iter().map(|m| m.key()).collect();
    assert_eq!(keys, vec![MessageKey::new(b, 1)]);

    let mut ids = vec![b];
    for _ in 0..10 {
        let id = AggregateId::new();
        store.commit(unit(id, 0, 1, &["StockProvisioned"])).await.unwrap();
        ids.push(id);
    }

    for index in 0..2 {
        let shard = Shard::new(index, 2);
        let rows = store.fetch_deliverable(shard, 100).await.unwrap();
        let expected = ids.iter().filter(|id| shard.contains(**id)).count();
        assert_eq!(rows.len(), expected);
        assert!(rows.iter().all(|m| shard.contains(m.aggregate_id)));
    }
}

#[tokio::test]
#[serial]
async fn deliverable_rows_are_taken_breadth_first() {
    let store = get_test_store().await;
    let a = AggregateId::new();
    let b = AggregateId::new();

    store
        .commit(unit(a, 0, 3, &["StockProvisioned", "StockReserved", "StockReleased"]))
        .await
        .unwrap();
    store.commit(unit(b, 0, 1, &["StockProvisioned"])).await.unwrap();

    let deliverable = store.fetch_deliverable(Shard::all(), 2).await.unwrap();
    let mut keys: Vec<_> = deliverable.iter().map(|m| m.key()).collect();
    let fetched = keys.clone();
    keys.sort();
    assert_eq!(keys, fetched);
    assert!(fetched.contains(&MessageKey::new(a, 1)));
    assert!(fetched.contains(&MessageKey::new(b, 1)));
}

#[tokio::test]
#[serial]
async fn delivery_lifecycle_and_quarantine() {
    let store = get_test_store().await;
    let a = AggregateId::new();
    let b = AggregateId::new();

    store.commit(unit(a, 0, 1, &["StockProvisioned"])).await.unwrap();
    store.commit(unit(a, 1, 2, &["StockReserved"])).await.unwrap();
    store.commit(unit(b, 0, 1, &["StockProvisioned"])).await.unwrap();

    let deliverable = store.fetch_deliverable(Shard::all(), 10).await.unwrap();
    assert_eq!(deliverable.len(), 3);
    let mut keys: Vec<_> = deliverable.iter().map(|m| m.key()).collect();
    let fetched = keys.clone();
    keys.sort();
    assert_eq!(keys, fetched, "rows must come back in (aggregate, sequence) order");

    let key_a1 = MessageKey::new(a, 1);
    let retry_at = Utc::now() + chrono::Duration::seconds(30);
    assert_eq!(store.record_failure(key_a1, "timeout", retry_at).await.unwrap(), 1);
    assert_eq!(store.record_failure(key_a1, "timeout", retry_at).await.unwrap(), 2);

    store.mark_failed(key_a1, "gave up").await.unwrap();
    let deliverable = store.fetch_deliverable(Shard::all(), 10).await.unwrap();
    assert_eq!(deliverable.len(), 1);
    assert_eq!(deliverable[0].aggregate_id, b);

    let failed = store.failed_messages(10).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].attempt_count, 2);
    assert_eq!(failed[0].last_error.as_deref(), Some("gave up"));

    store.requeue(key_a1).await.unwrap();
    let deliverable = store.fetch_deliverable(Shard::all(), 10).await.unwrap();
    assert_eq!(deliverable.len(), 3);
    assert_eq!(deliverable[0].attempt_count, 0);
    assert!(deliverable[0].next_attempt_at.is_none());

    let published_at = Utc::now();
    store.mark_published(key_a1, published_at).await.unwrap();
    store.mark_published(key_a1, Utc::now()).await.unwrap();

    let rows = store
        .query_messages(OutboxQuery::new().status(OutboxStatus::Published))
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].published_at.is_some());
}

#[tokio::test]
#[serial]
async fn missing_message_is_reported() {
    let store = get_test_store().await;
    let key = MessageKey::new(AggregateId::new(), 1);

    assert!(matches!(
        store.mark_published(key, Utc::now()).await,
        Err(StoreError::MessageNotFound(_))
    ));
    assert!(matches!(
        store.record_failure(key, "x", Utc::now()).await,
        Err(StoreError::MessageNotFound(_))
    ));
    assert!(matches!(
        store.requeue(key).await,
        Err(StoreError::MessageNotFound(_))
    ));
}

#[tokio::test]
#[serial]
async fn purge_removes_only_old_published_rows() {
    let store = get_test_store().await;
    let id = AggregateId::new();

    store
        .commit(unit(id, 0, 3, &["StockProvisioned", "StockReserved", "StockReleased"]))
        .await
        .unwrap();

    store
        .mark_published(MessageKey::new(id, 1), Utc::now() - chrono::Duration::days(10))
        .await
        .unwrap();
    store
        .mark_published(MessageKey::new(id, 2), Utc::now())
        .await
        .unwrap();

    let purged = store
        .purge_published(Utc::now() - chrono::Duration::days(7))
        .await
        .unwrap();
    assert_eq!(purged, 1);

    let remaining = store
        .query_messages(OutboxQuery::for_aggregate(id))
        .await
        .unwrap();
    assert_eq!(remaining.len(), 2);
}

#[tokio::test]
#[serial]
async fn query_filters_and_pages() {
    let store = get_test_store().await;
    let id = AggregateId::new();

    store
        .commit(unit(id, 0, 3, &["StockProvisioned", "StockReserved", "StockReserved"]))
        .await
        .unwrap();

    let reserved = store
        .query_messages(OutboxQuery::for_aggregate(id).event_type("StockReserved"))
        .await
        .unwrap();
    assert_eq!(reserved.len(), 2);

    let page = store
        .query_messages(OutboxQuery::for_aggregate(id).offset(1).limit(1))
        .await
        .unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].sequence, 2);

    let tail = store
        .query_messages(OutboxQuery::for_aggregate(id).from_sequence(2))
        .await
        .unwrap();
    let sequences: Vec<i64> = tail.iter().map(|m| m.sequence).collect();
    assert_eq!(sequences, vec![2, 3]);
}

#[tokio::test]
#[serial]
async fn leases_exclude_other_owners() {
    let store = get_test_store().await;
    let id = AggregateId::new();
    let ttl = Duration::from_secs(30);

    assert!(store.try_acquire_lease(id, "relay-a", ttl).await.unwrap());
    assert!(store.try_acquire_lease(id, "relay-a", ttl).await.unwrap());
    assert!(!store.try_acquire_lease(id, "relay-b", ttl).await.unwrap());

    store.release_lease(id, "relay-a").await.unwrap();
    assert!(store.try_acquire_lease(id, "relay-b", ttl).await.unwrap());

    let expired = AggregateId::new();
    assert!(
        store
            .try_acquire_lease(expired, "relay-a", Duration::from_millis(1))
            .await
            .unwrap()
    );
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(store.try_acquire_lease(expired, "relay-b", ttl).await.unwrap());
}

#[tokio::test]
#[serial]
async fn idempotency_markers_persist() {
    let pool = get_test_pool().await;
    let guard = PostgresIdempotencyGuard::new(pool.clone());
    let aggregate_id = AggregateId::new();
    let event_id = EventId::new();

    assert!(!guard.is_handled(aggregate_id, event_id).await.unwrap());
    guard.mark_handled(aggregate_id, event_id).await.unwrap();
    guard.mark_handled(aggregate_id, event_id).await.unwrap();

    // A second guard over the same database sees the marker.
    let restarted = PostgresIdempotencyGuard::new(pool);
    assert!(restarted.is_handled(aggregate_id, event_id).await.unwrap());

    let purged = restarted
        .purge_before(Utc::now() + chrono::Duration::seconds(5))
        .await
        .unwrap();
    assert_eq!(purged, 1);
    assert!(!restarted.is_handled(aggregate_id, event_id).await.unwrap());
}
