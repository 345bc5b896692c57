//! Integration tests for the inventory aggregate.
//!
//! These tests drive the service against the in-memory store and verify
//! that every committed transition leaves exactly the expected outbox rows
//! behind, including under concurrent commands.

use std::sync::Arc;
use std::time::Duration;

use common::{AggregateId, RetryPolicy};
use domain::{
    Aggregate, DomainError, InventoryError, InventoryEvent, InventoryItem, InventoryService,
    ProvisionStock, ReleaseStock, ReserveStock,
};
use outbox_store::{InMemoryStore, OutboxMessage, OutboxQuery, OutboxStatus, OutboxStore, Version};
use rand::Rng;

async fn provisioned(total: u32) -> (Arc<InventoryService<InMemoryStore>>, InMemoryStore, AggregateId) {
    let store = InMemoryStore::new();
    let policy = RetryPolicy::new()
        .with_max_attempts(50)
        .with_initial_delay(Duration::from_millis(1))
        .with_max_delay(Duration::from_millis(20));
    let service = Arc::new(InventoryService::with_retry_policy(store.clone(), policy));

    let cmd = ProvisionStock::for_sku("WIDGET-1", total);
    let item_id = cmd.item_id;
    service.provision(cmd).await.unwrap();

    (service, store, item_id)
}

async fn outbox_for(store: &InMemoryStore, item_id: AggregateId) -> Vec<OutboxMessage> {
    store
        .query_messages(OutboxQuery::for_aggregate(item_id))
        .await
        .unwrap()
}

fn decode(message: &OutboxMessage) -> InventoryEvent {
    serde_json::from_value(message.payload.clone()).unwrap()
}

mod scenarios {
    use super::*;

    #[tokio::test]
    async fn scenario_a_reserve_writes_pending_row() {
        let (service, store, item_id) = provisioned(10).await;

        let result = service
            .reserve_stock(ReserveStock::new(item_id, 7, "r1"))
            .await
            .unwrap();

        assert_eq!(result.item.reserved_quantity(), 7);

        let rows = outbox_for(&store, item_id).await;
        assert_eq!(rows.len(), 2);
        let last = &rows[1];
        assert_eq!(last.status, OutboxStatus::Pending);
        assert_eq!(last.event_type, "StockReserved");
        match decode(last) {
            InventoryEvent::StockReserved(data) => {
                assert_eq!(data.quantity, 7);
                assert_eq!(data.reservation_id.as_str(), "r1");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn scenario_b_insufficient_stock_writes_nothing() {
        let (service, store, item_id) = provisioned(10).await;
        service
            .reserve_stock(ReserveStock::new(item_id, 7, "r1"))
            .await
            .unwrap();

        let result = service
            .reserve_stock(ReserveStock::new(item_id, 5, "r2"))
            .await;

        assert!(matches!(
            result,
            Err(DomainError::Inventory(InventoryError::InsufficientStock {
                requested: 5,
                available: 3
            }))
        ));
        assert_eq!(outbox_for(&store, item_id).await.len(), 2);

        let item = service.get_item(item_id).await.unwrap().unwrap();
        assert_eq!(item.reserved_quantity(), 7);
        assert_eq!(item.version(), Version::new(2));
    }

    #[tokio::test]
    async fn scenario_c_release_writes_released_row() {
        let (service, store, item_id) = provisioned(10).await;
        service
            .reserve_stock(ReserveStock::new(item_id, 7, "r1"))
            .await
            .unwrap();

        let result = service
            .release_stock(ReleaseStock::new(item_id, "r1"))
            .await
            .unwrap();

        assert_eq!(result.item.reserved_quantity(), 0);
        let rows = outbox_for(&store, item_id).await;
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2].sequence, 3);
        match decode(&rows[2]) {
            InventoryEvent::StockReleased(data) => assert_eq!(data.quantity, 7),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn scenario_d_concurrent_reservations_one_wins() {
        let (service, store, item_id) = provisioned(5).await;

        let first = {
            let service = Arc::clone(&service);
            tokio::spawn(async move {
                service
                    .reserve_stock(ReserveStock::new(item_id, 4, "rX"))
                    .await
            })
        };
        let second = {
            let service = Arc::clone(&service);
            tokio::spawn(async move {
                service
                    .reserve_stock(ReserveStock::new(item_id, 4, "rY"))
                    .await
            })
        };

        let results = [first.await.unwrap(), second.await.unwrap()];
        let successes = results.iter().filter(|r| r.is_ok()).count();
        let insufficient = results
            .iter()
            .filter(|r| {
                matches!(
                    r,
                    Err(DomainError::Inventory(InventoryError::InsufficientStock { .. }))
                )
            })
            .count();

        assert_eq!(successes, 1);
        assert_eq!(insufficient, 1);

        let item = service.get_item(item_id).await.unwrap().unwrap();
        assert_eq!(item.reserved_quantity(), 4);
        assert_eq!(outbox_for(&store, item_id).await.len(), 2);
    }
}

mod idempotence {
    use super::*;

    #[tokio::test]
    async fn duplicate_reserve_is_reported_as_replay() {
        let (service, store, item_id) = provisioned(10).await;

        let first = service
            .reserve_stock(ReserveStock::new(item_id, 2, "dup"))
            .await
            .unwrap();
        let second = service
            .reserve_stock(ReserveStock::new(item_id, 2, "dup"))
            .await
            .unwrap();

        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(second.reservation, first.reservation);
        assert_eq!(second.item.reserved_quantity(), 2);
        assert_eq!(outbox_for(&store, item_id).await.len(), 2);
    }

    #[tokio::test]
    async fn concurrent_duplicates_reserve_once() {
        let (service, store, item_id) = provisioned(10).await;

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let service = Arc::clone(&service);
                tokio::spawn(async move {
                    service
                        .reserve_stock(ReserveStock::new(item_id, 3, "same"))
                        .await
                })
            })
            .collect();

        let mut fresh = 0;
        for handle in handles {
            let result = handle.await.unwrap().unwrap();
            if !result.replayed {
                fresh += 1;
            }
        }

        assert_eq!(fresh, 1);
        let item = service.get_item(item_id).await.unwrap().unwrap();
        assert_eq!(item.reserved_quantity(), 3);
        assert_eq!(outbox_for(&store, item_id).await.len(), 2);
    }

    #[tokio::test]
    async fn reserve_after_release_with_same_id_is_closed() {
        let (service, _store, item_id) = provisioned(10).await;

        service
            .reserve_stock(ReserveStock::new(item_id, 2, "once"))
            .await
            .unwrap();
        service
            .release_stock(ReleaseStock::new(item_id, "once"))
            .await
            .unwrap();

        let result = service
            .reserve_stock(ReserveStock::new(item_id, 2, "once"))
            .await;
        assert!(matches!(
            result,
            Err(DomainError::Inventory(InventoryError::ReservationClosed { .. }))
        ));
    }

    #[tokio::test]
    async fn release_of_unknown_reservation_fails() {
        let (service, store, item_id) = provisioned(10).await;

        let result = service
            .release_stock(ReleaseStock::new(item_id, "never-made"))
            .await;

        assert!(matches!(
            result,
            Err(DomainError::Inventory(InventoryError::ReservationNotFound { .. }))
        ));
        assert_eq!(outbox_for(&store, item_id).await.len(), 1);
    }

    #[tokio::test]
    async fn provisioning_twice_is_rejected() {
        let (service, _store, item_id) = provisioned(10).await;

        let result = service
            .provision(ProvisionStock::new(item_id, "WIDGET-1", 50))
            .await;

        assert!(matches!(
            result,
            Err(DomainError::Inventory(InventoryError::AlreadyProvisioned))
        ));
        let item = service.get_item(item_id).await.unwrap().unwrap();
        assert_eq!(item.total_quantity(), 10);
    }
}

mod concurrency {
    use super::*;

    /// Replays the outbox into a fresh aggregate.
    fn rebuild(rows: &[OutboxMessage]) -> InventoryItem {
        let mut item = InventoryItem::default();
        item.apply_events(rows.iter().map(decode));
        item
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn randomized_commands_preserve_invariants() {
        const TOTAL: u32 = 20;
        const TASKS: usize = 8;
        const OPS_PER_TASK: usize = 25;

        let (service, store, item_id) = provisioned(TOTAL).await;

        let handles: Vec<_> = (0..TASKS)
            .map(|task| {
                let service = Arc::clone(&service);
                tokio::spawn(async move {
                    let mut made = Vec::new();
                    for op in 0..OPS_PER_TASK {
                        let release = {
                            let mut rng = rand::thread_rng();
                            !made.is_empty() && rng.gen_bool(0.4)
                        };

                        if release {
                            let index = rand::thread_rng().gen_range(0..made.len());
                            let reservation_id: String = made.swap_remove(index);
                            let result = service
                                .release_stock(ReleaseStock::new(item_id, reservation_id))
                                .await;
                            assert!(
                                matches!(result, Ok(_) | Err(DomainError::ConcurrencyConflict { .. })),
                                "unexpected release result: {result:?}"
                            );
                        } else {
                            let quantity = rand::thread_rng().gen_range(1..=6);
                            let reservation_id = format!("t{task}-op{op}");
                            match service
                                .reserve_stock(ReserveStock::new(
                                    item_id,
                                    quantity,
                                    reservation_id.clone(),
                                ))
                                .await
                            {
                                Ok(_) => made.push(reservation_id),
                                Err(DomainError::Inventory(
                                    InventoryError::InsufficientStock { .. },
                                ))
                                | Err(DomainError::ConcurrencyConflict { .. }) => {}
                                Err(e) => panic!("unexpected reserve error: {e}"),
                            }
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }

        let item = service.get_item(item_id).await.unwrap().unwrap();
        assert!(item.reserved_quantity() <= item.total_quantity());
        item.check_invariants().unwrap();

        // The outbox holds one row per committed transition, in commit order.
        let rows = outbox_for(&store, item_id).await;
        assert_eq!(rows.len() as i64, item.version().as_i64());
        for (index, row) in rows.iter().enumerate() {
            assert_eq!(row.sequence, index as i64 + 1);
        }

        let rebuilt = rebuild(&rows);
        assert_eq!(rebuilt.reserved_quantity(), item.reserved_quantity());
        assert_eq!(
            rebuilt.active_reservation_count(),
            item.active_reservation_count()
        );
        rebuilt.check_invariants().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn items_are_independent() {
        let store = InMemoryStore::new();
        let service = Arc::new(InventoryService::new(store.clone()));

        let mut items = Vec::new();
        for n in 0..4 {
            let cmd = ProvisionStock::for_sku(format!("SKU-{n}"), 3);
            items.push(cmd.item_id);
            service.provision(cmd).await.unwrap();
        }

        let handles: Vec<_> = items
            .iter()
            .map(|&item_id| {
                let service = Arc::clone(&service);
                tokio::spawn(async move {
                    for i in 0..3 {
                        service
                            .reserve_stock(ReserveStock::new(item_id, 1, format!("r{i}")))
                            .await
                            .unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }

        for item_id in items {
            let item = service.get_item(item_id).await.unwrap().unwrap();
            assert_eq!(item.available_quantity(), 0);
            assert_eq!(outbox_for(&store, item_id).await.len(), 4);
        }
    }
}
