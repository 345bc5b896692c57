//! Inventory service providing the reservation API.

use std::collections::HashMap;

use common::{AggregateId, RetryPolicy};
use outbox_store::{AggregateStore, Version};

use crate::command::{CommandHandler, CommandResult};
use crate::error::DomainError;

use super::{
    InventoryError, InventoryItem, ProvisionStock, ReleaseStock, ReservationRecord, ReserveStock,
};

/// Outcome of a successful reserve call.
#[derive(Debug, Clone)]
pub struct StockReservation {
    pub reservation: ReservationRecord,
    pub item: InventoryItem,
    pub version: Version,

    /// True if the reservation already existed and nothing was written.
    pub replayed: bool,
}

/// Outcome of a successful release call.
#[derive(Debug, Clone)]
pub struct StockRelease {
    pub reservation: ReservationRecord,
    pub item: InventoryItem,
    pub version: Version,

    /// True if the reservation was already released and nothing was written.
    pub already_released: bool,
}

/// Service for managing inventory items.
///
/// Every mutating call runs as one unit of work: the item row and the
/// outbox messages for its events are committed together or not at all.
pub struct InventoryService<S: AggregateStore> {
    handler: CommandHandler<S, InventoryItem>,
}

impl<S: AggregateStore> InventoryService<S> {
    /// Creates a new inventory service over the given store.
    pub fn new(store: S) -> Self {
        Self {
            handler: CommandHandler::new(store),
        }
    }

    /// Creates a service with a custom retry policy for version conflicts.
    pub fn with_retry_policy(store: S, retry_policy: RetryPolicy) -> Self {
        Self {
            handler: CommandHandler::with_retry_policy(store, retry_policy),
        }
    }

    /// Returns a reference to the underlying command handler.
    pub fn handler(&self) -> &CommandHandler<S, InventoryItem> {
        &self.handler
    }

    /// Creates an inventory item with its initial stock.
    #[tracing::instrument(skip(self, cmd), fields(item_id = %cmd.item_id, sku = %cmd.sku))]
    pub async fn provision(
        &self,
        cmd: ProvisionStock,
    ) -> Result<CommandResult<InventoryItem>, DomainError> {
        let result = self.provision_inner(&cmd).await;
        record_outcome("provision", result.as_ref().map(|_| "ok"));
        result
    }

    /// Reserves stock. Repeating an active reservation is a no-op that
    /// reports `replayed = true`.
    #[tracing::instrument(
        skip(self, cmd),
        fields(item_id = %cmd.item_id, reservation_id = %cmd.reservation_id, quantity = cmd.quantity)
    )]
    pub async fn reserve_stock(&self, cmd: ReserveStock) -> Result<StockReservation, DomainError> {
        let result = self.reserve_inner(&cmd).await;
        record_outcome(
            "reserve",
            result
                .as_ref()
                .map(|r| if r.replayed { "replayed" } else { "ok" }),
        );
        result
    }

    /// Releases a reservation. Releasing twice is a no-op that reports
    /// `already_released = true`.
    #[tracing::instrument(
        skip(self, cmd),
        fields(item_id = %cmd.item_id, reservation_id = %cmd.reservation_id)
    )]
    pub async fn release_stock(&self, cmd: ReleaseStock) -> Result<StockRelease, DomainError> {
        let result = self.release_inner(&cmd).await;
        record_outcome(
            "release",
            result
                .as_ref()
                .map(|r| if r.already_released { "replayed" } else { "ok" }),
        );
        result
    }

    /// Loads an item by ID.
    ///
    /// Returns None if the item doesn't exist.
    #[tracing::instrument(skip(self))]
    pub async fn get_item(&self, item_id: AggregateId) -> Result<Option<InventoryItem>, DomainError> {
        self.handler.load_existing(item_id).await
    }

    async fn provision_inner(
        &self,
        cmd: &ProvisionStock,
    ) -> Result<CommandResult<InventoryItem>, DomainError> {
        cmd.validate()?;

        let item_id = cmd.item_id;
        self.handler
            .execute_with_metadata(
                item_id,
                false,
                &command_metadata(cmd.correlation_id.as_deref()),
                |item| item.provision(item_id, cmd.sku.clone(), cmd.total_quantity),
            )
            .await
    }

    async fn reserve_inner(&self, cmd: &ReserveStock) -> Result<StockReservation, DomainError> {
        cmd.validate()?;

        let result = self
            .handler
            .execute_with_metadata(
                cmd.item_id,
                true,
                &command_metadata(cmd.correlation_id.as_deref()),
                |item| item.reserve(cmd.reservation_id.clone(), cmd.quantity),
            )
            .await?;

        let replayed = result.events.is_empty();
        if replayed {
            tracing::debug!("reservation already active, nothing written");
        }

        let reservation = find_reservation(&result.aggregate, cmd)?;

        Ok(StockReservation {
            reservation,
            item: result.aggregate,
            version: result.new_version,
            replayed,
        })
    }

    async fn release_inner(&self, cmd: &ReleaseStock) -> Result<StockRelease, DomainError> {
        cmd.validate()?;

        let result = self
            .handler
            .execute_with_metadata(
                cmd.item_id,
                true,
                &command_metadata(cmd.correlation_id.as_deref()),
                |item| item.release(cmd.reservation_id.clone()),
            )
            .await?;

        let already_released = result.events.is_empty();
        let reservation = result
            .aggregate
            .reservation(&cmd.reservation_id)
            .cloned()
            .ok_or_else(|| InventoryError::ReservationNotFound {
                reservation_id: cmd.reservation_id.clone(),
            })?;

        Ok(StockRelease {
            reservation,
            item: result.aggregate,
            version: result.new_version,
            already_released,
        })
    }
}

fn find_reservation(
    item: &InventoryItem,
    cmd: &ReserveStock,
) -> Result<ReservationRecord, InventoryError> {
    item.reservation(&cmd.reservation_id)
        .cloned()
        .ok_or_else(|| {
            InventoryError::InvariantViolation(format!(
                "reservation {} missing after commit",
                cmd.reservation_id
            ))
        })
}

fn command_metadata(correlation_id: Option<&str>) -> HashMap<String, serde_json::Value> {
    correlation_id
        .map(|id| {
            HashMap::from([(
                "correlation_id".to_string(),
                serde_json::Value::String(id.to_string()),
            )])
        })
        .unwrap_or_default()
}

fn record_outcome(command: &'static str, outcome: Result<&'static str, &DomainError>) {
    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::debug!(error = %e, "{command} rejected");
            e.outcome()
        }
    };
    metrics::counter!("inventory_commands_total", "command" => command, "outcome" => outcome)
        .increment(1);
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use common::ReservationId;
    use outbox_store::{InMemoryStore, OutboxQuery, OutboxStore};

    async fn service_with_item(total: u32) -> (InventoryService<InMemoryStore>, InMemoryStore, AggregateId) {
        let store = InMemoryStore::new();
        let service = InventoryService::new(store.clone());
        let cmd = ProvisionStock::for_sku("WIDGET-1", total);
        let item_id = cmd.item_id;
        service.provision(cmd).await.unwrap();
        (service, store, item_id)
    }

    #[tokio::test]
    async fn provision_writes_one_outbox_row() {
        let (service, store, item_id) = service_with_item(10).await;

        let item = service.get_item(item_id).await.unwrap().unwrap();
        assert_eq!(item.total_quantity(), 10);

        let rows = store
            .query_messages(OutboxQuery::for_aggregate(item_id))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].event_type, "StockProvisioned");
    }

    #[tokio::test]
    async fn reserve_and_release_round_trip() {
        let (service, store, item_id) = service_with_item(10).await;

        let reserved = service
            .reserve_stock(ReserveStock::new(item_id, 7, "r-1").with_correlation_id("req-1"))
            .await
            .unwrap();
        assert!(!reserved.replayed);
        assert_eq!(reserved.reservation.quantity, 7);
        assert_eq!(reserved.item.reserved_quantity(), 7);
        assert_eq!(reserved.version, Version::new(2));

        let released = service
            .release_stock(ReleaseStock::new(item_id, "r-1"))
            .await
            .unwrap();
        assert!(!released.already_released);
        assert_eq!(released.item.reserved_quantity(), 0);
        assert_eq!(released.version, Version::new(3));

        let rows = store
            .query_messages(OutboxQuery::for_aggregate(item_id))
            .await
            .unwrap();
        let types: Vec<&str> = rows.iter().map(|m| m.event_type.as_str()).collect();
        assert_eq!(types, vec!["StockProvisioned", "StockReserved", "StockReleased"]);
        assert_eq!(
            rows[1].metadata.get("correlation_id"),
            Some(&serde_json::json!("req-1"))
        );
    }

    #[tokio::test]
    async fn replayed_reservation_writes_nothing() {
        let (service, store, item_id) = service_with_item(10).await;

        service
            .reserve_stock(ReserveStock::new(item_id, 3, "r-1"))
            .await
            .unwrap();
        let again = service
            .reserve_stock(ReserveStock::new(item_id, 3, "r-1"))
            .await
            .unwrap();

        assert!(again.replayed);
        assert_eq!(again.version, Version::new(2));
        assert_eq!(again.item.reserved_quantity(), 3);
        assert_eq!(store.message_count().await, 2);
    }

    #[tokio::test]
    async fn double_release_writes_nothing() {
        let (service, store, item_id) = service_with_item(10).await;

        service
            .reserve_stock(ReserveStock::new(item_id, 3, "r-1"))
            .await
            .unwrap();
        service
            .release_stock(ReleaseStock::new(item_id, "r-1"))
            .await
            .unwrap();
        let again = service
            .release_stock(ReleaseStock::new(item_id, "r-1"))
            .await
            .unwrap();

        assert!(again.already_released);
        assert_eq!(store.message_count().await, 3);
    }

    #[tokio::test]
    async fn unknown_item_is_not_found() {
        let service = InventoryService::new(InMemoryStore::new());
        let result = service
            .reserve_stock(ReserveStock::new(AggregateId::new(), 1, "r-1"))
            .await;
        assert!(matches!(result, Err(DomainError::AggregateNotFound { .. })));
    }

    #[tokio::test]
    async fn invalid_command_never_touches_store() {
        let (service, store, item_id) = service_with_item(10).await;

        let result = service
            .reserve_stock(ReserveStock::new(item_id, 0, "r-1"))
            .await;
        assert!(matches!(
            result,
            Err(DomainError::Inventory(InventoryError::InvalidQuantity { .. }))
        ));

        let result = service
            .release_stock(ReleaseStock::new(item_id, ReservationId::new("")))
            .await;
        assert!(matches!(
            result,
            Err(DomainError::Inventory(InventoryError::InvalidIdentifier { .. }))
        ));
        assert_eq!(store.message_count().await, 1);
    }

    #[tokio::test]
    async fn custom_retry_policy_is_used() {
        let policy = RetryPolicy::new()
            .with_max_attempts(5)
            .with_initial_delay(Duration::from_millis(1));
        let service = InventoryService::with_retry_policy(InMemoryStore::new(), policy.clone());
        assert_eq!(service.handler().retry_policy(), &policy);
    }
}
