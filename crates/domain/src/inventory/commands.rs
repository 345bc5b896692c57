//! Inventory commands.

use common::{AggregateId, ReservationId};

use crate::command::Command;

use super::{InventoryError, InventoryItem, Sku};

/// Command to create an inventory item with its initial stock.
#[derive(Debug, Clone)]
pub struct ProvisionStock {
    pub item_id: AggregateId,
    pub sku: Sku,
    pub total_quantity: u32,
    pub correlation_id: Option<String>,
}

impl ProvisionStock {
    pub fn new(item_id: AggregateId, sku: impl Into<Sku>, total_quantity: u32) -> Self {
        Self {
            item_id,
            sku: sku.into(),
            total_quantity,
            correlation_id: None,
        }
    }

    /// Creates a command for a new item with a generated ID.
    pub fn for_sku(sku: impl Into<Sku>, total_quantity: u32) -> Self {
        Self::new(AggregateId::new(), sku, total_quantity)
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn validate(&self) -> Result<(), InventoryError> {
        if self.sku.is_blank() {
            return Err(InventoryError::InvalidIdentifier { field: "sku" });
        }
        Ok(())
    }
}

impl Command for ProvisionStock {
    type Aggregate = InventoryItem;

    fn aggregate_id(&self) -> AggregateId {
        self.item_id
    }
}

/// Command to hold units of an item under a reservation ID.
#[derive(Debug, Clone)]
pub struct ReserveStock {
    pub item_id: AggregateId,
    pub quantity: u32,

    /// Caller-chosen idempotency key for this reservation.
    pub reservation_id: ReservationId,

    pub correlation_id: Option<String>,
}

impl ReserveStock {
    pub fn new(
        item_id: AggregateId,
        quantity: u32,
        reservation_id: impl Into<ReservationId>,
    ) -> Self {
        Self {
            item_id,
            quantity,
            reservation_id: reservation_id.into(),
            correlation_id: None,
        }
    }

    /// Creates a command with a freshly generated reservation ID.
    pub fn generated(item_id: AggregateId, quantity: u32) -> Self {
        Self::new(item_id, quantity, ReservationId::generate())
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn validate(&self) -> Result<(), InventoryError> {
        if self.quantity == 0 {
            return Err(InventoryError::InvalidQuantity {
                quantity: self.quantity,
            });
        }
        if self.reservation_id.is_blank() {
            return Err(InventoryError::InvalidIdentifier {
                field: "reservation_id",
            });
        }
        Ok(())
    }
}

impl Command for ReserveStock {
    type Aggregate = InventoryItem;

    fn aggregate_id(&self) -> AggregateId {
        self.item_id
    }
}

/// Command to release a previously made reservation.
#[derive(Debug, Clone)]
pub struct ReleaseStock {
    pub item_id: AggregateId,
    pub reservation_id: ReservationId,
    pub correlation_id: Option<String>,
}

impl ReleaseStock {
    pub fn new(item_id: AggregateId, reservation_id: impl Into<ReservationId>) -> Self {
        Self {
            item_id,
            reservation_id: reservation_id.into(),
            correlation_id: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn validate(&self) -> Result<(), InventoryError> {
        if self.reservation_id.is_blank() {
            return Err(InventoryError::InvalidIdentifier {
                field: "reservation_id",
            });
        }
        Ok(())
    }
}

impl Command for ReleaseStock {
    type Aggregate = InventoryItem;

    fn aggregate_id(&self) -> AggregateId {
        self.item_id
    }
}
