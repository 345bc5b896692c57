//! Inventory item aggregate implementation.

use std::collections::BTreeMap;

use common::{AggregateId, ReservationId};
use outbox_store::Version;
use serde::{Deserialize, Serialize};

use crate::aggregate::Aggregate;

use super::{
    InventoryError, InventoryEvent, ReservationRecord, ReservationStatus, Sku,
    events::{StockProvisionedData, StockReleasedData, StockReservedData},
};

/// Inventory item aggregate root.
///
/// Tracks how many units of one SKU exist and how many are held by active
/// reservations. Invariants, checked after every transition:
/// - `reserved_quantity <= total_quantity`
/// - `reserved_quantity` equals the sum of active reservation quantities
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InventoryItem {
    id: Option<AggregateId>,

    #[serde(default)]
    version: Version,

    sku: Option<Sku>,
    total_quantity: u32,
    reserved_quantity: u32,

    /// Active and released reservations, keyed by reservation ID.
    #[serde(default)]
    reservations: BTreeMap<ReservationId, ReservationRecord>,
}

impl Aggregate for InventoryItem {
    type Event = InventoryEvent;
    type Error = InventoryError;

    fn aggregate_type() -> &'static str {
        "InventoryItem"
    }

    fn id(&self) -> Option<AggregateId> {
        self.id
    }

    fn version(&self) -> Version {
        self.version
    }

    fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    fn apply(&mut self, event: Self::Event) {
        match event {
            InventoryEvent::StockProvisioned(data) => self.apply_provisioned(data),
            InventoryEvent::StockReserved(data) => self.apply_reserved(data),
            InventoryEvent::StockReleased(data) => self.apply_released(data),
        }
    }

    fn check_invariants(&self) -> Result<(), Self::Error> {
        if self.reserved_quantity > self.total_quantity {
            return Err(InventoryError::InvariantViolation(format!(
                "reserved quantity {} exceeds total quantity {}",
                self.reserved_quantity, self.total_quantity
            )));
        }

        let active: u64 = self
            .reservations
            .values()
            .filter(|r| r.is_active())
            .map(|r| u64::from(r.quantity))
            .sum();

        if active != u64::from(self.reserved_quantity) {
            return Err(InventoryError::InvariantViolation(format!(
                "active reservations hold {active} units but reserved quantity is {}",
                self.reserved_quantity
            )));
        }

        Ok(())
    }
}

// Query methods
impl InventoryItem {
    pub fn sku(&self) -> Option<&Sku> {
        self.sku.as_ref()
    }

    pub fn total_quantity(&self) -> u32 {
        self.total_quantity
    }

    pub fn reserved_quantity(&self) -> u32 {
        self.reserved_quantity
    }

    /// Units that can still be reserved.
    pub fn available_quantity(&self) -> u32 {
        self.total_quantity.saturating_sub(self.reserved_quantity)
    }

    pub fn reservation(&self, reservation_id: &ReservationId) -> Option<&ReservationRecord> {
        self.reservations.get(reservation_id)
    }

    /// Returns all reservations, active and released, ordered by ID.
    pub fn reservations(&self) -> impl Iterator<Item = &ReservationRecord> {
        self.reservations.values()
    }

    pub fn active_reservation_count(&self) -> usize {
        self.reservations.values().filter(|r| r.is_active()).count()
    }

    pub fn is_provisioned(&self) -> bool {
        self.id.is_some()
    }

    fn provisioned_id(&self) -> Result<AggregateId, InventoryError> {
        self.id.ok_or(InventoryError::NotProvisioned)
    }
}

// Command methods (return events)
impl InventoryItem {
    /// Creates the item with an initial stock level.
    pub fn provision(
        &self,
        item_id: AggregateId,
        sku: Sku,
        total_quantity: u32,
    ) -> Result<Vec<InventoryEvent>, InventoryError> {
        if self.id.is_some() {
            return Err(InventoryError::AlreadyProvisioned);
        }

        if sku.is_blank() {
            return Err(InventoryError::InvalidIdentifier { field: "sku" });
        }

        Ok(vec![InventoryEvent::stock_provisioned(
            item_id,
            sku,
            total_quantity,
        )])
    }

    /// Reserves `quantity` units under `reservation_id`.
    ///
    /// Repeating a reservation that is still active produces no events.
    pub fn reserve(
        &self,
        reservation_id: ReservationId,
        quantity: u32,
    ) -> Result<Vec<InventoryEvent>, InventoryError> {
        let item_id = self.provisioned_id()?;

        if quantity == 0 {
            return Err(InventoryError::InvalidQuantity { quantity });
        }

        if reservation_id.is_blank() {
            return Err(InventoryError::InvalidIdentifier {
                field: "reservation_id",
            });
        }

        if let Some(existing) = self.reservations.get(&reservation_id) {
            return match existing.status {
                ReservationStatus::Active => Ok(vec![]),
                ReservationStatus::Released => {
                    Err(InventoryError::ReservationClosed { reservation_id })
                }
            };
        }

        let available = self.available_quantity();
        if available < quantity {
            return Err(InventoryError::InsufficientStock {
                requested: quantity,
                available,
            });
        }

        Ok(vec![InventoryEvent::stock_reserved(
            item_id,
            reservation_id,
            quantity,
            self.reserved_quantity + quantity,
            self.total_quantity,
        )])
    }

    /// Releases the reservation, returning its units to the pool.
    ///
    /// Releasing an already released reservation produces no events.
    pub fn release(
        &self,
        reservation_id: ReservationId,
    ) -> Result<Vec<InventoryEvent>, InventoryError> {
        let item_id = self.provisioned_id()?;

        if reservation_id.is_blank() {
            return Err(InventoryError::InvalidIdentifier {
                field: "reservation_id",
            });
        }

        let Some(existing) = self.reservations.get(&reservation_id) else {
            return Err(InventoryError::ReservationNotFound { reservation_id });
        };

        if !existing.is_active() {
            return Ok(vec![]);
        }

        Ok(vec![InventoryEvent::stock_released(
            item_id,
            reservation_id,
            existing.quantity,
            self.reserved_quantity.saturating_sub(existing.quantity),
            self.total_quantity,
        )])
    }
}

// Event application
impl InventoryItem {
    fn apply_provisioned(&mut self, data: StockProvisionedData) {
        self.id = Some(data.item_id);
        self.sku = Some(data.sku);
        self.total_quantity = data.total_quantity;
        self.reserved_quantity = 0;
    }

    fn apply_reserved(&mut self, data: StockReservedData) {
        self.reserved_quantity = data.new_reserved_quantity;
        self.reservations.insert(
            data.reservation_id.clone(),
            ReservationRecord {
                reservation_id: data.reservation_id,
                item_id: data.item_id,
                quantity: data.quantity,
                status: ReservationStatus::Active,
                reserved_at: data.reserved_at,
                released_at: None,
            },
        );
    }

    fn apply_released(&mut self, data: StockReleasedData) {
        self.reserved_quantity = data.new_reserved_quantity;
        if let Some(record) = self.reservations.get_mut(&data.reservation_id) {
            record.status = ReservationStatus::Released;
            record.released_at = Some(data.released_at);
        }
    }
}
