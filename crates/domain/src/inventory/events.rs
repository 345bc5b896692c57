//! Inventory domain events.
//!
//! Each event is serialized as the payload of exactly one outbox message.

use chrono::{DateTime, Utc};
use common::{AggregateId, ReservationId};
use serde::{Deserialize, Serialize};

use crate::aggregate::DomainEvent;

use super::Sku;

/// Events that can occur on an inventory item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum InventoryEvent {
    /// Stock was provisioned for a new item.
    StockProvisioned(StockProvisionedData),

    /// Units were reserved.
    StockReserved(StockReservedData),

    /// A reservation was released and its units returned.
    StockReleased(StockReleasedData),
}

impl DomainEvent for InventoryEvent {
    fn event_type(&self) -> &'static str {
        match self {
            InventoryEvent::StockProvisioned(_) => "StockProvisioned",
            InventoryEvent::StockReserved(_) => "StockReserved",
            InventoryEvent::StockReleased(_) => "StockReleased",
        }
    }
}

/// Data for StockProvisioned event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockProvisionedData {
    pub item_id: AggregateId,
    pub sku: Sku,
    pub total_quantity: u32,
    pub provisioned_at: DateTime<Utc>,
}

/// Data for StockReserved event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockReservedData {
    pub item_id: AggregateId,
    pub reservation_id: ReservationId,

    /// Units held by this reservation.
    pub quantity: u32,

    /// Item-wide reserved units after the reservation.
    pub new_reserved_quantity: u32,

    pub total_quantity: u32,
    pub reserved_at: DateTime<Utc>,
}

/// Data for StockReleased event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockReleasedData {
    pub item_id: AggregateId,
    pub reservation_id: ReservationId,

    /// Units returned to the pool.
    pub quantity: u32,

    /// Item-wide reserved units after the release.
    pub new_reserved_quantity: u32,

    pub total_quantity: u32,
    pub released_at: DateTime<Utc>,
}

impl InventoryEvent {
    pub fn stock_provisioned(item_id: AggregateId, sku: Sku, total_quantity: u32) -> Self {
        InventoryEvent::StockProvisioned(StockProvisionedData {
            item_id,
            sku,
            total_quantity,
            provisioned_at: Utc::now(),
        })
    }

    pub fn stock_reserved(
        item_id: AggregateId,
        reservation_id: ReservationId,
        quantity: u32,
        new_reserved_quantity: u32,
        total_quantity: u32,
    ) -> Self {
        InventoryEvent::StockReserved(StockReservedData {
            item_id,
            reservation_id,
            quantity,
            new_reserved_quantity,
            total_quantity,
            reserved_at: Utc::now(),
        })
    }

    pub fn stock_released(
        item_id: AggregateId,
        reservation_id: ReservationId,
        quantity: u32,
        new_reserved_quantity: u32,
        total_quantity: u32,
    ) -> Self {
        InventoryEvent::StockReleased(StockReleasedData {
            item_id,
            reservation_id,
            quantity,
            new_reserved_quantity,
            total_quantity,
            released_at: Utc::now(),
        })
    }

    /// Returns the item the event belongs to.
    pub fn item_id(&self) -> AggregateId {
        match self {
            InventoryEvent::StockProvisioned(data) => data.item_id,
            InventoryEvent::StockReserved(data) => data.item_id,
            InventoryEvent::StockReleased(data) => data.item_id,
        }
    }
}
