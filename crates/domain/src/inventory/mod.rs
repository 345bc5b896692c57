//! Inventory item aggregate and related types.

mod aggregate;
mod commands;
mod events;
mod reservation;
mod service;
mod value_objects;

pub use aggregate::InventoryItem;
pub use commands::{ProvisionStock, ReleaseStock, ReserveStock};
pub use events::{InventoryEvent, StockProvisionedData, StockReleasedData, StockReservedData};
pub use reservation::{ReservationRecord, ReservationStatus};
pub use service::{InventoryService, StockRelease, StockReservation};
pub use value_objects::Sku;

use common::ReservationId;
use thiserror::Error;

/// Errors that can occur during inventory operations.
#[derive(Debug, Error)]
pub enum InventoryError {
    /// Not enough unreserved units.
    #[error("Insufficient stock: requested {requested}, available {available}")]
    InsufficientStock { requested: u32, available: u32 },

    /// No reservation with this ID exists on the item.
    #[error("Reservation not found: {reservation_id}")]
    ReservationNotFound { reservation_id: ReservationId },

    /// The reservation ID was already used and released.
    #[error("Reservation {reservation_id} is closed and cannot be reused")]
    ReservationClosed { reservation_id: ReservationId },

    /// Invalid quantity.
    #[error("Invalid quantity: {quantity} (must be greater than 0)")]
    InvalidQuantity { quantity: u32 },

    /// A required identifier was empty.
    #[error("Invalid identifier: {field} must not be empty")]
    InvalidIdentifier { field: &'static str },

    /// Item is already provisioned.
    #[error("Inventory item already provisioned")]
    AlreadyProvisioned,

    /// Item has not been provisioned yet.
    #[error("Inventory item not provisioned")]
    NotProvisioned,

    /// State would break a consistency rule; nothing was written.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
}
