//! Domain layer for the inventory reservation system.
//!
//! This crate provides:
//! - Aggregate and DomainEvent traits for state-row aggregates
//! - CommandHandler, which commits the aggregate row and its outbox
//!   messages as one unit of work and retries version conflicts
//! - The InventoryItem aggregate with its reserve/release state machine

pub mod aggregate;
pub mod command;
pub mod error;
pub mod inventory;

pub use aggregate::{Aggregate, DomainEvent};
pub use command::{Command, CommandHandler, CommandResult};
pub use error::DomainError;
pub use inventory::{
    InventoryError, InventoryEvent, InventoryItem, InventoryService, ProvisionStock,
    ReleaseStock, ReservationRecord, ReservationStatus, ReserveStock, Sku, StockProvisionedData,
    StockRelease, StockReleasedData, StockReservation, StockReservedData,
};
