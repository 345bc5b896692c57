//! Domain error types.

use common::AggregateId;
use outbox_store::StoreError;
use thiserror::Error;

use crate::inventory::InventoryError;

/// Errors that can occur during domain operations.
#[derive(Debug, Error)]
pub enum DomainError {
    /// A business rule rejected the command.
    #[error("Inventory error: {0}")]
    Inventory(#[from] InventoryError),

    /// Every attempt lost the optimistic-lock race.
    #[error("Concurrency conflict on aggregate {aggregate_id} after {attempts} attempts")]
    ConcurrencyConflict {
        aggregate_id: AggregateId,
        attempts: u32,
    },

    /// Aggregate not found.
    #[error("Aggregate not found: {aggregate_type} with id {aggregate_id}")]
    AggregateNotFound {
        aggregate_type: &'static str,
        aggregate_id: AggregateId,
    },

    /// The store failed for a reason other than a version conflict.
    #[error("Persistence error: {0}")]
    Persistence(#[from] StoreError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DomainError {
    /// Short label used as the `outcome` metric dimension.
    pub fn outcome(&self) -> &'static str {
        match self {
            DomainError::Inventory(_) => "rejected",
            DomainError::ConcurrencyConflict { .. } => "conflict",
            DomainError::AggregateNotFound { .. } => "not_found",
            DomainError::Persistence(_) | DomainError::Serialization(_) => "error",
        }
    }
}
