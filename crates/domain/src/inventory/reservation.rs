use chrono::{DateTime, Utc};
use common::{AggregateId, ReservationId};
use serde::{Deserialize, Serialize};

/// Lifecycle of a reservation. Released is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Active,
    Released,
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReservationStatus::Active => write!(f, "active"),
            ReservationStatus::Released => write!(f, "released"),
        }
    }
}

/// A quantity of stock held against an inventory item.
///
/// Records are never removed from the item; releasing only flips the status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservationRecord {
    pub reservation_id: ReservationId,
    pub item_id: AggregateId,
    pub quantity: u32,
    pub status: ReservationStatus,
    pub reserved_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
}

impl ReservationRecord {
    pub fn is_active(&self) -> bool {
        self.status == ReservationStatus::Active
    }
}
