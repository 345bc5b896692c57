use outbox_store::StoreError;
use thiserror::Error;

/// Errors that stop a relay drain.
///
/// Broker failures are not listed here: they are recorded on the outbox row
/// and retried, never surfaced to callers.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The outbox store failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// A message payload could not be encoded for the broker.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
