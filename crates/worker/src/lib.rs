//! Relay worker process.
//!
//! Wires an outbox store, a broker and an idempotency guard into a set of
//! sharded relay tasks, plus a periodic retention purge, all stopped through
//! one shutdown channel.

pub mod config;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use outbox_store::{IdempotencyGuard, OutboxStore, StoreError, chrono_duration};
use relay::{Broker, OutboxRelay, RelayConfig};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub use config::{LogFormat, WorkerConfig};

/// Start-up failures of the worker process.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Broker error: {0}")]
    Broker(#[from] relay::BrokerError),

    #[error("Metrics exporter error: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),
}

/// Spawns one relay task per entry of `base.subdivide(workers)`.
pub fn spawn_relays<S>(
    store: S,
    broker: Arc<dyn Broker>,
    guard: Arc<dyn IdempotencyGuard>,
    base: &RelayConfig,
    workers: u32,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>>
where
    S: OutboxStore + Clone + 'static,
{
    base.subdivide(workers)
        .into_iter()
        .map(|config| {
            let relay = OutboxRelay::new(store.clone(), Arc::clone(&broker), config)
                .with_idempotency_guard(Arc::clone(&guard));
            let shutdown = shutdown.clone();
            tokio::spawn(async move { relay.run(shutdown).await })
        })
        .collect()
}

/// Deletes Published rows older than `retention`.
pub async fn purge_once<S: OutboxStore>(store: &S, retention: Duration) -> Result<u64, StoreError> {
    let cutoff = Utc::now() - chrono_duration(retention);
    let purged = store.purge_published(cutoff).await?;
    if purged > 0 {
        metrics::counter!("outbox_messages_purged_total").increment(purged);
        tracing::info!(purged, %cutoff, "purged published outbox rows");
    }
    Ok(purged)
}

/// Runs [`purge_once`] every `interval` until shutdown.
pub fn spawn_purge<S>(
    store: S,
    retention: Duration,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    S: OutboxStore + Clone + 'static,
{
    spawn_periodic(interval, shutdown, move || {
        let store = store.clone();
        async move {
            if let Err(e) = purge_once(&store, retention).await {
                tracing::error!(error = %e, "outbox purge failed");
            }
        }
    })
}

/// Runs `task` every `interval` until shutdown. The first run is immediate.
pub fn spawn_periodic<F, Fut>(
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut task: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => task().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}
