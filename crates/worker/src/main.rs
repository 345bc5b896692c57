//! Outbox worker entry point.

use std::sync::Arc;

use chrono::Utc;
use metrics_exporter_prometheus::PrometheusBuilder;
use outbox_store::{
    IdempotencyGuard, InMemoryIdempotencyGuard, InMemoryStore, OutboxStore,
    PostgresIdempotencyGuard, PostgresStore, chrono_duration,
};
use relay::{Broker, RelayConfig, TracingBroker};
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use worker::{LogFormat, WorkerConfig, WorkerError};

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(format: LogFormat) {
    let registry = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")));

    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

async fn connect_broker(config: &WorkerConfig) -> Result<Arc<dyn Broker>, WorkerError> {
    #[cfg(feature = "nats")]
    if let Some(url) = &config.nats_url {
        tracing::info!(%url, "connecting to NATS JetStream");
        return Ok(Arc::new(relay::JetStreamBroker::connect(url).await?));
    }

    #[cfg(not(feature = "nats"))]
    if config.nats_url.is_some() {
        tracing::warn!("NATS_URL is set but the worker was built without the `nats` feature");
    }

    tracing::info!("no broker configured, published events are logged");
    Ok(Arc::new(TracingBroker))
}

/// Starts the relays and the outbox purge for one store.
fn start<S>(
    store: S,
    guard: Arc<dyn IdempotencyGuard>,
    broker: Arc<dyn Broker>,
    relay_config: &RelayConfig,
    config: &WorkerConfig,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>>
where
    S: OutboxStore + Clone + 'static,
{
    let mut handles = worker::spawn_relays(
        store.clone(),
        broker,
        guard,
        relay_config,
        config.relay_workers,
        shutdown.clone(),
    );
    handles.push(worker::spawn_purge(
        store,
        config.retention,
        config.purge_interval(),
        shutdown,
    ));
    handles
}

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    let config = WorkerConfig::from_env();

    // 1. Initialize tracing
    init_tracing(config.log_format);

    // 2. Install Prometheus metrics recorder and its scrape endpoint
    PrometheusBuilder::new()
        .with_http_listener(config.metrics_addr)
        .install()?;
    tracing::info!(addr = %config.metrics_addr, "metrics endpoint listening");

    // 3. Broker
    let relay_config = RelayConfig::from_env();
    let broker = connect_broker(&config).await?;

    // 4. Store, guard and relay tasks
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(config.database_max_connections)
                .connect(url)
                .await?;
            let store = PostgresStore::new(pool.clone());
            store.run_migrations().await?;
            tracing::info!("database migrations applied");

            let guard = PostgresIdempotencyGuard::new(pool);
            let mut handles = start(
                store,
                Arc::new(guard.clone()),
                broker,
                &relay_config,
                &config,
                shutdown_rx.clone(),
            );

            let retention = config.retention;
            handles.push(worker::spawn_periodic(
                config.purge_interval(),
                shutdown_rx,
                move || {
                    let guard = guard.clone();
                    async move {
                        let cutoff = Utc::now() - chrono_duration(retention);
                        if let Err(e) = guard.purge_before(cutoff).await {
                            tracing::error!(error = %e, "idempotency marker purge failed");
                        }
                    }
                },
            ));
            handles
        }
        None => {
            tracing::warn!("DATABASE_URL not set, running on the in-memory store");
            start(
                InMemoryStore::new(),
                Arc::new(InMemoryIdempotencyGuard::new()),
                broker,
                &relay_config,
                &config,
                shutdown_rx,
            )
        }
    };

    tracing::info!(
        relay_workers = config.relay_workers,
        shard_index = relay_config.shard_index,
        shard_count = relay_config.shard_count,
        "worker started"
    );

    // 5. Run until signalled, then drain in-flight work
    shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "worker task failed");
        }
    }

    tracing::info!("worker shut down gracefully");
    Ok(())
}
