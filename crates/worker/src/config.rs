//! Worker process configuration loaded from environment variables.

use std::net::SocketAddr;
use std::time::Duration;

/// Output format of the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl LogFormat {
    fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        }
    }
}

/// Process-level settings. Relay tuning lives in `relay::RelayConfig`.
///
/// Reads from environment variables:
/// - `DATABASE_URL`: PostgreSQL URL; unset runs on the in-memory store
/// - `DATABASE_MAX_CONNECTIONS`: pool size (default: `5`)
/// - `METRICS_ADDR`: Prometheus listener (default: `"0.0.0.0:9000"`)
/// - `RELAY_WORKERS`: relay tasks run in this process (default: `1`)
/// - `NATS_URL`: JetStream server; unset logs events instead
/// - `LOG_FORMAT`: `json` or `pretty` (default: `pretty`)
/// - `OUTBOX_RETENTION_HOURS`: age of Published rows before purge (default: `168`)
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub metrics_addr: SocketAddr,
    pub relay_workers: u32,
    pub nats_url: Option<String>,
    pub log_format: LogFormat,
    pub retention: Duration,
}

impl WorkerConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let retention_hours: u64 = std::env::var("OUTBOX_RETENTION_HOURS")
            .ok()
            .and_then(|h| h.parse().ok())
            .unwrap_or(168);

        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|u| !u.is_empty()),
            database_max_connections: std::env::var("DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|n| n.parse().ok())
                .unwrap_or(defaults.database_max_connections),
            metrics_addr: std::env::var("METRICS_ADDR")
                .ok()
                .and_then(|a| a.parse().ok())
                .unwrap_or(defaults.metrics_addr),
            relay_workers: std::env::var("RELAY_WORKERS")
                .ok()
                .and_then(|n| n.parse().ok())
                .unwrap_or(defaults.relay_workers)
                .max(1),
            nats_url: std::env::var("NATS_URL").ok().filter(|u| !u.is_empty()),
            log_format: std::env::var("LOG_FORMAT")
                .map(|f| LogFormat::parse(&f))
                .unwrap_or_default(),
            retention: Duration::from_secs(retention_hours.saturating_mul(3600)),
        }
    }

    /// How often the retention purge runs.
    pub fn purge_interval(&self) -> Duration {
        (self.retention / 24).clamp(Duration::from_secs(60), Duration::from_secs(3600))
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            database_max_connections: 5,
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 9000)),
            relay_workers: 1,
            nats_url: None,
            log_format: LogFormat::Pretty,
            retention: Duration::from_secs(168 * 3600),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = WorkerConfig::default();
        assert!(config.database_url.is_none());
        assert_eq!(config.database_max_connections, 5);
        assert_eq!(config.metrics_addr.to_string(), "0.0.0.0:9000");
        assert_eq!(config.relay_workers, 1);
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert_eq!(config.retention, Duration::from_secs(7 * 24 * 3600));
    }

    #[test]
    fn test_log_format_parsing() {
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse("JSON"), LogFormat::Json);
        assert_eq!(LogFormat::parse("pretty"), LogFormat::Pretty);
        assert_eq!(LogFormat::parse("anything"), LogFormat::Pretty);
    }

    #[test]
    fn test_purge_interval_is_bounded() {
        let week = WorkerConfig::default();
        assert_eq!(week.purge_interval(), Duration::from_secs(3600));

        let short = WorkerConfig {
            retention: Duration::from_secs(600),
            ..WorkerConfig::default()
        };
        assert_eq!(short.purge_interval(), Duration::from_secs(60));
    }
}
