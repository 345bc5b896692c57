//! Relay configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use common::{RetryPolicy, Shard};

/// Relay worker settings.
///
/// Reads from environment variables:
/// - `RELAY_BATCH_SIZE`: rows fetched per drain (default: `100`)
/// - `RELAY_POLL_INTERVAL_MS`: pause between drains (default: `500`)
/// - `RELAY_PUBLISH_TIMEOUT_MS`: per-publish timeout (default: `5000`)
/// - `RELAY_MAX_ATTEMPTS`: attempts before quarantine (default: `10`)
/// - `RELAY_BACKOFF_INITIAL_MS` / `RELAY_BACKOFF_MAX_MS`: retry backoff
///   bounds (default: `200` / `60000`)
/// - `RELAY_LEASE_TTL_MS`: per-aggregate publish lease, renewed before
///   every publish and raised to twice the publish timeout if shorter
///   (default: `30000`)
/// - `RELAY_SHARD_INDEX` / `RELAY_SHARD_COUNT`: partition (default: `0` / `1`)
/// - `RELAY_WORKER_ID`: lease owner name (default: `"relay-{pid}"`)
/// - `RELAY_TOPIC_PREFIX`: subject prefix (default: `"inventory"`)
#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfig {
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub publish_timeout: Duration,
    pub max_attempts: u32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub lease_ttl: Duration,
    pub shard_index: u32,
    pub shard_count: u32,
    pub worker_id: String,
    pub topic_prefix: String,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_millis(key: &str, default: u64) -> Duration {
    Duration::from_millis(env_or(key, default))
}

impl RelayConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            batch_size: env_or("RELAY_BATCH_SIZE", defaults.batch_size),
            poll_interval: env_millis("RELAY_POLL_INTERVAL_MS", 500),
            publish_timeout: env_millis("RELAY_PUBLISH_TIMEOUT_MS", 5_000),
            max_attempts: env_or("RELAY_MAX_ATTEMPTS", defaults.max_attempts),
            backoff_initial: env_millis("RELAY_BACKOFF_INITIAL_MS", 200),
            backoff_max: env_millis("RELAY_BACKOFF_MAX_MS", 60_000),
            lease_ttl: env_millis("RELAY_LEASE_TTL_MS", 30_000),
            shard_index: env_or("RELAY_SHARD_INDEX", defaults.shard_index),
            shard_count: env_or("RELAY_SHARD_COUNT", defaults.shard_count),
            worker_id: std::env::var("RELAY_WORKER_ID").unwrap_or(defaults.worker_id),
            topic_prefix: std::env::var("RELAY_TOPIC_PREFIX").unwrap_or(defaults.topic_prefix),
        }
        .normalized()
    }

    /// Returns a copy for shard `index` of `count`, with a per-shard worker id.
    pub fn for_shard(&self, index: u32, count: u32) -> Self {
        Self {
            shard_index: index,
            shard_count: count,
            worker_id: format!("{}-{index}", self.worker_id),
            ..self.clone()
        }
        .normalized()
    }

    /// Splits this shard into `workers` finer shards that together cover
    /// exactly the same aggregates.
    pub fn subdivide(&self, workers: u32) -> Vec<Self> {
        let workers = workers.max(1);
        if workers == 1 {
            return vec![self.clone()];
        }
        let count = self.shard_count.saturating_mul(workers);
        (0..workers)
            .map(|i| self.for_shard(self.shard_index + self.shard_count * i, count))
            .collect()
    }

    /// The slice of aggregates this worker publishes for.
    pub fn shard(&self) -> Shard {
        Shard::new(self.shard_index, self.shard_count)
    }

    /// Backoff schedule between delivery attempts of one message.
    pub fn backoff_policy(&self) -> RetryPolicy {
        RetryPolicy::new()
            .with_max_attempts(self.max_attempts)
            .with_initial_delay(self.backoff_initial)
            .with_max_delay(self.backoff_max)
    }

    pub(crate) fn normalized(mut self) -> Self {
        self.batch_size = self.batch_size.max(1);
        self.max_attempts = self.max_attempts.max(1);
        self.shard_count = self.shard_count.max(1);
        if self.shard_index >= self.shard_count {
            tracing::warn!(
                shard_index = self.shard_index,
                shard_count = self.shard_count,
                "shard index out of range, using 0"
            );
            self.shard_index = 0;
        }
        if self.lease_ttl <= self.publish_timeout {
            let raised = self.publish_timeout.saturating_mul(2);
            tracing::warn!(
                lease_ttl = ?self.lease_ttl,
                publish_timeout = ?self.publish_timeout,
                ?raised,
                "lease ttl must outlive a publish, raising it"
            );
            self.lease_ttl = raised;
        }
        self
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_millis(500),
            publish_timeout: Duration::from_millis(5_000),
            max_attempts: 10,
            backoff_initial: Duration::from_millis(200),
            backoff_max: Duration::from_millis(60_000),
            lease_ttl: Duration::from_millis(30_000),
            shard_index: 0,
            shard_count: 1,
            worker_id: format!("relay-{}", std::process::id()),
            topic_prefix: "inventory".to_string(),
        }
    }
}
