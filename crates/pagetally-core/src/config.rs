use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub data_dir: String,
    pub duckdb_memory_limit: String,
    /// Capacity of the ingestion queue feeding the dispatcher.
    pub queue_capacity: usize,
    /// Table size that triggers an immediate flush; also the flush batch size.
    pub flush_threshold: usize,
    pub flush_interval_secs: u64,
    pub snapshot_interval_secs: u64,
    /// How long day-bucketed aggregates outlive their day in the shared store,
    /// so the midnight rollover still finds them.
    pub rollover_grace_hours: i64,
    pub retry: RetryPolicy,
    pub registered_domains: Vec<String>,
}

/// Bounded retry policy for optimistic shared-store merges.
///
/// A merge is attempted up to `burst` times back to back; when the burst is
/// used up the loop sleeps `pause` and starts a new burst. After `max_pauses`
/// sleeps the merge is abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub burst: u32,
    pub pause: Duration,
    pub max_pauses: u32,
    /// Delay before an abandoned flow/browsing delta is put back in memory.
    pub requeue_delay: Duration,
}

impl RetryPolicy {
    /// Policy used for flow and browsing records.
    pub const fn durable() -> Self {
        Self {
            burst: 100,
            pause: Duration::from_secs(1),
            max_pauses: 10,
            requeue_delay: Duration::from_secs(10),
        }
    }

    /// Policy used for best-effort realtime counters.
    pub const fn realtime() -> Self {
        Self {
            burst: 10,
            pause: Duration::from_secs(1),
            max_pauses: 10,
            requeue_delay: Duration::ZERO,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::durable()
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let defaults = RetryPolicy::durable();
        Ok(Self {
            port: std::env::var("PAGETALLY_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .map_err(|e| format!("invalid port: {e}"))?,
            data_dir: std::env::var("PAGETALLY_DATA_DIR").unwrap_or_else(|_| "./data".to_string()),
            duckdb_memory_limit: std::env::var("PAGETALLY_DUCKDB_MEMORY")
                .unwrap_or_else(|_| "1GB".to_string()),
            queue_capacity: env_or("PAGETALLY_QUEUE_CAPACITY", 10usize).max(1),
            flush_threshold: env_or("PAGETALLY_FLUSH_THRESHOLD", 500usize).max(1),
            flush_interval_secs: env_or("PAGETALLY_FLUSH_INTERVAL_SECS", 10u64).max(1),
            snapshot_interval_secs: env_or("PAGETALLY_SNAPSHOT_INTERVAL_SECS", 300u64).max(1),
            rollover_grace_hours: env_or("PAGETALLY_ROLLOVER_GRACE_HOURS", 24i64).max(1),
            retry: RetryPolicy {
                burst: env_or("PAGETALLY_RETRY_BURST", defaults.burst).max(1),
                pause: Duration::from_millis(env_or(
                    "PAGETALLY_RETRY_PAUSE_MS",
                    defaults.pause.as_millis() as u64,
                )),
                max_pauses: env_or("PAGETALLY_RETRY_MAX_PAUSES", defaults.max_pauses),
                requeue_delay: Duration::from_millis(env_or(
                    "PAGETALLY_REQUEUE_DELAY_MS",
                    defaults.requeue_delay.as_millis() as u64,
                )),
            },
            registered_domains: std::env::var("PAGETALLY_REGISTERED_DOMAINS")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|d| !d.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        })
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }

    pub fn rollover_grace(&self) -> chrono::Duration {
        chrono::Duration::hours(self.rollover_grace_hours)
    }

    /// The configured retry policy with the short realtime burst.
    pub fn realtime_retry(&self) -> RetryPolicy {
        RetryPolicy {
            burst: RetryPolicy::realtime().burst,
            ..self.retry
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3000,
            data_dir: "./data".to_string(),
            duckdb_memory_limit: "1GB".to_string(),
            queue_capacity: 10,
            flush_threshold: 500,
            flush_interval_secs: 10,
            snapshot_interval_secs: 300,
            rollover_grace_hours: 24,
            retry: RetryPolicy::durable(),
            registered_domains: Vec::new(),
        }
    }
}
