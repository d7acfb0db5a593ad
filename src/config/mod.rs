use crate::{constants, CoScientistError, Result};
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, env, path::PathBuf};


/// Top-level configuration for the coordination core
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub queue: QueueConfig,
    pub memory: MemoryConfig,
    pub resources: ResourceConfig,
}

/// Strategy applied when an enqueue hits a capacity limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowStrategy {
    /// Remove the oldest task from the lowest non-empty band strictly below
    /// the incoming priority.
    DisplaceOldestLowPriority,
    /// Reject the enqueue outright.
    Reject,
}

/// Retry policy applied by the queue on task failure
///
/// `max_attempts` is honoured strictly; the backoff fields are a hint
/// exposed to callers, the queue itself never delays a requeue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: u64,
    pub backoff_max: u64,
    pub send_to_dlq: bool,
}

/// Configuration for the task queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub max_queue_size: usize,
    /// Per-band quotas keyed by "high" / "medium" / "low".
    pub priority_quotas: HashMap<String, usize>,
    /// Lease deadline in seconds for a dequeued task.
    pub worker_timeout: u64,
    /// Expected worker heartbeat cadence in seconds.
    pub heartbeat_interval: u64,
    /// Seconds without a heartbeat after which a worker is considered dead.
    pub heartbeat_timeout: u64,
    /// Seconds between background monitor scans.
    pub heartbeat_check_interval: u64,
    /// Seconds a worker has to acknowledge an assignment.
    pub acknowledgment_timeout: u64,
    pub retry_policy: RetryPolicy,
    pub overflow_strategy: OverflowStrategy,
    /// Wait time in seconds after which a pending task counts as starved.
    pub starvation_threshold: u64,
    /// Seconds of waiting per unit of priority boost.
    pub priority_boost_interval: u64,
    pub priority_boost_amount: f64,
    /// Snapshot location; persistence is disabled when unset.
    pub persistence_path: Option<PathBuf>,
    /// Seconds between automatic snapshots.
    pub persistence_interval: u64,
    /// Load the snapshot once during `initialize()`.
    pub auto_recovery: bool,
    /// Start the autosave loop during `initialize()`.
    pub auto_start_persistence: bool,
    /// Start the heartbeat and acknowledgement monitors during `initialize()`.
    pub auto_start_monitoring: bool,
}

/// Configuration for the context memory store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Iterations older than this are packed into the archive.
    pub retention_days: u32,
    /// Hard byte cap; writes beyond it soft-fail.
    pub max_storage_bytes: u64,
}

/// Resource budget managed by the supervisor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub max_workers: usize,
    pub memory_budget_mb: u64,
    pub compute_budget: f64,
    pub time_limit_hours: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: constants::RETRY_MAX_ATTEMPTS,
            backoff_base: constants::RETRY_BACKOFF_BASE_SECS,
            backoff_max: constants::RETRY_BACKOFF_MAX_SECS,
            send_to_dlq: true,
        }
    }
}

impl RetryPolicy {
    /// Suggested delay before re-attempting, in seconds. Exponential in the
    /// retry count, capped at `backoff_max`.
    pub fn backoff_delay_secs(&self, retry_count: u32) -> u64 {
        let exp = self.backoff_base.saturating_pow(retry_count.min(31));
        exp.min(self.backoff_max)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        let mut priority_quotas = HashMap::new();
        priority_quotas.insert("high".to_string(), constants::QUOTA_HIGH);
        priority_quotas.insert("medium".to_string(), constants::QUOTA_MEDIUM);
        priority_quotas.insert("low".to_string(), constants::QUOTA_LOW);

        Self {
            max_queue_size: constants::MAX_QUEUE_SIZE,
            priority_quotas,
            worker_timeout: constants::WORKER_TIMEOUT_SECS,
            heartbeat_interval: constants::HEARTBEAT_INTERVAL_SECS,
            heartbeat_timeout: constants::HEARTBEAT_TIMEOUT_SECS,
            heartbeat_check_interval: constants::HEARTBEAT_CHECK_INTERVAL_SECS,
            acknowledgment_timeout: constants::ACKNOWLEDGMENT_TIMEOUT_SECS,
            retry_policy: RetryPolicy::default(),
            overflow_strategy: OverflowStrategy::DisplaceOldestLowPriority,
            starvation_threshold: constants::STARVATION_THRESHOLD_SECS,
            priority_boost_interval: constants::PRIORITY_BOOST_INTERVAL_SECS,
            priority_boost_amount: constants::PRIORITY_BOOST_AMOUNT,
            persistence_path: None,
            persistence_interval: constants::PERSISTENCE_INTERVAL_SECS,
            auto_recovery: false,
            auto_start_persistence: false,
            auto_start_monitoring: false,
        }
    }
}

impl QueueConfig {
    /// Validate the configuration
    ///
    /// `max_queue_size` must be positive, the quotas must cover exactly the
    /// high/medium/low bands, and their sum must fit in the queue.
    pub fn validate(&self) -> Result<()> {
        if self.max_queue_size == 0 {
            return Err(CoScientistError::Configuration(
                "max_queue_size must be positive".to_string(),
            ));
        }

        let mut bands: Vec<&str> = self.priority_quotas.keys().map(String::as_str).collect();
        bands.sort_unstable();
        if bands != ["high", "low", "medium"] {
            return Err(CoScientistError::Configuration(
                "Priority quotas must include exactly high, medium, low".to_string(),
            ));
        }

        let quota_sum: usize = self.priority_quotas.values().sum();
        if quota_sum > self.max_queue_size {
            return Err(CoScientistError::Configuration(
                "Priority quotas sum exceeds max_queue_size".to_string(),
            ));
        }

        Ok(())
    }

    pub fn quota_for(&self, band: &str) -> usize {
        self.priority_quotas.get(band).copied().unwrap_or(0)
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            retention_days: constants::DEFAULT_RETENTION_DAYS,
            max_storage_bytes: constants::DEFAULT_MAX_STORAGE_BYTES,
        }
    }
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            max_workers: constants::DEFAULT_MAX_WORKERS,
            memory_budget_mb: constants::DEFAULT_MEMORY_BUDGET_MB,
            compute_budget: constants::DEFAULT_COMPUTE_BUDGET,
            time_limit_hours: constants::DEFAULT_TIME_LIMIT_HOURS,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            memory: MemoryConfig::default(),
            resources: ResourceConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the environment
    ///
    /// Unset variables fall back to the defaults in [`crate::constants`].
    pub fn from_env() -> Result<Self> {
        // Load environment variables from .env file
        match dotenv() {
            Ok(path) => tracing::debug!("Loaded .env file from: {:?}", path),
            Err(e) => tracing::debug!("No .env file loaded: {}", e),
        }

        let mut config = Config::default();

        if let Some(size) = env_parse::<usize>("COSCI_MAX_QUEUE_SIZE")? {
            config.queue.max_queue_size = size;
        }
        for (band, var) in [
            ("high", "COSCI_QUOTA_HIGH"),
            ("medium", "COSCI_QUOTA_MEDIUM"),
            ("low", "COSCI_QUOTA_LOW"),
        ] {
            if let Some(quota) = env_parse::<usize>(var)? {
                config.queue.priority_quotas.insert(band.to_string(), quota);
            }
        }
        if let Some(secs) = env_parse::<u64>("COSCI_WORKER_TIMEOUT")? {
            config.queue.worker_timeout = secs;
        }
        if let Some(secs) = env_parse::<u64>("COSCI_HEARTBEAT_TIMEOUT")? {
            config.queue.heartbeat_timeout = secs;
        }
        if let Some(secs) = env_parse::<u64>("COSCI_HEARTBEAT_CHECK_INTERVAL")? {
            config.queue.heartbeat_check_interval = secs;
        }
        if let Some(secs) = env_parse::<u64>("COSCI_ACK_TIMEOUT")? {
            config.queue.acknowledgment_timeout = secs;
        }
        if let Some(attempts) = env_parse::<u32>("COSCI_RETRY_MAX_ATTEMPTS")? {
            config.queue.retry_policy.max_attempts = attempts;
        }
        if let Ok(path) = env::var("COSCI_PERSISTENCE_PATH") {
            if !path.trim().is_empty() {
                config.queue.persistence_path = Some(PathBuf::from(path));
            }
        }
        if let Some(secs) = env_parse::<u64>("COSCI_PERSISTENCE_INTERVAL")? {
            config.queue.persistence_interval = secs;
        }
        if let Some(flag) = env_parse::<bool>("COSCI_AUTO_RECOVERY")? {
            config.queue.auto_recovery = flag;
        }
        if let Some(days) = env_parse::<u32>("COSCI_RETENTION_DAYS")? {
            config.memory.retention_days = days;
        }
        if let Some(bytes) = env_parse::<u64>("COSCI_MAX_STORAGE_BYTES")? {
            config.memory.max_storage_bytes = bytes;
        }
        if let Some(budget) = env_parse::<f64>("COSCI_COMPUTE_BUDGET")? {
            config.resources.compute_budget = budget;
        }

        config.queue.validate()?;
        Ok(config)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match env::var(name) {
        Ok(value) => value.parse::<T>().map(Some).map_err(|_| {
            CoScientistError::Configuration(format!("{name} has an invalid value: {value}"))
        }),
        Err(_) => Ok(None),
    }
}
