//! System-wide default values for the coordination core.

// Queue capacity
/// Total number of tasks the queue holds across all priority bands.
pub const MAX_QUEUE_SIZE: usize = 10_000;
/// Default per-band quotas. Their sum must not exceed `MAX_QUEUE_SIZE`.
pub const QUOTA_HIGH: usize = 1_000;
pub const QUOTA_MEDIUM: usize = 5_000;
pub const QUOTA_LOW: usize = 4_000;

// Priority bands (1=low, 2=medium, 3=high)
pub const PRIORITY_LOW: u8 = 1;
pub const PRIORITY_MEDIUM: u8 = 2;
pub const PRIORITY_HIGH: u8 = 3;

// Leases and liveness
/// Hard lease deadline for a dequeued task.
pub const WORKER_TIMEOUT_SECS: u64 = 300;
/// Expected cadence of worker heartbeats.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;
/// A worker is declared dead after this long without a heartbeat.
pub const HEARTBEAT_TIMEOUT_SECS: u64 = 60;
/// How often the background monitors scan for dead workers and stale leases.
pub const HEARTBEAT_CHECK_INTERVAL_SECS: u64 = 15;
/// Window in which a dequeued assignment must be acknowledged.
pub const ACKNOWLEDGMENT_TIMEOUT_SECS: u64 = 5;

// Retry policy
pub const RETRY_MAX_ATTEMPTS: u32 = 3;
pub const RETRY_BACKOFF_BASE_SECS: u64 = 2;
pub const RETRY_BACKOFF_MAX_SECS: u64 = 300;

// Starvation prevention
/// Wait time after which a pending task counts as starved in statistics.
pub const STARVATION_THRESHOLD_SECS: u64 = 3_600;
/// A pending task gains `PRIORITY_BOOST_AMOUNT` every interval it waits.
pub const PRIORITY_BOOST_INTERVAL_SECS: u64 = 60;
pub const PRIORITY_BOOST_AMOUNT: f64 = 0.1;

// Persistence
pub const PERSISTENCE_INTERVAL_SECS: u64 = 60;
/// Snapshot schema version. Only the major component must match on load.
pub const SNAPSHOT_VERSION: &str = "1.0.0";

// Context memory
pub const DEFAULT_RETENTION_DAYS: u32 = 30;
pub const DEFAULT_MAX_STORAGE_BYTES: u64 = 10 * 1024 * 1024 * 1024;

// Supervisor resources
pub const DEFAULT_MAX_WORKERS: usize = 8;
pub const DEFAULT_MEMORY_BUDGET_MB: u64 = 4_096;
pub const DEFAULT_COMPUTE_BUDGET: f64 = 1_000.0;
pub const DEFAULT_TIME_LIMIT_HOURS: u64 = 24;
/// Allocation requests fail once less than this much compute remains.
pub const MIN_COMPUTE_ALLOCATION: f64 = 10.0;
/// Utilisation above which allocations are halved.
pub const HIGH_LOAD_UTILIZATION: f64 = 0.8;
/// Fraction of the compute budget that counts as exhaustion.
pub const RESOURCE_EXHAUSTION_FRACTION: f64 = 0.95;

// Supervisor tuning
/// Exponential-moving-average learning rate for agent effectiveness.
pub const EFFECTIVENESS_LEARNING_RATE: f64 = 0.3;
/// Momentum applied when re-blending agent selection weights.
pub const WEIGHT_MOMENTUM: f64 = 0.8;
/// Tolerance when validating that a weight vector sums to 1.0.
pub const WEIGHT_SUM_TOLERANCE: f64 = 1e-3;
/// Hypotheses of sufficient quality needed for the quality termination signal.
pub const QUALITY_THRESHOLD_HYPOTHESES: u64 = 10;
/// Iterations without improvement that count as convergence.
pub const CONVERGENCE_ITERATIONS: u64 = 5;
