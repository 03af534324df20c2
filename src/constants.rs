//! # Constants
//!
//! Default values and well-known keys shared across the controller.

/// Field manager and event reporter name
pub const CONTROLLER_NAME: &str = "kyverno-background-controller";

/// Namespace holding all UpdateRequest records
pub const DEFAULT_KYVERNO_NAMESPACE: &str = "kyverno";

/// Prefix for server-generated UpdateRequest names
pub const UPDATE_REQUEST_GENERATE_NAME: &str = "ur-";

/// Default number of background reconciler workers
pub const DEFAULT_BACKGROUND_WORKERS: usize = 2;

/// Default number of cleanup workers
pub const DEFAULT_CLEANUP_WORKERS: usize = 1;

/// Retry ceiling for queue keys before they are dropped
pub const DEFAULT_MAX_RETRIES: u32 = 10;

/// Retry-count value at which an orphaned UR is removed
pub const DEFAULT_ORPHAN_RETRY_THRESHOLD: u32 = 5;

/// Age after which another replica may release a claim whose pod is gone (seconds)
pub const DEFAULT_CLAIM_TIMEOUT_SECS: u64 = 600;

/// How often the cleanup controller re-checks URs for orphaned triggers (seconds)
pub const DEFAULT_ORPHAN_RESYNC_INTERVAL_SECS: u64 = 300;

/// Per-item rate limiter base delay (milliseconds)
pub const DEFAULT_QUEUE_BASE_DELAY_MS: u64 = 5;

/// Per-item rate limiter maximum delay (seconds)
pub const DEFAULT_QUEUE_MAX_DELAY_SECS: u64 = 1000;

/// Generator retry: first delay (milliseconds)
pub const DEFAULT_GENERATOR_INITIAL_BACKOFF_MS: u64 = 500;

/// Generator retry: growth factor between attempts
pub const DEFAULT_GENERATOR_BACKOFF_MULTIPLIER: f64 = 1.5;

/// Generator retry: per-attempt delay cap (milliseconds)
pub const DEFAULT_GENERATOR_MAX_BACKOFF_MS: u64 = 1000;

/// Generator retry: total time budget (milliseconds)
pub const DEFAULT_GENERATOR_BUDGET_MS: u64 = 3000;

/// Conflict retries for claim, release and status writes
pub const DEFAULT_CONFLICT_RETRY_STEPS: u32 = 5;

/// Delay between conflict retries (milliseconds)
pub const DEFAULT_CONFLICT_RETRY_DELAY_MS: u64 = 10;

/// Default HTTP server port for metrics and probes
pub const DEFAULT_METRICS_PORT: u16 = 8080;

/// Server startup timeout (seconds)
pub const DEFAULT_SERVER_STARTUP_TIMEOUT_SECS: u64 = 10;

/// Server readiness poll interval (milliseconds)
pub const DEFAULT_SERVER_POLL_INTERVAL_MS: u64 = 50;

/// Delay before restarting a failed watch (seconds)
pub const DEFAULT_WATCH_RESTART_DELAY_SECS: u64 = 5;

/// Maximum backoff for watch 429 responses (milliseconds)
pub const DEFAULT_WATCH_MAX_BACKOFF_MS: u64 = 30_000;

/// Initial backoff for watch 429 responses (milliseconds)
pub const DEFAULT_WATCH_INITIAL_BACKOFF_MS: u64 = 1_000;
