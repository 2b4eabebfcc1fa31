//! System-wide constants
//!
//! Defaults here are overridable through the environment (see `config`);
//! anything not surfaced as an env var is a hard system bound.

// ⚙️ QUEUE & RETRY CONFIGURATION
/// Attempts after which a queue item drains to the dead-letter channel
/// and its task fails with reason `max-retries`.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Seconds a claimed queue item stays hidden before it becomes
/// eligible for reclaim.
pub const DEFAULT_CLAIM_VISIBILITY_SECS: u64 = 120;

/// Queue depth above which enqueue is refused (webhook intake answers 503).
pub const DEFAULT_QUEUE_HIGH_WATER: usize = 1000;

/// Exponential backoff schedule: base * factor^attempt, jittered ±20%,
/// capped. One policy for subprocess retries and requeues alike.
pub const BACKOFF_BASE_SECS: u64 = 2;
pub const BACKOFF_FACTOR: u64 = 2;
pub const BACKOFF_CAP_SECS: u64 = 300;
pub const BACKOFF_JITTER_RATIO: f64 = 0.2;

/// Version-conflict updates reload and retry this many times (linear
/// backoff) before the transition is surfaced as failed.
pub const VERSION_CONFLICT_RETRIES: u32 = 3;
pub const VERSION_CONFLICT_BACKOFF_MS: u64 = 50;

// 📜 LOG CHANNEL CONFIGURATION
/// Per-task retention cap; the oldest entries are dropped past this and a
/// single `[truncated N lines]` system marker takes their place.
pub const DEFAULT_LOG_MAX_LINES_PER_TASK: usize = 50_000;

/// Log entries older than this are evicted by the TTL sweeper.
pub const DEFAULT_LOG_RETENTION_SECS: u64 = 86_400;

/// Subprocess output lines longer than this are split at the boundary;
/// every part keeps its own sequence number.
pub const MAX_LOG_LINE_BYTES: usize = 64 * 1024;

/// Interval between TTL sweeps of the log channel.
pub const LOG_SWEEP_INTERVAL_SECS: u64 = 300;

// 🤖 RUNNER SUBPROCESS CONFIGURATION
/// Wall-clock deadlines per stage.
pub const DEFAULT_PLAN_TIMEOUT_SECS: u64 = 1800;
pub const DEFAULT_EXECUTE_TIMEOUT_SECS: u64 = 3600;

/// Grace window between the cooperative cancel flag and the hard kill.
pub const CANCEL_GRACE_SECS: u64 = 10;

/// Trailing stdout lines scanned for the structured result envelope.
pub const ENVELOPE_SCAN_LINES: usize = 50;

// 📦 REPOSITORY CACHE CONFIGURATION
/// Shallow clone depth unless `REPO_CLONE_DEPTH` overrides it.
pub const DEFAULT_CLONE_DEPTH: u32 = 1;

/// Fair-FIFO wait bound on the per-entry lock before `cache-busy`.
pub const DEFAULT_CACHE_ACQUIRE_TIMEOUT_SECS: u64 = 120;

/// Reads above this size return `too-large`.
pub const MAX_CACHED_FILE_READ_BYTES: u64 = 10 * 1024 * 1024;

/// Paths matching these patterns are refused with `access-denied`.
pub const DEFAULT_SENSITIVE_PATH_PATTERNS: &[&str] = &[
    ".env",
    ".env.*",
    "*.pem",
    "*.key",
    "id_rsa*",
    "id_ed25519*",
    "secrets/*",
];

// 🧹 HOUSEKEEPING
/// Terminal tasks older than this are removed from the store sweep.
pub const STORE_RETENTION_SECS: u64 = 7 * 86_400;

/// Interval between store cleanup sweeps.
pub const STORE_SWEEP_INTERVAL_SECS: u64 = 300;

/// Worker poll sleep when both queues are empty.
pub const WORKER_IDLE_POLL_MS: u64 = 500;

/// Workers pause with exponential sleep up to this bound when a backend
/// is unavailable.
pub const BACKEND_PAUSE_CAP_SECS: u64 = 60;

// 🔑 TOKEN BROKER
/// Tokens are considered stale this close to expiry and refreshed early.
pub const TOKEN_GRACE_SECS: i64 = 60;
