//! System-wide tunables for the continuation controller and A2A orchestrator.
//! Values mirror the defaults named in the design doc; all are overridable
//! through `Config`.

use std::time::Duration;

// --- Continuation controller: self-driving loop (Layer B) ---
pub const SELF_DRIVE_GRACE_DELAY_MS: u64 = 500;
pub const SELF_DRIVE_COOLDOWN: Duration = Duration::from_secs(60);
pub const MAX_STALLS_ON_SAME_STEP: u32 = 3;
pub const MAX_ZERO_PROGRESS_RUNS: u32 = 3;
pub const MAX_CONSECUTIVE_SELF_DRIVES: u32 = 5;

// --- Continuation controller: event-based step continuation (Layer C) ---
pub const STEP_CONTINUATION_DELAY_MS: u64 = 2_000;

// --- Continuation controller: polling (Layer D) ---
pub const POLL_INTERVAL: Duration = Duration::from_secs(120);
pub const TASK_IDLE_THRESHOLD: Duration = Duration::from_secs(180);
pub const CONTINUATION_COOLDOWN: Duration = Duration::from_secs(300);
pub const MAX_UNBLOCK_REQUESTS: u32 = 3;

// --- Continuation controller: zombie recovery (Layer E) ---
pub const ZOMBIE_TASK_TTL: Duration = Duration::from_secs(24 * 3600);
pub const MAX_ZOMBIE_REASSIGNS: u32 = 3;

// --- Backoff ---
pub const BACKOFF_CAP: Duration = Duration::from_secs(2 * 3600);
pub const RATE_LIMIT_BACKOFF_FLOOR: Duration = Duration::from_secs(10);

// --- A2A concurrency gate ---
pub const DEFAULT_MAX_CONCURRENT_FLOWS: usize = 3;
pub const DEFAULT_QUEUE_TIMEOUT_MS: u64 = 30_000;

// --- A2A flow orchestrator ---
pub const A2A_ROUND_ONE_POLL_CHUNK: Duration = Duration::from_secs(30);
pub const A2A_ROUND_ONE_MAX_WAIT: Duration = Duration::from_secs(5 * 60);
pub const A2A_MAX_RETRIES: u32 = 3;
pub const A2A_RETRY_BASE: Duration = Duration::from_secs(1);

// --- A2A job reaper ---
pub const A2A_JOB_STALENESS_TTL: Duration = Duration::from_secs(30 * 60);
pub const A2A_FINISHED_RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);

// --- Milestone sync retry policy ---
pub const MILESTONE_SYNC_ATTEMPTS: u32 = 3;
pub const MILESTONE_SYNC_BACKOFF_MIN: Duration = Duration::from_millis(500);
pub const MILESTONE_SYNC_BACKOFF_MAX: Duration = Duration::from_millis(5_000);

// --- File lock retry budget ---
pub const LOCK_RETRY_ATTEMPTS: u32 = 20;
pub const LOCK_RETRY_BASE_DELAY_MS: u64 = 25;
