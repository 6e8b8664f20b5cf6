//! Default configuration constants for utterflow.
//!
//! Shared by the config sections and the subsystems that can be built without
//! a full [`Config`](crate::config::Config).

/// Inactivity after which a session's aggregation, merge and audio state is dropped.
pub const SESSION_TTL_MS: u64 = 10 * 60 * 1000;

/// Age at which an open merge group is committed regardless of its length.
pub const MERGE_GROUP_TIMEOUT_MS: u64 = 10_000;

/// Number of recently committed texts kept per session for duplicate suppression.
pub const RECENT_COMMITTED_CAPACITY: usize = 10;

/// Upper bound on the characters compared when looking for a suffix/prefix overlap.
pub const DEDUP_SEARCH_WINDOW_CHARS: usize = 64;

// Forward merge (length routing of short utterances)
pub const MIN_LENGTH_TO_KEEP: usize = 6;
pub const MIN_LENGTH_TO_SEND: usize = 20;
pub const MAX_LENGTH_TO_WAIT: usize = 40;
pub const FORWARD_MERGE_WAIT_TIMEOUT_MS: u64 = 3000;

// Sequential executor
pub const EXECUTOR_MAX_WAIT_MS: u64 = 30_000;

// GPU arbiter
pub const GPU_KEY: &str = "gpu:0";
pub const GPU_QUEUE_LIMIT: usize = 8;
pub const GPU_HOLD_MAX_MS: u64 = 8000;
pub const GPU_WAIT_TIMEOUT_MS: u64 = 3000;

// Audio ring buffer
pub const RING_BUFFER_MAX_DURATION_MS: u64 = 15_000;
pub const RING_BUFFER_TTL_MS: u64 = 10_000;

// Pending second-half carry
pub const PENDING_SECOND_HALF_TTL_MS: u64 = 12_000;
pub const PENDING_SECOND_HALF_MAX_DURATION_MS: u64 = 12_000;

/// Buffered audio beyond this is finalized even without a boundary signal.
pub const MAX_BUFFER_DURATION_MS: u64 = 20_000;

/// Trailing window searched for a low-energy split point on timeout finalize.
pub const SPLIT_SEARCH_WINDOW_MS: u64 = 2000;

/// Default audio sample rate in Hz.
pub const SAMPLE_RATE: u32 = 16000;

// Secondary decode
pub const SECONDARY_DECODE_MAX_CONCURRENCY: usize = 1;
pub const SECONDARY_DECODE_MAX_QUEUE: usize = 3;
pub const SECONDARY_DECODE_TIMEOUT_MS: u64 = 5000;

// Result caches
pub const CACHE_CAPACITY: usize = 512;
pub const CACHE_TTL_MS: u64 = 10 * 60 * 1000;
