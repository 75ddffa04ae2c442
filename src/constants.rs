/// Maximum number of attempts to acquire a pooled store connection before
/// giving up.
pub const DB_POOL_MAX_ATTEMPTS: u32 = 20;

/// Delay between pool-acquisition attempts.
pub const DB_POOL_RETRY_DELAY_MS: u64 = 200;

/// PR age beyond which the synchronizer no longer replays review/issue
/// comments during bootstrap (roughly two months).
pub const SYNC_MAX_AGE_SECS: i64 = 5_000_000;

/// Status-check context the merge queue reports single-builder CI
/// outcomes under.
pub const STATUS_CONTEXT: &str = "homu";

/// Per-builder status-check context prefix used by the testrunners CI
/// shape (`merge-test/<builder>`).
pub const STATUS_CONTEXT_PER_BUILDER_PREFIX: &str = "merge-test/";

pub const INTERRUPTED_COMMENT_PREFIX: &str = "Interrupted by Homu";

pub const EMOJI_HOURGLASS: &str = ":hourglass:";
pub const EMOJI_PUSHPIN: &str = ":pushpin:";
pub const EMOJI_LOCK: &str = ":lock:";
pub const EMOJI_X: &str = ":x:";
pub const EMOJI_ZAP: &str = ":zap:";
pub const EMOJI_QUESTION: &str = ":question:";
pub const EMOJI_BOMB: &str = ":bomb:";
