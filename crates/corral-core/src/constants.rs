//! Fixed limits and defaults shared by the corral crates.
//!
//! Every background loop and retry in the workspace is bounded by one of these.

/// Default per-call timeout for remote operations.
pub const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 5_000;

/// Default timeout for establishing the store connection.
pub const DEFAULT_DIAL_TIMEOUT_MS: u64 = 5_000;

/// Default transport keep-alive interval.
pub const DEFAULT_DIAL_KEEP_ALIVE_MS: u64 = 5_000;

/// Default node identity used for elections.
pub const DEFAULT_NODE_NAME: &str = "corral-main";

/// Default TTL of lock and election sessions.
pub const DEFAULT_SESSION_TTL_SECS: i64 = 60;

/// Smallest TTL a session may be created with.
pub const MIN_SESSION_TTL_SECS: i64 = 1;

/// Attempts for single-key writes that fail transiently.
pub const DEFAULT_WRITE_RETRY_ATTEMPTS: u32 = 3;

/// Fixed delay between write retries.
pub const DEFAULT_WRITE_RETRY_DELAY_MS: u64 = 1_000;

/// Rolling window after which a watch stream is reopened.
pub const DEFAULT_WATCH_WINDOW_SECS: u64 = 15 * 60;

/// Pause before a closed watch stream is reopened.
pub const DEFAULT_WATCH_RECONNECT_DELAY_MS: u64 = 1_000;

/// Concurrent watch callbacks per watcher.
pub const DEFAULT_WATCH_POOL_CAPACITY: usize = 2_000;

/// Upper bound on the watch pool capacity.
pub const MAX_WATCH_POOL_CAPACITY: usize = 65_536;

/// Default capacity of channel subscriptions.
pub const DEFAULT_SUBSCRIPTION_CAPACITY: usize = 256;

/// Candidates fetched per claim round.
pub const DEFAULT_CLAIM_BATCH_SIZE: u32 = 16;

/// Upper bound on the claim batch size.
pub const MAX_CLAIM_BATCH_SIZE: u32 = 1_024;

/// Rounds of fetch-and-claim (or push) before giving up under contention.
pub const DEFAULT_MAX_CLAIM_ATTEMPTS: u32 = 32;

/// First backoff between contended rounds.
pub const DEFAULT_CLAIM_INITIAL_BACKOFF_MS: u64 = 10;

/// Backoff ceiling between contended rounds.
pub const DEFAULT_CLAIM_MAX_BACKOFF_MS: u64 = 1_000;

/// Default bound on an election campaign.
pub const DEFAULT_CAMPAIGN_TIMEOUT_SECS: u64 = 5;

/// Default pause between leader observations.
pub const DEFAULT_OBSERVE_INTERVAL_MS: u64 = 1_000;

/// Default pause after a failed leader query.
pub const DEFAULT_ELECTION_ERROR_BACKOFF_MS: u64 = 1_000;

/// Interval between provider registration attempts.
pub const PROVIDER_REGISTER_INTERVAL_MS: u64 = 1_000;

/// Key prefix of lock waiters: `/lock/<key>/<lease>`.
pub const LOCK_PREFIX: &str = "/lock/";

/// Key prefix of queue entries: `/priorityQueue/<name>/<priority>/<seq>`.
pub const PRIORITY_QUEUE_PREFIX: &str = "/priorityQueue/";

/// Key prefix of the queue name registry: `__/priorityQueue/<name>/<priority>`.
pub const PRIORITY_QUEUE_REGISTRY_PREFIX: &str = "__/priorityQueue/";

/// Decimal width of the priority segment of a queue key.
pub const PRIORITY_WIDTH: usize = 5;

/// Decimal width of the sequence segment of a queue key.
pub const SEQUENCE_WIDTH: usize = 16;
