//! Error types for coordination primitives.

use std::path::PathBuf;

use corral_core::StoreError;
use snafu::Snafu;

/// Errors from coordination primitives.
#[derive(Debug, Clone, Snafu)]
#[snafu(visibility(pub))]
pub enum CoordinationError {
    /// A key, prefix, name or argument was rejected before any remote call.
    #[snafu(display("invalid parameter: {reason}"))]
    InvalidParam {
        /// What was wrong.
        reason: String,
    },

    /// `unlock` was called for a key this client never locked.
    #[snafu(display("lock '{key}' not found"))]
    LockNotFound {
        /// The lock key.
        key: String,
    },

    /// The lease backing a session could not be granted.
    #[snafu(display("failed to create session: {source}"))]
    SessionCreation {
        /// The underlying error.
        source: StoreError,
    },

    /// The session lease expired while the operation depended on it.
    #[snafu(display("session lease {lease_id:x} expired"))]
    SessionExpired {
        /// The expired lease.
        lease_id: i64,
    },

    /// Operation timed out.
    #[snafu(display("{operation} timed out after {duration_ms}ms"))]
    Timeout {
        /// Description of the operation.
        operation: String,
        /// The bound that elapsed.
        duration_ms: u64,
    },

    /// The operation was cancelled because its owner shut down.
    #[snafu(display("{operation} cancelled"))]
    Cancelled {
        /// Description of the operation.
        operation: String,
    },

    /// No candidate currently holds the election.
    #[snafu(display("election '{key}' has no leader"))]
    NoLeader {
        /// The election key.
        key: String,
    },

    /// Too many optimistic rounds were lost to competing clients.
    #[snafu(display("{operation} gave up after {attempts} contended attempts"))]
    ContentionExceeded {
        /// Description of the operation.
        operation: String,
        /// Number of rounds attempted.
        attempts: u32,
    },

    /// The worker pool had no free slot.
    #[snafu(display("worker pool saturated ({capacity} tasks in flight)"))]
    PoolSaturated {
        /// Pool capacity.
        capacity: usize,
    },

    /// Underlying store error.
    #[snafu(display("store error: {source}"))]
    Store {
        /// The underlying error.
        source: StoreError,
    },
}

impl From<StoreError> for CoordinationError {
    fn from(source: StoreError) -> Self {
        CoordinationError::Store { source }
    }
}

impl CoordinationError {
    /// True for failures that may succeed when retried unchanged.
    pub fn is_transient(&self) -> bool {
        match self {
            CoordinationError::Store { source } => source.is_transient(),
            CoordinationError::Timeout { .. } => true,
            _ => false,
        }
    }

    /// True when the session lease behind an operation no longer exists.
    pub fn is_lease_lost(&self) -> bool {
        matches!(
            self,
            CoordinationError::SessionExpired { .. }
                | CoordinationError::Store {
                    source: StoreError::LeaseNotFound { .. }
                }
        )
    }
}

/// Errors while loading or validating configuration.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[snafu(display("failed to read config file {}: {source}", path.display()))]
    ReadFile {
        /// Path of the file.
        path: PathBuf,
        /// The underlying error.
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML for this schema.
    #[snafu(display("failed to parse config: {source}"))]
    Parse {
        /// The underlying error.
        source: toml::de::Error,
    },

    /// An environment override could not be parsed.
    #[snafu(display("invalid value '{value}' for {name}"))]
    InvalidOverride {
        /// Variable name.
        name: String,
        /// Offending value.
        value: String,
    },

    /// A field is out of range.
    #[snafu(display("invalid config field {field}: {reason}"))]
    InvalidField {
        /// Field path.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}
