//! Configuration for the coordination client and its primitives.
//!
//! Values come from defaults, an optional TOML file, then `CORRAL_*`
//! environment overrides, in that order. [`CoordinationConfig::validate`] runs
//! after every layer has been applied.

use std::path::Path;
use std::time::Duration;

use corral_core::constants::DEFAULT_CAMPAIGN_TIMEOUT_SECS;
use corral_core::constants::DEFAULT_CLAIM_BATCH_SIZE;
use corral_core::constants::DEFAULT_CLAIM_INITIAL_BACKOFF_MS;
use corral_core::constants::DEFAULT_CLAIM_MAX_BACKOFF_MS;
use corral_core::constants::DEFAULT_ELECTION_ERROR_BACKOFF_MS;
use corral_core::constants::DEFAULT_MAX_CLAIM_ATTEMPTS;
use corral_core::constants::DEFAULT_NODE_NAME;
use corral_core::constants::DEFAULT_OBSERVE_INTERVAL_MS;
use corral_core::constants::DEFAULT_OPERATION_TIMEOUT_MS;
use corral_core::constants::DEFAULT_SESSION_TTL_SECS;
use corral_core::constants::DEFAULT_SUBSCRIPTION_CAPACITY;
use corral_core::constants::DEFAULT_WATCH_POOL_CAPACITY;
use corral_core::constants::DEFAULT_WATCH_RECONNECT_DELAY_MS;
use corral_core::constants::DEFAULT_WATCH_WINDOW_SECS;
use corral_core::constants::DEFAULT_WRITE_RETRY_ATTEMPTS;
use corral_core::constants::DEFAULT_WRITE_RETRY_DELAY_MS;
use corral_core::constants::MAX_CLAIM_BATCH_SIZE;
use corral_core::constants::MAX_WATCH_POOL_CAPACITY;
use corral_core::constants::MIN_SESSION_TTL_SECS;
use serde::Deserialize;
use serde::Serialize;
use snafu::ResultExt;

use crate::error::ConfigError;
use crate::error::InvalidFieldSnafu;
use crate::error::ParseSnafu;
use crate::error::ReadFileSnafu;

/// Top-level coordination settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// Identity written into election candidate keys.
    pub node_name: String,
    /// Bound on each remote call.
    pub operation_timeout_ms: u64,
    /// TTL of lock sessions.
    pub session_ttl_secs: i64,
    /// Attempts for single-key writes that fail transiently.
    pub write_retry_attempts: u32,
    /// Fixed delay between write attempts.
    pub write_retry_delay_ms: u64,
    /// Watcher settings.
    pub watcher: WatcherConfig,
    /// Priority queue settings.
    pub queue: QueueConfig,
    /// Election settings.
    pub election: ElectionConfig,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            node_name: DEFAULT_NODE_NAME.to_string(),
            operation_timeout_ms: DEFAULT_OPERATION_TIMEOUT_MS,
            session_ttl_secs: DEFAULT_SESSION_TTL_SECS,
            write_retry_attempts: DEFAULT_WRITE_RETRY_ATTEMPTS,
            write_retry_delay_ms: DEFAULT_WRITE_RETRY_DELAY_MS,
            watcher: WatcherConfig::default(),
            queue: QueueConfig::default(),
            election: ElectionConfig::default(),
        }
    }
}

/// Watcher settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Maximum callbacks running at once per watcher.
    pub pool_capacity: usize,
    /// A stream is reopened after this long even if healthy.
    pub window_secs: u64,
    /// Pause after a stream closes before reopening it.
    pub reconnect_delay_ms: u64,
    /// Buffer of channel subscriptions.
    pub subscription_capacity: usize,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            pool_capacity: DEFAULT_WATCH_POOL_CAPACITY,
            window_secs: DEFAULT_WATCH_WINDOW_SECS,
            reconnect_delay_ms: DEFAULT_WATCH_RECONNECT_DELAY_MS,
            subscription_capacity: DEFAULT_SUBSCRIPTION_CAPACITY,
        }
    }
}

/// Priority queue settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Candidates fetched per claim round.
    pub claim_batch_size: u32,
    /// Contended rounds before `ContentionExceeded`.
    pub max_claim_attempts: u32,
    /// First pause between contended rounds.
    pub claim_initial_backoff_ms: u64,
    /// Ceiling of the pause between contended rounds.
    pub claim_max_backoff_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            claim_batch_size: DEFAULT_CLAIM_BATCH_SIZE,
            max_claim_attempts: DEFAULT_MAX_CLAIM_ATTEMPTS,
            claim_initial_backoff_ms: DEFAULT_CLAIM_INITIAL_BACKOFF_MS,
            claim_max_backoff_ms: DEFAULT_CLAIM_MAX_BACKOFF_MS,
        }
    }
}

/// Election settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElectionConfig {
    /// Bound on one campaign attempt.
    pub campaign_timeout_secs: u64,
    /// TTL of the election session. Zero uses the campaign timeout.
    pub session_ttl_secs: i64,
    /// Pause between leader observations.
    pub observe_interval_ms: u64,
    /// Pause after a failed leader query.
    pub error_backoff_ms: u64,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            campaign_timeout_secs: DEFAULT_CAMPAIGN_TIMEOUT_SECS,
            session_ttl_secs: 0,
            observe_interval_ms: DEFAULT_OBSERVE_INTERVAL_MS,
            error_backoff_ms: DEFAULT_ELECTION_ERROR_BACKOFF_MS,
        }
    }
}

impl ElectionConfig {
    /// Bound on one campaign attempt.
    pub fn campaign_timeout(&self) -> Duration {
        Duration::from_secs(self.campaign_timeout_secs)
    }

    /// TTL the election session is granted with.
    pub fn effective_session_ttl_secs(&self) -> i64 {
        if self.session_ttl_secs > 0 {
            self.session_ttl_secs
        } else {
            i64::try_from(self.campaign_timeout_secs).unwrap_or(i64::MAX).max(MIN_SESSION_TTL_SECS)
        }
    }

    pub fn observe_interval(&self) -> Duration {
        Duration::from_millis(self.observe_interval_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }
}

impl WatcherConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl CoordinationConfig {
    /// Parse a TOML document. Missing fields keep their defaults.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        toml::from_str(input).context(ParseSnafu)
    }

    /// Load a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).context(ReadFileSnafu { path })?;
        Self::from_toml_str(&contents)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn write_retry_delay(&self) -> Duration {
        Duration::from_millis(self.write_retry_delay_ms)
    }

    /// Apply `CORRAL_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply `CORRAL_*` overrides from an arbitrary source.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        fn parse<T: std::str::FromStr>(name: &str, value: String) -> Result<T, ConfigError> {
            value.parse().map_err(|_| ConfigError::InvalidOverride {
                name: name.to_string(),
                value,
            })
        }

        macro_rules! apply_override {
            ($($field:ident).+, $env:literal) => {
                if let Some(value) = lookup($env) {
                    self.$($field).+ = parse($env, value)?;
                }
            };
        }

        if let Some(name) = lookup("CORRAL_NODE_NAME") {
            self.node_name = name;
        }
        apply_override!(operation_timeout_ms, "CORRAL_OPERATION_TIMEOUT_MS");
        apply_override!(session_ttl_secs, "CORRAL_SESSION_TTL_SECS");
        apply_override!(write_retry_attempts, "CORRAL_WRITE_RETRY_ATTEMPTS");
        apply_override!(write_retry_delay_ms, "CORRAL_WRITE_RETRY_DELAY_MS");

        // Watcher
        apply_override!(watcher.pool_capacity, "CORRAL_WATCH_POOL_CAPACITY");
        apply_override!(watcher.window_secs, "CORRAL_WATCH_WINDOW_SECS");
        apply_override!(watcher.reconnect_delay_ms, "CORRAL_WATCH_RECONNECT_DELAY_MS");
        apply_override!(watcher.subscription_capacity, "CORRAL_WATCH_SUBSCRIPTION_CAPACITY");

        // Queue
        apply_override!(queue.claim_batch_size, "CORRAL_QUEUE_CLAIM_BATCH_SIZE");
        apply_override!(queue.max_claim_attempts, "CORRAL_QUEUE_MAX_CLAIM_ATTEMPTS");
        apply_override!(queue.claim_initial_backoff_ms, "CORRAL_QUEUE_CLAIM_INITIAL_BACKOFF_MS");
        apply_override!(queue.claim_max_backoff_ms, "CORRAL_QUEUE_CLAIM_MAX_BACKOFF_MS");

        // Election
        apply_override!(election.campaign_timeout_secs, "CORRAL_ELECTION_CAMPAIGN_TIMEOUT_SECS");
        apply_override!(election.session_ttl_secs, "CORRAL_ELECTION_SESSION_TTL_SECS");
        apply_override!(election.observe_interval_ms, "CORRAL_ELECTION_OBSERVE_INTERVAL_MS");
        apply_override!(election.error_backoff_ms, "CORRAL_ELECTION_ERROR_BACKOFF_MS");

        Ok(())
    }

    /// Reject values no primitive can run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_name.trim().is_empty() {
            return InvalidFieldSnafu {
                field: "node_name",
                reason: "must not be empty",
            }
            .fail();
        }
        if self.operation_timeout_ms == 0 {
            return InvalidFieldSnafu {
                field: "operation_timeout_ms",
                reason: "must be positive",
            }
            .fail();
        }
        if self.session_ttl_secs < MIN_SESSION_TTL_SECS {
            return InvalidFieldSnafu {
                field: "session_ttl_secs",
                reason: format!("must be at least {MIN_SESSION_TTL_SECS}"),
            }
            .fail();
        }
        if self.write_retry_attempts == 0 {
            return InvalidFieldSnafu {
                field: "write_retry_attempts",
                reason: "must be at least 1",
            }
            .fail();
        }
        if self.watcher.pool_capacity == 0 || self.watcher.pool_capacity > MAX_WATCH_POOL_CAPACITY {
            return InvalidFieldSnafu {
                field: "watcher.pool_capacity",
                reason: format!("must be between 1 and {MAX_WATCH_POOL_CAPACITY}"),
            }
            .fail();
        }
        if self.watcher.window_secs == 0 {
            return InvalidFieldSnafu {
                field: "watcher.window_secs",
                reason: "must be positive",
            }
            .fail();
        }
        if self.watcher.subscription_capacity == 0 {
            return InvalidFieldSnafu {
                field: "watcher.subscription_capacity",
                reason: "must be positive",
            }
            .fail();
        }
        if self.queue.claim_batch_size == 0 || self.queue.claim_batch_size > MAX_CLAIM_BATCH_SIZE {
            return InvalidFieldSnafu {
                field: "queue.claim_batch_size",
                reason: format!("must be between 1 and {MAX_CLAIM_BATCH_SIZE}"),
            }
            .fail();
        }
        if self.queue.max_claim_attempts == 0 {
            return InvalidFieldSnafu {
                field: "queue.max_claim_attempts",
                reason: "must be at least 1",
            }
            .fail();
        }
        if self.queue.claim_initial_backoff_ms > self.queue.claim_max_backoff_ms {
            return InvalidFieldSnafu {
                field: "queue.claim_initial_backoff_ms",
                reason: "must not exceed claim_max_backoff_ms",
            }
            .fail();
        }
        if self.election.campaign_timeout_secs == 0 {
            return InvalidFieldSnafu {
                field: "election.campaign_timeout_secs",
                reason: "must be positive",
            }
            .fail();
        }
        if self.election.session_ttl_secs < 0 {
            return InvalidFieldSnafu {
                field: "election.session_ttl_secs",
                reason: "must not be negative",
            }
            .fail();
        }
        if self.election.observe_interval_ms == 0 {
            return InvalidFieldSnafu {
                field: "election.observe_interval_ms",
                reason: "must be positive",
            }
            .fail();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = CoordinationConfig::default();
        config.validate().unwrap();
        assert_eq!(config.node_name, "corral-main");
        assert_eq!(config.operation_timeout(), Duration::from_secs(5));
        assert_eq!(config.watcher.window(), Duration::from_secs(900));
        assert_eq!(config.watcher.pool_capacity, 2_000);
        assert_eq!(config.election.effective_session_ttl_secs(), 5);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = CoordinationConfig::from_toml_str(
            r#"
            node_name = "worker-7"

            [queue]
            claim_batch_size = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.node_name, "worker-7");
        assert_eq!(config.queue.claim_batch_size, 4);
        assert_eq!(config.queue.max_claim_attempts, 32);
        assert_eq!(config.write_retry_attempts, 3);
    }

    #[test]
    fn unknown_type_is_a_parse_error() {
        let err = CoordinationConfig::from_toml_str("operation_timeout_ms = \"soon\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "session_ttl_secs = 10\n[election]\nsession_ttl_secs = 3").unwrap();

        let config = CoordinationConfig::load(file.path()).unwrap();
        assert_eq!(config.session_ttl_secs, 10);
        assert_eq!(config.election.effective_session_ttl_secs(), 3);
    }

    #[test]
    fn load_missing_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let err = CoordinationConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::ReadFile { .. }));
        assert!(err.to_string().contains("absent.toml"));
    }

    #[test]
    fn overrides_replace_file_values() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("CORRAL_NODE_NAME", "node-b"),
            ("CORRAL_WATCH_POOL_CAPACITY", "8"),
            ("CORRAL_ELECTION_OBSERVE_INTERVAL_MS", "50"),
        ]);
        let mut config = CoordinationConfig::default();
        config.apply_overrides(|name| env.get(name).map(|v| v.to_string())).unwrap();

        assert_eq!(config.node_name, "node-b");
        assert_eq!(config.watcher.pool_capacity, 8);
        assert_eq!(config.election.observe_interval(), Duration::from_millis(50));
    }

    #[test]
    fn unparsable_override_is_rejected() {
        let mut config = CoordinationConfig::default();
        let err = config
            .apply_overrides(|name| (name == "CORRAL_SESSION_TTL_SECS").then(|| "forever".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOverride { .. }));
    }

    #[test]
    fn validate_rejects_out_of_range_fields() {
        let mut config = CoordinationConfig::default();
        config.watcher.pool_capacity = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidField {
                field: "watcher.pool_capacity",
                ..
            })
        ));

        let mut config = CoordinationConfig::default();
        config.queue.claim_initial_backoff_ms = 5_000;
        assert!(config.validate().is_err());

        let mut config = CoordinationConfig {
            node_name: " ".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
        config.node_name = "ok".to_string();
        config.session_ttl_secs = 0;
        assert!(config.validate().is_err());
    }
}
