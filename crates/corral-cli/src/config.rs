//! Configuration file for the CLI.
//!
//! ```toml
//! [etcd]
//! endpoints = ["http://10.0.0.1:2379"]
//!
//! [coordination]
//! node_name = "worker-1"
//! session_ttl_secs = 30
//! ```
//!
//! Precedence, lowest first: defaults, the file, `CORRAL_*` environment
//! variables, command-line flags.

use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use corral_coordination::CoordinationConfig;
use corral_etcd::EtcdConfig;
use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub etcd: EtcdConfig,
    pub coordination: CoordinationConfig,
}

impl CliConfig {
    /// Read `path` if given, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let contents =
                    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
                toml::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))?
            }
            None => Self::default(),
        };
        config.coordination.apply_env_overrides().context("invalid environment override")?;
        Ok(config)
    }

    /// Apply command-line flags on top of the loaded values.
    pub fn apply_flags(&mut self, endpoints: &[String], node_name: Option<&str>, timeout_ms: Option<u64>) {
        if !endpoints.is_empty() {
            self.etcd.endpoints = endpoints.to_vec();
        }
        if let Some(node_name) = node_name {
            self.coordination.node_name = node_name.to_string();
        }
        if let Some(timeout_ms) = timeout_ms {
            self.coordination.operation_timeout_ms = timeout_ms;
            self.etcd.request_timeout_ms = timeout_ms;
        }
    }
}
