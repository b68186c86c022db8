use corral_core::constants::DEFAULT_DIAL_KEEP_ALIVE_MS;
use corral_core::constants::DEFAULT_DIAL_TIMEOUT_MS;
use corral_core::constants::DEFAULT_OPERATION_TIMEOUT_MS;
use serde::Deserialize;
use serde::Serialize;

/// Connection settings for an etcd cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EtcdConfig {
    /// Client endpoints, e.g. `http://127.0.0.1:2379`.
    pub endpoints: Vec<String>,
    /// Username for authenticated clusters.
    pub username: Option<String>,
    /// Password for authenticated clusters.
    pub password: Option<String>,
    /// Timeout for establishing the connection.
    pub dial_timeout_ms: u64,
    /// HTTP/2 keep-alive interval (and timeout) of the transport.
    pub keep_alive_ms: u64,
    /// Deadline applied to every request.
    pub request_timeout_ms: u64,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            username: None,
            password: None,
            dial_timeout_ms: DEFAULT_DIAL_TIMEOUT_MS,
            keep_alive_ms: DEFAULT_DIAL_KEEP_ALIVE_MS,
            request_timeout_ms: DEFAULT_OPERATION_TIMEOUT_MS,
        }
    }
}

impl EtcdConfig {
    /// Credentials, when both a username and a password are configured.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(user), Some(password)) if !user.is_empty() => Some((user.as_str(), password.as_str())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_point_at_local_etcd() {
        let config = EtcdConfig::default();
        assert_eq!(config.endpoints, vec!["http://127.0.0.1:2379".to_string()]);
        assert_eq!(config.dial_timeout_ms, 5_000);
        assert!(config.credentials().is_none());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: EtcdConfig = toml::from_str(
            r#"
            endpoints = ["http://10.0.0.1:2379", "http://10.0.0.2:2379"]
            username = "root"
            password = "secret"
            "#,
        )
        .unwrap();
        assert_eq!(config.endpoints.len(), 2);
        assert_eq!(config.keep_alive_ms, 5_000);
        assert_eq!(config.credentials(), Some(("root", "secret")));
    }

    #[test]
    fn username_without_password_is_anonymous() {
        let config = EtcdConfig {
            username: Some("root".to_string()),
            ..Default::default()
        };
        assert!(config.credentials().is_none());
    }
}
