//! Relay configuration
//!
//! One JSON file, every field optional:
//!
//! ```json
//! {
//!   "listenAddr": "0.0.0.0:8090",
//!   "publicWebsocketBase": "wss://relay.example.com",
//!   "trustForwardedHeaders": false,
//!   "knownHostsPath": "/var/lib/ssh-relay/known_hosts",
//!   "maxSessions": 100,
//!   "rateLimit": {"perSecond": 1.0, "burst": 5},
//!   "store": {"backend": "sqlite", "url": "sqlite:///var/lib/ssh-relay/sessions.db"},
//!   "inventoryPath": "/etc/ssh-relay/inventory.json"
//! }
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::rate_limit::RateLimitConfig;
use crate::ssh::HostKeyPolicy;
use crate::store::StoreConfig;

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "SSH_RELAY_CONFIG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error reading {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("JSON error in {path:?}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    /// Base of the `websocketUrl` returned by connect
    pub public_websocket_base: String,
    /// Take the client address from X-Forwarded-For / X-Real-IP. Only for
    /// relays reachable solely through a proxy that overwrites them.
    pub trust_forwarded_headers: bool,
    pub known_hosts_path: PathBuf,
    /// SSH dial + handshake + auth timeout
    pub ssh_timeout_secs: u64,
    /// 0 = unlimited
    pub max_sessions: usize,
    pub rate_limit: RateLimitConfig,
    pub sweep_interval_secs: u64,
    /// Hard cap on a live session's age
    pub max_session_age_secs: u64,
    /// Stored sessions idle this long are marked inactive
    pub store_idle_timeout_secs: u64,
    pub activity_flush_secs: u64,
    pub default_cols: u32,
    pub default_rows: u32,
    pub store: StoreConfig,
    /// Hosts, keys, mappings, secrets and tokens
    pub inventory_path: Option<PathBuf>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8090)),
            public_websocket_base: "ws://localhost:8090".to_string(),
            trust_forwarded_headers: false,
            known_hosts_path: HostKeyPolicy::default_path(),
            ssh_timeout_secs: 30,
            max_sessions: 100,
            rate_limit: RateLimitConfig::default(),
            sweep_interval_secs: 300,
            max_session_age_secs: 3600,
            store_idle_timeout_secs: 3600,
            activity_flush_secs: 5,
            default_cols: 80,
            default_rows: 24,
            store: StoreConfig::default(),
            inventory_path: None,
        }
    }
}

impl RelayConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// `path` if given, else `$SSH_RELAY_CONFIG`, else defaults.
    pub fn resolve(path: Option<PathBuf>) -> Result<Self, ConfigError> {
        match path.or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from)) {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ssh_timeout_secs == 0 {
            return Err(ConfigError::Invalid("sshTimeoutSecs must be positive".into()));
        }
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid("sweepIntervalSecs must be positive".into()));
        }
        if self.default_cols == 0 || self.default_rows == 0 {
            return Err(ConfigError::Invalid("default terminal size must be positive".into()));
        }
        let rate = self.rate_limit.per_second;
        if rate.is_nan() || rate <= 0.0 || self.rate_limit.burst == 0 {
            return Err(ConfigError::Invalid(
                "rateLimit needs a positive rate and burst".into(),
            ));
        }
        Ok(())
    }

    pub fn ssh_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.listen_addr.port(), 8090);
        assert_eq!(config.max_sessions, 100);
        assert_eq!(config.sweep_interval_secs, 300);
        assert_eq!(config.max_session_age_secs, 3600);
        assert_eq!(config.rate_limit.burst, 5);
        assert!(!config.trust_forwarded_headers);
        assert_eq!(config.store, StoreConfig::Memory);
        assert!(config.known_hosts_path.ends_with("known_hosts"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.json");
        std::fs::write(
            &path,
            r#"{
                "listenAddr": "127.0.0.1:9000",
                "maxSessions": 0,
                "trustForwardedHeaders": true,
                "rateLimit": {"burst": 10},
                "store": {"backend": "redb", "path": "/tmp/sessions.redb"}
            }"#,
        )
        .unwrap();

        let config = RelayConfig::load(&path).unwrap();
        assert_eq!(config.listen_addr.port(), 9000);
        assert_eq!(config.max_sessions, 0);
        assert!(config.trust_forwarded_headers);
        assert_eq!(config.rate_limit.burst, 10);
        assert_eq!(config.rate_limit.per_second, 1.0);
        assert_eq!(
            config.store,
            StoreConfig::Redb {
                path: PathBuf::from("/tmp/sessions.redb")
            }
        );
        assert_eq!(config.ssh_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.json");
        std::fs::write(&path, r#"{"sshTimeoutSecs": 0}"#).unwrap();
        assert!(matches!(
            RelayConfig::load(&path),
            Err(ConfigError::Invalid(_))
        ));

        std::fs::write(&path, "{").unwrap();
        assert!(matches!(RelayConfig::load(&path), Err(ConfigError::Json { .. })));
    }
}
