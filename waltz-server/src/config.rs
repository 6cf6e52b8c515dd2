//! Server configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via WALTZ_CONFIG or --config)
//! 3. Environment variables

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use waltz_protocol::DEFAULT_PORT;

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network configuration.
    pub network: NetworkConfig,
    /// Partitions and storage layout.
    pub cluster: ClusterConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("WALTZ_CONFIG") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.cluster.apply_env_overrides();
    }

    /// Checks values the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.network.validate()?;
        self.cluster.validate()
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::Io(path.to_path_buf(), e))
    }
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Sessions without feeds are closed after this many idle seconds.
    pub idle_timeout_secs: u64,
    /// Outbound writes stalled longer than this close the session.
    pub liveness_timeout_secs: u64,
    /// Maximum concurrent connections.
    pub max_connections: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            idle_timeout_secs: 300,
            liveness_timeout_secs: 60,
            max_connections: 1000,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("WALTZ_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }

        if let Ok(timeout) = std::env::var("WALTZ_IDLE_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.idle_timeout_secs = secs;
            }
        }

        if let Ok(timeout) = std::env::var("WALTZ_LIVENESS_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.liveness_timeout_secs = secs;
            }
        }

        if let Ok(max) = std::env::var("WALTZ_MAX_CONNECTIONS") {
            if let Ok(n) = max.parse() {
                self.max_connections = n;
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.liveness_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "liveness_timeout_secs must be positive".to_string(),
            ));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Validation(
                "max_connections must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns idle timeout as Duration.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Returns liveness timeout as Duration.
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs)
    }
}

/// Partition and storage layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub num_partitions: i32,
    /// Maximum records streamed by a feed before it is suspended.
    pub feed_batch_size: usize,
    /// Storage node addresses reported by connectivity checks.
    pub storage_nodes: Vec<String>,
    /// Partitions that refuse mounts until made available.
    pub unavailable_partitions: Vec<i32>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            num_partitions: 1,
            feed_batch_size: 1000,
            storage_nodes: Vec::new(),
            unavailable_partitions: Vec::new(),
        }
    }
}

impl ClusterConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(n) = std::env::var("WALTZ_NUM_PARTITIONS") {
            if let Ok(n) = n.parse() {
                self.num_partitions = n;
            }
        }

        if let Ok(size) = std::env::var("WALTZ_FEED_BATCH_SIZE") {
            if let Ok(size) = size.parse() {
                self.feed_batch_size = size;
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.num_partitions < 1 {
            return Err(ConfigError::Validation(format!(
                "num_partitions must be at least 1, got {}",
                self.num_partitions
            )));
        }
        if self.feed_batch_size == 0 {
            return Err(ConfigError::Validation(
                "feed_batch_size must be positive".to_string(),
            ));
        }
        if let Some(p) = self
            .unavailable_partitions
            .iter()
            .find(|p| **p < 0 || **p >= self.num_partitions)
        {
            return Err(ConfigError::Validation(format!(
                "unavailable partition {} out of range",
                p
            )));
        }
        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {}", .0.display(), .1)]
    Io(PathBuf, std::io::Error),

    #[error("failed to parse config file '{}': {}", .0.display(), .1)]
    Parse(PathBuf, String),

    #[error("configuration validation failed: {0}")]
    Validation(String),
}

/// Custom serde module for SocketAddr (to handle as string in YAML).
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.bind_addr.port(), 55180);
        assert_eq!(config.network.liveness_timeout(), Duration::from_secs(60));
        assert_eq!(config.cluster.num_partitions, 1);
        assert_eq!(config.cluster.feed_batch_size, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "network:\n  bind_addr: \"0.0.0.0:6000\"\ncluster:\n  num_partitions: 4\n  storage_nodes:\n    - \"storage-1:55280\"\n  unavailable_partitions: [3]"
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.network.bind_addr.port(), 6000);
        assert_eq!(config.network.max_connections, 1000);
        assert_eq!(config.cluster.num_partitions, 4);
        assert_eq!(config.cluster.storage_nodes, vec!["storage-1:55280"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_error_names_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "network: [not, a, map]").unwrap();

        let err = Config::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(ref path, _) if path == file.path()));
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.cluster.num_partitions = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));

        let mut config = Config::default();
        config.cluster.num_partitions = 2;
        config.cluster.unavailable_partitions = vec![2];
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.cluster.feed_batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("waltz.yaml");
        let mut config = Config::default();
        config.cluster.num_partitions = 8;
        config.save(&path).unwrap();

        let parsed = Config::from_file(&path).unwrap();
        assert_eq!(parsed.network.bind_addr, config.network.bind_addr);
        assert_eq!(parsed.cluster.num_partitions, 8);
    }
}
