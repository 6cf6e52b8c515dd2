//! Client configuration file.
//!
//! ```yaml
//! server: "127.0.0.1:55180"
//! num_partitions: 4
//! tls:
//!   enabled: true
//!   ca_cert_path: /etc/waltz/ca.pem
//! ```

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use waltz_client::{ConnectionConfig, TlsClientConfig, WaltzClientConfig};
use waltz_protocol::DEFAULT_PORT;

/// Configuration shared by every client the CLI creates.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientCliConfig {
    #[serde(deserialize_with = "deserialize_socket_addr")]
    pub server: SocketAddr,
    pub num_partitions: i32,
    pub client_id: Option<i32>,
    pub tls: TlsClientConfig,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub liveness_timeout_secs: u64,
    pub max_submit_retries: u32,
}

impl Default for ClientCliConfig {
    fn default() -> Self {
        Self {
            server: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            num_partitions: 1,
            client_id: None,
            tls: TlsClientConfig::default(),
            connect_timeout_secs: 10,
            idle_timeout_secs: 30,
            liveness_timeout_secs: 60,
            max_submit_retries: 32,
        }
    }
}

impl ClientCliConfig {
    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let config: Self = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_partitions < 1 {
            return Err(ConfigError::Validation(format!(
                "num_partitions must be at least 1, got {}",
                self.num_partitions
            )));
        }
        if self.liveness_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "liveness_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Connection settings for the configured server.
    pub fn connection_config(&self) -> ConnectionConfig {
        let config = ConnectionConfig::new(self.server)
            .with_connect_timeout(Duration::from_secs(self.connect_timeout_secs))
            .with_idle_timeout(Duration::from_secs(self.idle_timeout_secs))
            .with_liveness_timeout(Duration::from_secs(self.liveness_timeout_secs));
        if self.tls.enabled {
            config.with_tls(self.tls.clone())
        } else {
            config
        }
    }

    /// Data-plane client settings.
    pub fn client_config(&self) -> WaltzClientConfig {
        let config = WaltzClientConfig::new(self.connection_config(), self.num_partitions)
            .with_max_submit_retries(self.max_submit_retries);
        match self.client_id {
            Some(id) => config.with_client_id(id),
            None => config,
        }
    }
}

fn deserialize_socket_addr<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.parse().map_err(serde::de::Error::custom)
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
