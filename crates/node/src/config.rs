//! Configuration module for a RedRing node
//!
//! Supports YAML configuration files with module-based organization; command
//! line flags override file values.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Cluster configuration
    #[serde(default)]
    pub cluster: ClusterConfig,
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(String),
    #[error("config parse error: {0}")]
    Parse(String),
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_yaml(&content)
    }

    /// Load configuration from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Merge with another config (other takes precedence)
    pub fn merge(&mut self, other: Config) {
        self.server.merge(other.server);
        self.database.merge(other.database);
        self.cluster.merge(other.cluster);
        self.log.merge(other.log);
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// RESP listen address
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:6399".to_string(),
        }
    }
}

impl ServerConfig {
    fn merge(&mut self, other: Self) {
        if !other.bind.is_empty() {
            self.bind = other.bind;
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Number of logical databases
    #[serde(default = "default_databases")]
    pub databases: usize,
    /// Data directory (holds the append-only file)
    pub data_dir: PathBuf,
    /// Whether the append-only file is enabled
    #[serde(default = "default_true")]
    pub append_only: bool,
    /// Append-only file name, relative to the data directory
    #[serde(default = "default_aof_filename")]
    pub append_filename: String,
}

fn default_databases() -> usize {
    16
}

fn default_true() -> bool {
    true
}

fn default_aof_filename() -> String {
    "appendonly.aof".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            databases: default_databases(),
            data_dir: PathBuf::from("./data"),
            append_only: true,
            append_filename: default_aof_filename(),
        }
    }
}

impl DatabaseConfig {
    fn merge(&mut self, other: Self) {
        if other.databases > 0 {
            self.databases = other.databases;
        }
        if !other.data_dir.as_os_str().is_empty() {
            self.data_dir = other.data_dir;
        }
        self.append_only = other.append_only;
        if !other.append_filename.is_empty() {
            self.append_filename = other.append_filename;
        }
    }

    /// Full path of the append-only file
    pub fn aof_path(&self) -> PathBuf {
        self.data_dir.join(&self.append_filename)
    }
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Whether cluster mode is enabled
    #[serde(default)]
    pub enabled: bool,
    /// This node's advertised address (defaults to the server bind address)
    #[serde(default)]
    pub self_addr: String,
    /// Peer node addresses
    #[serde(default)]
    pub peers: Vec<String>,
    /// Virtual nodes per physical node on the hash ring
    #[serde(default = "default_replicas")]
    pub replicas: usize,
}

fn default_replicas() -> usize {
    16
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            self_addr: String::new(),
            peers: Vec::new(),
            replicas: default_replicas(),
        }
    }
}

impl ClusterConfig {
    fn merge(&mut self, other: Self) {
        self.enabled = self.enabled || other.enabled;
        if !other.self_addr.is_empty() {
            self.self_addr = other.self_addr;
        }
        if !other.peers.is_empty() {
            self.peers = other.peers;
        }
        if other.replicas > 0 {
            self.replicas = other.replicas;
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl LogConfig {
    fn merge(&mut self, other: Self) {
        if !other.level.is_empty() {
            self.level = other.level;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.server.bind, "127.0.0.1:6399");
        assert_eq!(config.database.databases, 16);
        assert!(config.database.append_only);
        assert!(!config.cluster.enabled);
    }

    #[test]
    fn parses_partial_yaml() {
        let config = Config::from_yaml(
            r#"
server:
  bind: "0.0.0.0:7000"
cluster:
  enabled: true
  peers:
    - "10.0.0.2:7000"
    - "10.0.0.3:7000"
"#,
        )
        .unwrap();
        assert_eq!(config.server.bind, "0.0.0.0:7000");
        assert!(config.cluster.enabled);
        assert_eq!(config.cluster.peers.len(), 2);
        assert_eq!(config.cluster.replicas, 16, "unset fields keep defaults");
    }

    #[test]
    fn merge_prefers_the_override() {
        let mut base = Config::default();
        let mut over = Config::default();
        over.server.bind = "127.0.0.1:7001".to_string();
        over.database.databases = 4;
        base.merge(over);
        assert_eq!(base.server.bind, "127.0.0.1:7001");
        assert_eq!(base.database.databases, 4);
    }

    #[test]
    fn aof_path_joins_data_dir() {
        let config = Config::default();
        assert_eq!(
            config.database.aof_path(),
            PathBuf::from("./data/appendonly.aof")
        );
    }
}
