//! Configuration management for Sylve API
//!
//! This module provides a centralized configuration system that loads settings from:
//! 1. Environment variables (highest priority)
//! 2. Configuration file (TOML format)
//! 3. Default values (lowest priority)

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration struct for Sylve
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SylveConfig {
    /// Server configuration
    pub server: ServerConfig,
    /// Cluster configuration
    pub cluster: ClusterConfig,
    /// Storage paths configuration
    pub paths: PathsConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Data-protection engine tuning
    pub protection: ProtectionConfig,
    /// Logging configuration
    pub logging: LoggingSection,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to
    pub host: String,
    /// API port to listen on; peer forwarding rewrites the leader's Raft
    /// host to this port
    pub port: u16,
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Raft bind address (host:port)
    pub raft_addr: String,
    /// Raft election timeout floor in milliseconds; the actual timeout is
    /// randomized between this and 2x this
    pub election_timeout_ms: u64,
    /// Leader heartbeat interval in milliseconds
    pub heartbeat_interval_ms: u64,
    /// Compact the Raft log once it exceeds this many applied entries
    pub log_compaction_threshold: u64,
}

/// Storage paths configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Base directory for Sylve data
    pub data_dir: PathBuf,
    /// Private secret directory for backup-target SSH keys (0700)
    pub secrets: PathBuf,
    /// Directory holding guest state side files (nvram, tpm, logs)
    pub guest_state: PathBuf,
    /// Cluster SSH identity key pair location
    pub cluster_ssh_key: PathBuf,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database URL (e.g., "sqlite:///var/lib/sylve/sylve.db")
    pub url: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
}

/// Data-protection engine tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectionConfig {
    /// Upper bound on concurrently running replication workers
    pub replication_workers: usize,
    /// Upper bound on concurrently running backup workers
    pub backup_workers: usize,
    /// Seconds to wait for a jail/VM to shut down before killing it
    pub shutdown_wait_secs: u64,
    /// SSH connect timeout in seconds for target validation and sends
    pub ssh_connect_timeout_secs: u64,
}

/// Logging configuration section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Directory for log files
    pub log_dir: PathBuf,
}

impl Default for SylveConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            cluster: ClusterConfig::default(),
            paths: PathsConfig::default(),
            database: DatabaseConfig::default(),
            protection: ProtectionConfig::default(),
            logging: LoggingSection::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8181,
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            raft_addr: "0.0.0.0:8182".to_string(),
            election_timeout_ms: 1500,
            heartbeat_interval_ms: 500,
            log_compaction_threshold: 4096,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        let data_dir = PathBuf::from("/var/lib/sylve");
        Self {
            secrets: data_dir.join("secrets"),
            guest_state: data_dir.join("guests"),
            cluster_ssh_key: data_dir.join("cluster_id_ed25519"),
            data_dir,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:///var/lib/sylve/sylve.db".to_string(),
            max_connections: 10,
        }
    }
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        Self {
            replication_workers: 4,
            backup_workers: 4,
            shutdown_wait_secs: 45,
            ssh_connect_timeout_secs: 30,
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: PathBuf::from("/var/log/sylve"),
        }
    }
}

impl SylveConfig {
    /// Load configuration: file (SYLVE_CONFIG or /etc/sylve/config.toml),
    /// then environment variable overrides.
    pub fn load() -> Self {
        let path = std::env::var("SYLVE_CONFIG")
            .unwrap_or_else(|_| "/etc/sylve/config.toml".to_string());

        let mut config = match std::fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!("Failed to parse config file {}: {}", path, e);
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        };

        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("SYLVE_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("SYLVE_PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }
        if let Ok(addr) = std::env::var("SYLVE_RAFT_ADDR") {
            self.cluster.raft_addr = addr;
        }
        if let Ok(url) = std::env::var("SYLVE_DATABASE_URL") {
            self.database.url = url;
        }
        if let Ok(dir) = std::env::var("SYLVE_DATA_DIR") {
            let data_dir = PathBuf::from(dir);
            self.paths.secrets = data_dir.join("secrets");
            self.paths.guest_state = data_dir.join("guests");
            self.paths.cluster_ssh_key = data_dir.join("cluster_id_ed25519");
            self.paths.data_dir = data_dir;
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("server.port must be non-zero".to_string());
        }
        if !self.cluster.raft_addr.contains(':') {
            return Err(format!(
                "cluster.raft_addr '{}' is not host:port",
                self.cluster.raft_addr
            ));
        }
        if self.database.max_connections == 0 {
            return Err("database.max_connections must be at least 1".to_string());
        }
        if self.protection.replication_workers == 0 || self.protection.backup_workers == 0 {
            return Err("protection worker pools must be at least 1".to_string());
        }
        Ok(())
    }

    /// Local hostname used for node registration and JWT claims.
    pub fn local_hostname() -> String {
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = SylveConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.port, 8181);
        assert!(config.cluster.raft_addr.contains(':'));
    }

    #[test]
    fn test_invalid_raft_addr() {
        let mut config = SylveConfig::default();
        config.cluster.raft_addr = "no-port".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = SylveConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let back: SylveConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(back.server.port, config.server.port);
        assert_eq!(back.paths.data_dir, config.paths.data_dir);
    }
}
