// Repo configuration
//
// Everything has a default, so a partial JSON file (or none at all) is a
// valid configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("peer_timeout_ms ({timeout}) must exceed heartbeat_interval_ms ({interval})")]
    TimeoutBelowHeartbeat { timeout: u64, interval: u64 },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepoConfig {
    /// Where the repo database lives. `None` keeps everything in memory.
    pub storage_path: Option<PathBuf>,

    /// Connection timing
    pub network: NetworkConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// How often each connection sends a heartbeat
    pub heartbeat_interval_ms: u64,

    /// A connection silent for this long is destroyed
    pub peer_timeout_ms: u64,

    /// Limit on waiting for the remote's Hello
    pub handshake_timeout_ms: u64,

    /// How long a graceful close waits for channels to drain
    pub close_grace_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 5_000,
            peer_timeout_ms: 30_000,
            handshake_timeout_ms: 10_000,
            close_grace_ms: 2_000,
        }
    }
}

impl NetworkConfig {
    /// Reject timings the connection tasks cannot run with. `close_grace_ms`
    /// may be zero, which closes connections without draining.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Zero("heartbeat_interval_ms"));
        }
        if self.peer_timeout_ms == 0 {
            return Err(ConfigError::Zero("peer_timeout_ms"));
        }
        if self.handshake_timeout_ms == 0 {
            return Err(ConfigError::Zero("handshake_timeout_ms"));
        }
        if self.peer_timeout_ms <= self.heartbeat_interval_ms {
            return Err(ConfigError::TimeoutBelowHeartbeat {
                timeout: self.peer_timeout_ms,
                interval: self.heartbeat_interval_ms,
            });
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }
}

impl RepoConfig {
    /// In-memory repo with default timing
    pub fn memory() -> Self {
        Self::default()
    }

    /// Persistent repo rooted at `path`
    pub fn persistent(path: impl Into<PathBuf>) -> Self {
        Self {
            storage_path: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn is_memory(&self) -> bool {
        self.storage_path.is_none()
    }

    /// Load from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: RepoConfig =
            serde_json::from_str(&content).context("Failed to parse config file")?;
        config
            .network
            .validate()
            .with_context(|| format!("Invalid network settings in {}", path.display()))?;
        Ok(config)
    }

    /// Save as pretty JSON, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let content = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: RepoConfig =
            serde_json::from_str(r#"{"network":{"peer_timeout_ms":500}}"#).unwrap();
        assert!(config.is_memory());
        assert_eq!(config.network.peer_timeout(), Duration::from_millis(500));
        assert_eq!(config.network.heartbeat_interval_ms, 5_000);
    }

    #[test]
    fn test_zero_timings_rejected() {
        let config: NetworkConfig =
            serde_json::from_str(r#"{"heartbeat_interval_ms":0}"#).unwrap();
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero("heartbeat_interval_ms"))
        );

        let config = NetworkConfig {
            peer_timeout_ms: 1_000,
            heartbeat_interval_ms: 1_000,
            ..NetworkConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TimeoutBelowHeartbeat { .. })
        ));
        assert!(NetworkConfig::default().validate().is_ok());
    }

    #[test]
    fn test_load_rejects_zero_heartbeat() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"network":{"heartbeat_interval_ms":0}}"#).unwrap();
        assert!(RepoConfig::load(&path).is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let config = RepoConfig::persistent(dir.path().join("repo"));
        config.save(&path).unwrap();
        assert_eq!(RepoConfig::load(&path).unwrap(), config);
    }
}
