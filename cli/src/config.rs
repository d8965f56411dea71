// Configuration management for the meshmerge CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/meshmerge/config.json
// - Linux: ~/.config/meshmerge/config.json
// - Windows: %APPDATA%\meshmerge\config.json

use anyhow::{Context, Result};
use meshmerge_core::{NetworkConfig, RepoConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Port the node listens on (0 picks a random one)
    pub listen_port: u16,

    /// Nodes to dial on start, as host:port
    pub peers: Vec<String>,

    /// Repo storage path; defaults to the platform data directory
    pub storage_path: Option<String>,

    /// Connection timing
    pub network: NetworkConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: 0,
            peers: Vec::new(),
            storage_path: None,
            network: NetworkConfig::default(),
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("meshmerge");
        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
        Ok(config_dir)
    }

    /// Get the data directory path (cross-platform)
    pub fn data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to determine data directory")?
            .join("meshmerge");
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;
        Ok(data_dir)
    }

    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the default location, creating it if missing
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            config.network.validate().context("Invalid network settings")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Where the repo lives
    pub fn storage_path(&self) -> Result<PathBuf> {
        match &self.storage_path {
            Some(path) => Ok(PathBuf::from(path)),
            None => Ok(Self::data_dir()?.join("repo")),
        }
    }

    pub fn repo_config(&self) -> Result<RepoConfig> {
        Ok(RepoConfig {
            storage_path: Some(self.storage_path()?),
            network: self.network.clone(),
        })
    }

    /// Set a config value
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "listen_port" => {
                self.listen_port = value.parse().context("Invalid port number")?;
            }
            "storage_path" => {
                self.storage_path = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "heartbeat_interval_ms" => {
                self.network.heartbeat_interval_ms = value.parse().context("Invalid number")?;
            }
            "peer_timeout_ms" => {
                self.network.peer_timeout_ms = value.parse().context("Invalid number")?;
            }
            "handshake_timeout_ms" => {
                self.network.handshake_timeout_ms = value.parse().context("Invalid number")?;
            }
            "close_grace_ms" => {
                self.network.close_grace_ms = value.parse().context("Invalid number")?;
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        self.network.validate().context("Invalid network settings")?;
        Ok(())
    }

    pub fn add_peer(&mut self, addr: String) {
        if !self.peers.contains(&addr) {
            self.peers.push(addr);
        }
    }

    pub fn remove_peer(&mut self, addr: &str) {
        self.peers.retain(|p| p != addr);
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        vec![
            ("listen_port".to_string(), self.listen_port.to_string()),
            (
                "storage_path".to_string(),
                self.storage_path.clone().unwrap_or_else(|| "(auto)".to_string()),
            ),
            (
                "heartbeat_interval_ms".to_string(),
                self.network.heartbeat_interval_ms.to_string(),
            ),
            ("peer_timeout_ms".to_string(), self.network.peer_timeout_ms.to_string()),
            (
                "handshake_timeout_ms".to_string(),
                self.network.handshake_timeout_ms.to_string(),
            ),
            ("close_grace_ms".to_string(), self.network.close_grace_ms.to_string()),
            ("peers".to_string(), self.peers.join(", ")),
        ]
    }
}
