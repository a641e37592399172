use anyhow::{Context, Result};
use dirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub ssh_file_config: String,
    /// ssh client used for commands and as rsync's remote shell (e.g. `hpnssh`)
    pub ssh_binary: String,
    pub command_timeout_secs: u64,
    pub control_persist_secs: u64,
    pub remote_root: String,
    /// Container port to look up in the cloud provider's port mapping
    pub remap_container_port: Option<u16>,
    pub excluded_host_prefixes: Vec<String>,
    pub skip_compress: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        // Set default ssh config path
        let ssh_config_path = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("~"))
            .join(".ssh")
            .join("config");
        Self {
            ssh_file_config: ssh_config_path.to_string_lossy().to_string(),
            ssh_binary: "ssh".to_string(),
            command_timeout_secs: 10,
            control_persist_secs: 60,
            remote_root: "/".to_string(),
            remap_container_port: None,
            excluded_host_prefixes: vec!["git".to_string(), "github".to_string()],
            skip_compress: ["png", "jpg", "jpeg", "webp", "gif", "mp4", "mkv", "zip", "7z"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl AppConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

#[derive(Debug)]
pub struct ConfigManager {
    config_file: PathBuf,
    bookmarks_file: PathBuf,
}

impl ConfigManager {
    pub fn new() -> Result<Self> {
        let config_dir = dirs::config_dir()
            .context("Could not find config directory")?
            .join("sshdrop");
        Self::with_dir(&config_dir)
    }

    pub fn with_dir(config_dir: &Path) -> Result<Self> {
        // Create config directory if it doesn't exist
        if !config_dir.exists() {
            fs::create_dir_all(config_dir).context("Failed to create config directory")?;
        }

        Ok(Self {
            config_file: config_dir.join("sshdrop.toml"),
            bookmarks_file: config_dir.join("bookmarks.json"),
        })
    }

    pub fn load_config(&self) -> Result<AppConfig> {
        // If config file doesn't exist, create it with default values
        if !self.config_file.exists() {
            let default_config = AppConfig::default();
            self.save_config(&default_config)?;
        }

        let content: String =
            fs::read_to_string(&self.config_file).context("Failed to read config file")?;

        let mut config: AppConfig =
            toml::from_str(&content).context("Failed to parse config file")?;

        if config.remote_root.trim().is_empty() {
            config.remote_root = "/".to_string();
        }
        if config.command_timeout_secs == 0 {
            config.command_timeout_secs = AppConfig::default().command_timeout_secs;
        }

        Ok(config)
    }

    pub fn save_config(&self, config: &AppConfig) -> Result<()> {
        let toml = toml::to_string_pretty(config).context("Failed to serialize config")?;
        fs::write(&self.config_file, toml).context("Failed to write config file")?;
        Ok(())
    }

    pub fn get_config_path(&self) -> &Path {
        &self.config_file
    }

    pub fn get_bookmarks_path(&self) -> &Path {
        &self.bookmarks_file
    }
}
