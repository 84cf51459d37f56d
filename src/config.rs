//! Configuration management
//!
//! This module loads and saves the TOML settings file: appliance connection,
//! HTTP timeouts, synchronizer timing and logging. The last selected profile
//! is written back to the same file.

use crate::appliance::DEFAULT_FORM_PATH;
use crate::sync::{ConnectionSettings, DEFAULT_RESTART_GRACE};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct Config {
    /// Appliance connection and last selected profile
    #[serde(default)]
    pub appliance: ApplianceConfig,

    /// HTTP client settings
    #[serde(default)]
    pub http: HttpConfig,

    /// Synchronizer timing
    #[serde(default)]
    pub sync: SyncConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ApplianceConfig {
    #[serde(default)]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    /// Last selected profile identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,

    /// Path of the profile form page
    #[serde(default = "default_form_path")]
    pub form_path: String,

    #[serde(default)]
    pub use_https: bool,
}

impl Default for ApplianceConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
            username: String::new(),
            password: String::new(),
            profile: None,
            form_path: default_form_path(),
            use_https: false,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct HttpConfig {
    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct SyncConfig {
    /// How long connectivity errors are ignored after a profile load (ms)
    #[serde(default = "default_restart_grace_ms")]
    pub restart_grace_ms: u64,

    /// Status poll interval in seconds for watch mode
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            restart_grace_ms: default_restart_grace_ms(),
            poll_interval: default_poll_interval(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// Default value functions
fn default_port() -> u16 {
    80
}

fn default_form_path() -> String {
    DEFAULT_FORM_PATH.to_string()
}

fn default_timeout() -> u64 {
    10
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_restart_grace_ms() -> u64 {
    DEFAULT_RESTART_GRACE.as_millis() as u64
}

fn default_poll_interval() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Candidate locations, most specific first
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("enginectl.toml")];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("enginectl/config.toml"));
        }
        paths
    }

    /// Resolve the file to use: an explicit path, else the first existing
    /// candidate, else the user config location.
    pub fn locate(explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }

        let candidates = Self::search_paths();
        candidates
            .iter()
            .find(|p| p.exists())
            .or_else(|| candidates.last())
            .cloned()
            .unwrap_or_else(|| PathBuf::from("enginectl.toml"))
    }

    /// Load configuration from file, or use defaults if it does not exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        tracing::debug!("Loading config from: {}", path.display());
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;

        tracing::debug!("Saved config to: {}", path.display());
        Ok(())
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        let a = &self.appliance;
        ConnectionSettings {
            host: a.host.clone(),
            port: a.port,
            username: a.username.clone(),
            password: a.password.clone(),
            use_https: a.use_https,
            form_path: a.form_path.clone(),
            profile: a.profile.clone(),
        }
    }

    pub fn restart_grace(&self) -> Duration {
        Duration::from_millis(self.sync.restart_grace_ms)
    }
}
