use crate::error::{LivecapError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable that overrides the manifest URL (development builds)
pub const MANIFEST_URL_ENV: &str = "LIVECAP_MANIFEST_URL";

/// Main configuration structure
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct Config {
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub updates: UpdatesConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct ModelsConfig {
    #[serde(default = "default_manifest_url")]
    pub manifest_url: String,
    pub dev_manifest_url: Option<String>,
    pub install_dir: Option<PathBuf>,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct UpdatesConfig {
    #[serde(default = "default_true")]
    pub auto_check: bool,
    #[serde(default = "default_release_url")]
    pub release_url: String,
    #[serde(default = "default_current_version")]
    pub current_version: String,
}

// Default value functions
fn default_manifest_url() -> String {
    "https://models.livecap.app/manifest.json".to_string()
}
fn default_fetch_timeout_secs() -> u64 {
    30
}
fn default_download_timeout_secs() -> u64 {
    600
}
fn default_true() -> bool {
    true
}
fn default_release_url() -> String {
    "https://api.github.com/repos/livecap/livecap/releases/latest".to_string()
}
fn default_current_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            manifest_url: default_manifest_url(),
            dev_manifest_url: None,
            install_dir: None,
            fetch_timeout_secs: default_fetch_timeout_secs(),
            download_timeout_secs: default_download_timeout_secs(),
        }
    }
}

impl Default for UpdatesConfig {
    fn default() -> Self {
        Self {
            auto_check: default_true(),
            release_url: default_release_url(),
            current_version: default_current_version(),
        }
    }
}

impl Config {
    /// Load config from the default location, falling back to defaults
    pub fn load() -> Result<Self> {
        Self::load_from(&config_path()?)
    }

    /// Load config from an explicit path
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| {
            LivecapError::Config(format!("Failed to parse {}: {e}", path.display()))
        })
    }
}

impl ModelsConfig {
    /// Manifest URL to use: env override, then dev override, then production
    #[must_use]
    pub fn effective_manifest_url(&self) -> String {
        if let Ok(url) = std::env::var(MANIFEST_URL_ENV) {
            if !url.trim().is_empty() {
                return url;
            }
        }
        self.dev_manifest_url
            .clone()
            .filter(|u| !u.trim().is_empty())
            .unwrap_or_else(|| self.manifest_url.clone())
    }

    #[must_use]
    pub const fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    #[must_use]
    pub const fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    /// Resolve the model install directory
    pub fn resolve_install_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.install_dir {
            return Ok(dir.clone());
        }
        models_data_dir()
    }
}

/// Get config file path
pub fn config_path() -> Result<PathBuf> {
    let config_dir = if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg_config)
    } else {
        let home = std::env::var("HOME")
            .map_err(|_| LivecapError::Config("HOME env var not set".to_string()))?;
        PathBuf::from(home).join(".config")
    };

    Ok(config_dir.join("livecap").join("config.toml"))
}

/// Get models data directory
pub fn models_data_dir() -> Result<PathBuf> {
    let data_dir = if let Ok(xdg_data) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(xdg_data)
    } else {
        dirs::data_dir().ok_or_else(|| {
            LivecapError::Config("Could not determine user data directory".to_string())
        })?
    };

    Ok(data_dir.join("livecap").join("models"))
}
