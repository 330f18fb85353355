use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::fs::{create_private_dir_all, write_private_atomic};
use crate::keystore::DEFAULT_PUSH_KEY_FILENAME;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingConfig {
    pub storage: StorageSection,
    pub keys: KeysSection,
    #[serde(default)]
    pub pairing: PairingSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSection {
    /// Accounts root directory, or `":memory:"` for a transient store.
    pub root_dir: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeysSection {
    pub push_key_path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingSection {
    #[serde(default)]
    pub send_grace_period_ms: u64,
    /// Zero waits forever.
    #[serde(default)]
    pub subscription_timeout_ms: u64,
}

impl PairingSection {
    pub fn send_grace_period(&self) -> Duration {
        Duration::from_millis(self.send_grace_period_ms)
    }

    pub fn subscription_timeout(&self) -> Option<Duration> {
        match self.subscription_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingSection {
    pub filter: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

impl PairingConfig {
    pub fn new(root_dir: PathBuf, push_key_path: PathBuf) -> Self {
        Self {
            storage: StorageSection {
                root_dir: root_dir.to_string_lossy().to_string(),
            },
            keys: KeysSection {
                push_key_path: push_key_path.to_string_lossy().to_string(),
            },
            pairing: PairingSection::default(),
            logging: LoggingSection::default(),
        }
    }

    /// Configuration rooted at the XDG data directory.
    pub fn with_defaults() -> anyhow::Result<Self> {
        Ok(Self::new(default_root_dir()?, default_push_key_path()?))
    }
}

pub fn default_config_path() -> anyhow::Result<PathBuf> {
    Ok(xdg_config_dir()?.join("config.toml"))
}

pub fn default_root_dir() -> anyhow::Result<PathBuf> {
    Ok(xdg_data_dir()?.join("accounts"))
}

pub fn default_push_key_path() -> anyhow::Result<PathBuf> {
    Ok(xdg_data_dir()?.join(DEFAULT_PUSH_KEY_FILENAME))
}

pub fn read_config(path: &Path) -> anyhow::Result<PairingConfig> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read config {}: {}", path.display(), e))?;
    toml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("Failed to parse config {}: {}", path.display(), e))
}

pub fn write_config(path: &Path, config: &PairingConfig) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        create_private_dir_all(parent).map_err(|e| {
            anyhow::anyhow!(
                "Failed to create config directory {}: {}",
                parent.display(),
                e
            )
        })?;
    }
    let contents =
        toml::to_string_pretty(config).map_err(|e| anyhow::anyhow!("TOML error: {}", e))?;
    write_private_atomic(path, contents.as_bytes())
        .map_err(|e| anyhow::anyhow!("Failed to write config {}: {}", path.display(), e))?;
    Ok(())
}

pub fn xdg_config_dir() -> anyhow::Result<PathBuf> {
    if let Ok(value) = std::env::var("XDG_CONFIG_HOME") {
        if !value.trim().is_empty() {
            return Ok(PathBuf::from(value).join("pairing"));
        }
    }
    Ok(home_dir()?.join(".config").join("pairing"))
}

pub fn xdg_data_dir() -> anyhow::Result<PathBuf> {
    if let Ok(value) = std::env::var("XDG_DATA_HOME") {
        if !value.trim().is_empty() {
            return Ok(PathBuf::from(value).join("pairing"));
        }
    }
    Ok(home_dir()?.join(".local").join("share").join("pairing"))
}

fn home_dir() -> anyhow::Result<PathBuf> {
    let home = std::env::var("HOME")
        .map_err(|_| anyhow::anyhow!("HOME is not set; cannot resolve default paths"))?;
    Ok(PathBuf::from(home))
}
