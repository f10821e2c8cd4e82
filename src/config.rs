use log::info;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::sync::identity::ChatId;
use crate::sync::normalize::DEFAULT_TEMP_PREFIX;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncConfig {
    pub user_id: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_temp_id_prefix")]
    pub temp_id_prefix: String,
    #[serde(default = "default_true")]
    pub mark_read_on_open: bool,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_poll_interval_ms() -> u64 {
    3000
}

fn default_temp_id_prefix() -> String {
    DEFAULT_TEMP_PREFIX.to_string()
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl SyncConfig {
    pub fn new(user_id: impl Into<String>) -> Self {
        SyncConfig {
            user_id: user_id.into(),
            poll_interval_ms: default_poll_interval_ms(),
            temp_id_prefix: default_temp_id_prefix(),
            mark_read_on_open: true,
            log_level: default_log_level(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        // A zero interval would make tokio::time::interval panic
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// The configured user id in canonical form.
    pub fn user_chat_id(&self) -> Result<ChatId, ConfigError> {
        ChatId::parse(&self.user_id).ok_or_else(|| ConfigError::InvalidUserId(self.user_id.clone()))
    }

    pub fn log_level_filter(&self) -> log::LevelFilter {
        self.log_level.parse().unwrap_or(log::LevelFilter::Info)
    }
}

static CONFIG_PATH_OVERRIDE: OnceCell<PathBuf> = OnceCell::new();

/// Use `path` instead of the default config location for the rest of the process.
/// Returns false if an override was already set.
pub fn set_config_path_override(path: PathBuf) -> bool {
    CONFIG_PATH_OVERRIDE.set(path).is_ok()
}

pub fn get_config_dir() -> Result<PathBuf, ConfigError> {
    let dir = dirs::config_dir()
        .ok_or(ConfigError::NoConfigDir)?
        .join("chatsync");
    Ok(dir)
}

pub fn get_config_path() -> Result<PathBuf, ConfigError> {
    if let Some(path) = CONFIG_PATH_OVERRIDE.get() {
        return Ok(path.clone());
    }
    Ok(get_config_dir()?.join("config.json"))
}

pub fn load_config() -> Result<Option<SyncConfig>, ConfigError> {
    load_config_from(&get_config_path()?)
}

pub fn load_config_from(path: &Path) -> Result<Option<SyncConfig>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let file = File::open(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config: SyncConfig = serde_json::from_reader(file)?;
    info!("Loaded config for user {} from {}", config.user_id, path.display());
    Ok(Some(config))
}

pub fn save_config(config: &SyncConfig) -> Result<PathBuf, ConfigError> {
    let path = get_config_path()?;
    save_config_to(config, &path)?;
    Ok(path)
}

pub fn save_config_to(config: &SyncConfig, path: &Path) -> Result<(), ConfigError> {
    let io_err = |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
    }
    let file = File::create(path).map_err(io_err)?;
    serde_json::to_writer_pretty(file, config)?;
    info!("Config saved for user {} to {}", config.user_id, path.display());
    Ok(())
}
