//! Configuration loading for the archive service
//!
//! This module provides functionality for:
//! 1. Reading `config.toml` into typed sections
//! 2. Writing a default file on first start
//! 3. Environment overrides for the storage locations
//! 4. Fail-fast validation of required settings

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

/// Environment variable overriding `paths.database_file`
pub const ENV_DATABASE_FILE: &str = "ARCHIVE_DATABASE_FILE";
/// Environment variable overriding `paths.files_directory`
pub const ENV_FILES_DIRECTORY: &str = "ARCHIVE_FILES_DIRECTORY";

// Define error types for config loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("Missing required setting: {0}")]
    Missing(&'static str),

    #[error("Invalid setting {0}: {1}")]
    Invalid(&'static str, String),
}

// Result type alias for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Paths {
    pub database_file: String,
    pub files_directory: String,
    pub log_directory: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Server {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Crawl {
    pub tick_interval_secs: u64,
    pub item_delay_ms: u64,
    pub skip_streak_limit: u32,
    pub default_limit: u32,
    pub request_timeout_secs: u64,
    pub retry_attempts: usize,
    pub retry_backoff_ms: u64,
    pub user_agent: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Limits {
    /// Largest accepted media file in bytes, 0 for no cap
    pub file_size_cap: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Maintenance {
    pub interval_secs: u64,
    pub trash_retention_days: i64,
    pub delete_misplaced_files: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Logging {
    pub log_level: String,
    pub log_to_file: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub paths: Paths,
    pub server: Server,
    pub crawl: Crawl,
    pub limits: Limits,
    pub maintenance: Maintenance,
    pub logging: Logging,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            database_file: "./data/archive.sqlite".to_string(),
            files_directory: "./files".to_string(),
            log_directory: "./logs".to_string(),
        }
    }
}

impl Default for Server {
    fn default() -> Self {
        Self { host: "0.0.0.0".to_string(), port: 3000 }
    }
}

impl Default for Crawl {
    fn default() -> Self {
        Self {
            tick_interval_secs: 15 * 60,
            item_delay_ms: 1000,
            skip_streak_limit: 20,
            default_limit: 200,
            request_timeout_secs: 30,
            retry_attempts: 3,
            retry_backoff_ms: 1000,
            user_agent: format!("booru_archive/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self { file_size_cap: 104_857_600 }
    }
}

impl Default for Maintenance {
    fn default() -> Self {
        Self {
            interval_secs: 24 * 60 * 60,
            trash_retention_days: 7,
            delete_misplaced_files: false,
        }
    }
}

impl Default for Logging {
    fn default() -> Self {
        Self { log_level: "info".to_string(), log_to_file: true }
    }
}

impl Crawl {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn item_delay(&self) -> Duration {
        Duration::from_millis(self.item_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl AppConfig {
    /// Load the config file, creating it with defaults when it does not exist.
    ///
    /// A file that exists but does not parse is an error.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();

        if !path.exists() {
            warn!("Config file not found: {}, writing defaults", path.display());
            let config = AppConfig::default();
            config.save(path)?;
            return Ok(config);
        }

        let content = fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> ConfigResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Apply overrides from a variable lookup (normally the process environment)
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(db) = lookup(ENV_DATABASE_FILE) {
            self.paths.database_file = db;
        }
        if let Some(dir) = lookup(ENV_FILES_DIRECTORY) {
            self.paths.files_directory = dir;
        }
    }

    /// Reject configurations the service cannot start with
    pub fn validate(&self) -> ConfigResult<()> {
        if self.paths.database_file.trim().is_empty() {
            return Err(ConfigError::Missing("paths.database_file"));
        }
        if self.paths.files_directory.trim().is_empty() {
            return Err(ConfigError::Missing("paths.files_directory"));
        }
        if self.crawl.tick_interval_secs == 0 {
            return Err(ConfigError::Invalid("crawl.tick_interval_secs", "must be positive".into()));
        }
        if self.crawl.skip_streak_limit == 0 {
            return Err(ConfigError::Invalid("crawl.skip_streak_limit", "must be positive".into()));
        }
        if self.crawl.default_limit == 0 {
            return Err(ConfigError::Invalid("crawl.default_limit", "must be positive".into()));
        }
        if self.crawl.retry_attempts == 0 {
            return Err(ConfigError::Invalid("crawl.retry_attempts", "must be at least 1".into()));
        }
        if self.maintenance.trash_retention_days < 0 {
            return Err(ConfigError::Invalid(
                "maintenance.trash_retention_days",
                "must not be negative".into(),
            ));
        }
        Ok(())
    }

    pub fn files_directory(&self) -> PathBuf {
        PathBuf::from(&self.paths.files_directory)
    }
}

/// Load, override from the process environment and validate
pub fn init_config(path: impl AsRef<Path>) -> ConfigResult<AppConfig> {
    let mut config = AppConfig::load(path)?;
    config.apply_env_overrides(|key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}
