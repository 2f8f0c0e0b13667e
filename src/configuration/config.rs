use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::types::DatabaseConfig;
use crate::error_handling::types::ConfigError;

/// Runtime parameters for the persistence engine.
///
/// Loaded from a TOML file with `from_file`, or built in code; every field
/// has a default so a missing file is never fatal.
///
/// # Fields Overview
///
/// - `data_dir`: directory for snapshot files and CSV backups
/// - `auto_save`: enables the background timer and the count trigger
/// - `flush_interval_secs`: wall-clock seconds between timer flushes
/// - `flush_record_threshold`: new records between count-triggered flushes
/// - `snapshot_retention_days`: age limit applied by the purge command
/// - `database`: optional SQLite tier; absence means local-only persistence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: PathBuf,
    pub auto_save: bool,
    pub flush_interval_secs: u64,
    pub flush_record_threshold: usize,
    pub snapshot_retention_days: i64,
    pub database: Option<DatabaseConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("session_data"),
            auto_save: true,
            flush_interval_secs: 120,
            flush_record_threshold: 5,
            snapshot_retention_days: 7,
            database: None,
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Config, ConfigError> {
        let raw = fs::read_to_string(path)?;
        let config: Config =
            toml::from_str(&raw).map_err(|e| ConfigError::TomlError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.flush_interval_secs == 0 {
            return Err(ConfigError::BadInterval(
                "flush_interval_secs must be greater than zero".into(),
            ));
        }
        if self.snapshot_retention_days < 0 {
            return Err(ConfigError::BadInterval(
                "snapshot_retention_days must not be negative".into(),
            ));
        }
        if self.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::DirectoryUnusable("data_dir must not be empty".into()));
        }
        Ok(())
    }
}
