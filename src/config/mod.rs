//! Persisted backup settings shared by the archiver and the scheduler.

pub mod paths;

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{BackupError, Result};
use crate::utils::persistence::write_atomic;

pub use paths::{app_data_dir, AppPaths};

pub const DEFAULT_MAX_BACKUPS: usize = 10;
pub const DEFAULT_COMPRESSION_LEVEL: u8 = 6;
pub const MAX_COMPRESSION_LEVEL: u8 = 9;
pub const DEFAULT_BACKUP_DAY: &str = "saturday";
pub const DEFAULT_BACKUP_TIME: &str = "12:00";

/// Retention, packaging and schedule settings.
///
/// Keys missing on disk fall back to their defaults; keys this type does not
/// know about are kept in `extra` and written back untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub max_backups: usize,
    pub auto_backup_enabled: bool,
    pub backup_schedule: String,
    pub include_reports: bool,
    pub compression_level: u8,
    pub backup_day: String,
    pub backup_time: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            max_backups: DEFAULT_MAX_BACKUPS,
            auto_backup_enabled: true,
            backup_schedule: "weekly".into(),
            include_reports: true,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            backup_day: DEFAULT_BACKUP_DAY.into(),
            backup_time: DEFAULT_BACKUP_TIME.into(),
            extra: BTreeMap::new(),
        }
    }
}

impl BackupConfig {
    /// Number of snapshots retention keeps; never below one.
    pub fn retention_limit(&self) -> usize {
        self.max_backups.max(1)
    }

    /// Deflate level clamped to the 0–9 range.
    pub fn effective_compression_level(&self) -> i64 {
        i64::from(self.compression_level.min(MAX_COMPRESSION_LEVEL))
    }
}

/// JSON-file backed holder for [`BackupConfig`]. Every mutation is persisted
/// before it becomes visible to readers.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    current: RwLock<BackupConfig>,
}

impl ConfigStore {
    /// Loads the configuration at `path`, merged with the defaults.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let current = load_merged(&path);
        Self {
            path,
            current: RwLock::new(current),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy of the configuration as currently held in memory.
    pub fn snapshot(&self) -> BackupConfig {
        self.read().clone()
    }

    /// Re-reads the file from disk, replacing the in-memory copy.
    pub fn reload(&self) -> BackupConfig {
        let fresh = load_merged(&self.path);
        *self.write() = fresh.clone();
        fresh
    }

    /// Applies `change` to a copy, persists it, then publishes it.
    pub fn update<F>(&self, change: F) -> Result<BackupConfig>
    where
        F: FnOnce(&mut BackupConfig),
    {
        let mut guard = self.write();
        let mut next = guard.clone();
        change(&mut next);
        persist(&self.path, &next)?;
        *guard = next.clone();
        Ok(next)
    }

    pub fn save(&self) -> Result<()> {
        persist(&self.path, &self.read())
    }

    pub fn set_max_backups(&self, max_backups: usize) -> Result<BackupConfig> {
        if max_backups == 0 {
            return Err(BackupError::Validation(
                "max_backups must be at least 1".into(),
            ));
        }
        self.update(|config| config.max_backups = max_backups)
    }

    pub fn set_auto_backup_enabled(&self, enabled: bool) -> Result<BackupConfig> {
        self.update(|config| config.auto_backup_enabled = enabled)
    }

    pub fn set_include_reports(&self, include: bool) -> Result<BackupConfig> {
        self.update(|config| config.include_reports = include)
    }

    pub fn set_compression_level(&self, level: u8) -> Result<BackupConfig> {
        if level > MAX_COMPRESSION_LEVEL {
            return Err(BackupError::Validation(format!(
                "compression level {level} is outside 0-{MAX_COMPRESSION_LEVEL}"
            )));
        }
        self.update(|config| config.compression_level = level)
    }

    /// Stores the weekly schedule. Values are validated by the scheduler.
    pub fn set_schedule(&self, day: &str, time: &str) -> Result<BackupConfig> {
        let day = day.trim().to_lowercase();
        let time = time.trim().to_string();
        self.update(|config| {
            config.backup_day = day;
            config.backup_time = time;
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, BackupConfig> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BackupConfig> {
        self.current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn load_merged(path: &Path) -> BackupConfig {
    if !path.exists() {
        return BackupConfig::default();
    }
    let parsed = fs::read_to_string(path)
        .map_err(BackupError::from)
        .and_then(|data| serde_json::from_str::<BackupConfig>(&data).map_err(BackupError::from));
    match parsed {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "falling back to default backup config"
            );
            BackupConfig::default()
        }
    }
}

fn persist(path: &Path, config: &BackupConfig) -> Result<()> {
    let json = serde_json::to_string_pretty(config)?;
    write_atomic(path, json.as_bytes())?;
    Ok(())
}
