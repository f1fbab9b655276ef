use std::{collections::BTreeMap, path::PathBuf};

use chrono::{DateTime, Local, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::config::BackupConfig;

/// Entry holding the serialized [`SnapshotMetadata`].
pub const METADATA_ENTRY: &str = "backup_metadata.json";
/// Document version written into every metadata record.
pub const METADATA_VERSION: &str = "1.0";
pub const BACKUP_TYPE_FULL: &str = "full";
pub const DATABASE_PREFIX: &str = "database/";
pub const CONFIG_PREFIX: &str = "config/";
pub const ARCHIVE_EXTENSION: &str = "zip";

/// Self-description embedded in each snapshot archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub backup_date: String,
    #[serde(default = "default_backup_type")]
    pub backup_type: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub database_size: u64,
    /// Row count per table at capture time; informational only.
    #[serde(default)]
    pub total_records: BTreeMap<String, u64>,
    #[serde(default)]
    pub config: BackupConfig,
}

fn default_backup_type() -> String {
    BACKUP_TYPE_FULL.to_string()
}

impl SnapshotMetadata {
    pub fn capture(
        at: DateTime<Local>,
        database_size: u64,
        total_records: BTreeMap<String, u64>,
        config: BackupConfig,
    ) -> Self {
        Self {
            backup_date: at.to_rfc3339(),
            backup_type: default_backup_type(),
            version: METADATA_VERSION.to_string(),
            database_size,
            total_records,
            config,
        }
    }

    /// Parses `backup_date`, accepting RFC 3339 and offset-less ISO-8601 stamps.
    pub fn backup_date(&self) -> Option<NaiveDateTime> {
        DateTime::parse_from_rfc3339(&self.backup_date)
            .map(|stamp| stamp.naive_local())
            .or_else(|_| NaiveDateTime::parse_from_str(&self.backup_date, "%Y-%m-%dT%H:%M:%S%.f"))
            .ok()
    }

    pub fn record_total(&self) -> u64 {
        self.total_records.values().sum()
    }
}

/// A snapshot archive found in the backup directory.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub filename: String,
    pub path: PathBuf,
    /// Last write time of the archive file.
    pub created_at: DateTime<Local>,
    pub size_bytes: u64,
    /// `None` when the metadata entry is missing or unreadable.
    pub metadata: Option<SnapshotMetadata>,
}

/// Entry-level view of a single archive.
#[derive(Debug, Clone)]
pub struct SnapshotDetails {
    pub filename: String,
    pub size_bytes: u64,
    pub entries: Vec<String>,
    pub metadata: Option<SnapshotMetadata>,
}

impl SnapshotDetails {
    pub fn file_count(&self) -> usize {
        self.entries.len()
    }
}

/// Outcome of a successful restore.
#[derive(Debug, Clone)]
pub struct RestoreReport {
    pub safety_snapshot: PathBuf,
    pub backup_date: String,
    pub restored_entries: usize,
}
