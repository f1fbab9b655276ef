//! Backup Archiver: builds, lists, verifies and restores ZIP snapshots of the
//! application's durable state, and keeps the backup directory within the
//! configured retention limit.

pub mod census;
pub mod metadata;
mod restore;

use std::{
    collections::{BTreeMap, HashSet},
    fs::{self, File},
    io::{self, Read, Seek, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, TryLockError},
};

use chrono::{DateTime, Local};
use serde_json::json;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;
use zip::{result::ZipError, write::SimpleFileOptions, CompressionMethod, ZipArchive, ZipWriter};

use crate::clock::{Clock, SystemClock};
use crate::config::{AppPaths, BackupConfig, ConfigStore};
use crate::errors::{BackupError, Result};
use crate::utils::persistence::{to_entry_name, write_atomic};

pub use census::{NoCensus, RecordCensus};
pub use metadata::{
    RestoreReport, Snapshot, SnapshotDetails, SnapshotMetadata, ARCHIVE_EXTENSION, CONFIG_PREFIX,
    DATABASE_PREFIX, METADATA_ENTRY, METADATA_VERSION,
};

use restore::{DatabaseSidecar, RestorePlan};

/// Format of the timestamp appended to generated snapshot names.
pub const SNAPSHOT_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
pub const SAFETY_SNAPSHOT_NAME: &str = "pre_restore_safety";
const DEFAULT_PREFIX: &str = "backup";
const REPORT_PREFIX: &str = "backup_report";

/// Builds `<prefix>_<YYYYMMDD_HHMMSS>`.
pub fn snapshot_name(prefix: &str, at: DateTime<Local>) -> String {
    format!("{}_{}", prefix, at.format(SNAPSHOT_TIMESTAMP_FORMAT))
}

/// Produces and consumes snapshot archives for one application data layout.
///
/// `create_snapshot` and `restore_snapshot` are mutually exclusive; a request
/// arriving while another one runs fails with [`BackupError::Busy`].
pub struct Archiver {
    paths: AppPaths,
    config: Arc<ConfigStore>,
    census: Box<dyn RecordCensus>,
    clock: Arc<dyn Clock>,
    operation: Mutex<()>,
}

impl Archiver {
    pub fn new(paths: AppPaths, config: Arc<ConfigStore>) -> Result<Self> {
        fs::create_dir_all(&paths.backups_dir)?;
        Ok(Self {
            paths,
            config,
            census: Box::new(NoCensus),
            clock: Arc::new(SystemClock),
            operation: Mutex::new(()),
        })
    }

    /// Opens the configuration store at the layout's `backup_config.json`.
    pub fn open(paths: AppPaths) -> Result<Self> {
        let store = Arc::new(ConfigStore::open(&paths.backup_config_file));
        Self::new(paths, store)
    }

    pub fn with_census(mut self, census: impl RecordCensus + 'static) -> Self {
        self.census = Box::new(census);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn paths(&self) -> &AppPaths {
        &self.paths
    }

    pub fn backup_dir(&self) -> &Path {
        &self.paths.backups_dir
    }

    pub fn config_store(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    pub fn config(&self) -> BackupConfig {
        self.config.snapshot()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Name of the database entry inside every archive.
    pub fn database_entry(&self) -> String {
        format!("{}{}", DATABASE_PREFIX, self.paths.database_file_name())
    }

    /// Writes `<backup_dir>/<name>.zip` and applies retention afterwards.
    ///
    /// Without a name, `backup_<YYYYMMDD_HHMMSS>` is used. A failed build
    /// never leaves the partial archive behind.
    pub fn create_snapshot(&self, name: Option<&str>) -> Result<PathBuf> {
        let _guard = self.acquire()?;
        self.create_snapshot_locked(name, None)
    }

    /// Replaces the live database, configuration, reports and assets with the
    /// contents of `archive_path`.
    ///
    /// A `pre_restore_safety` snapshot is taken first. The archive is then
    /// validated before any live file changes; if applying it fails, the
    /// previous database is put back before the error is returned. Retention
    /// runs once the restore has finished either way.
    pub fn restore_snapshot(&self, archive_path: &Path) -> Result<RestoreReport> {
        if !archive_path.is_file() {
            return Err(BackupError::NotFound(archive_path.to_path_buf()));
        }
        let _guard = self.acquire()?;
        let outcome = self.restore_locked(archive_path);
        self.prune_with(&self.config.snapshot(), None);
        outcome
    }

    fn restore_locked(&self, archive_path: &Path) -> Result<RestoreReport> {
        info!(path = %archive_path.display(), "restoring snapshot");

        let safety_name = self.safety_snapshot_name(archive_path);
        let safety_snapshot = self.create_snapshot_locked(Some(&safety_name), Some(archive_path))?;

        let mut archive = open_archive(archive_path).map_err(|err| {
            BackupError::Validation(format!(
                "{} is not a readable backup archive: {err}",
                archive_path.display()
            ))
        })?;
        let metadata = read_metadata_from(&mut archive)
            .map_err(|err| BackupError::Validation(format!("unreadable {METADATA_ENTRY}: {err}")))?
            .ok_or_else(|| BackupError::Validation(format!("missing {METADATA_ENTRY}")))?;
        info!(backup_date = %metadata.backup_date, "archive validated");

        let config = self.config.snapshot();
        let plan = RestorePlan::build(&archive, &self.paths, config.include_reports)?;

        fs::create_dir_all(&self.paths.root)?;
        let staging = tempfile::Builder::new()
            .prefix(".restore-")
            .tempdir_in(&self.paths.root)?;
        let sidecar = DatabaseSidecar::stash(&self.paths.database)?;

        let restored_entries = match plan.apply(&mut archive, staging.path()) {
            Ok(count) => {
                sidecar.discard();
                count
            }
            Err(err) => {
                error!(
                    operation = "restore_snapshot",
                    status = "failed",
                    error = %err,
                    "restore failed, rolling back database"
                );
                sidecar.roll_back();
                return Err(err);
            }
        };
        if let Err(err) = staging.close() {
            warn!(error = %err, "failed to remove restore staging directory");
        }

        self.config.reload();
        info!(
            operation = "restore_snapshot",
            status = "success",
            entries = restored_entries,
            "restore completed"
        );
        Ok(RestoreReport {
            safety_snapshot,
            backup_date: metadata.backup_date,
            restored_entries,
        })
    }

    /// Checks entry integrity and the presence of the database and metadata
    /// entries. Problems are reported in the message, never as an error.
    pub fn verify(&self, archive_path: &Path) -> (bool, String) {
        match self.inspect(archive_path) {
            Ok(outcome) => outcome,
            Err(err) => (false, format!("unable to verify archive: {err}")),
        }
    }

    /// Archives in the backup directory, most recent first.
    pub fn list_snapshots(&self) -> Result<Vec<Snapshot>> {
        let dir = &self.paths.backups_dir;
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut snapshots = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file()
                || path.extension().and_then(|ext| ext.to_str()) != Some(ARCHIVE_EXTENSION)
            {
                continue;
            }
            let filename = match path.file_name().and_then(|name| name.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };
            let stat = match entry.metadata() {
                Ok(stat) => stat,
                Err(err) => {
                    warn!(file = %filename, error = %err, "skipping unreadable snapshot");
                    continue;
                }
            };
            let created_at = stat
                .modified()
                .or_else(|_| stat.created())
                .map(DateTime::<Local>::from)
                .unwrap_or_else(|_| self.clock.now());
            let metadata = match read_metadata(&path) {
                Ok(metadata) => metadata,
                Err(err) => {
                    debug!(file = %filename, error = %err, "snapshot metadata unavailable");
                    None
                }
            };
            snapshots.push(Snapshot {
                filename,
                path,
                created_at,
                size_bytes: stat.len(),
                metadata,
            });
        }
        snapshots.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.filename.cmp(&a.filename))
        });
        Ok(snapshots)
    }

    /// Removes one archive by file name; `false` when it did not exist.
    pub fn delete_snapshot(&self, filename: &str) -> Result<bool> {
        let path = self.snapshot_path(filename)?;
        if !path.is_file() {
            return Ok(false);
        }
        fs::remove_file(&path)?;
        info!(file = filename, "snapshot deleted");
        Ok(true)
    }

    /// Entry listing and metadata for one archive; `None` when it does not exist.
    pub fn snapshot_details(&self, filename: &str) -> Result<Option<SnapshotDetails>> {
        let path = self.snapshot_path(filename)?;
        if !path.is_file() {
            return Ok(None);
        }
        let size_bytes = fs::metadata(&path)?.len();
        let mut archive = open_archive(&path)?;
        let entries = archive.file_names().map(str::to_string).collect();
        let metadata = read_metadata_from(&mut archive).unwrap_or_else(|err| {
            debug!(file = filename, error = %err, "snapshot metadata unavailable");
            None
        });
        Ok(Some(SnapshotDetails {
            filename: filename.to_string(),
            size_bytes,
            entries,
            metadata,
        }))
    }

    /// Writes a JSON summary of every snapshot, by default to
    /// `<data root>/backup_report_<YYYYMMDD_HHMMSS>.json`.
    pub fn export_report(&self, output: Option<&Path>) -> Result<PathBuf> {
        let now = self.clock.now();
        let output = match output {
            Some(path) => path.to_path_buf(),
            None => self
                .paths
                .root
                .join(format!("{}.json", snapshot_name(REPORT_PREFIX, now))),
        };
        let snapshots = self.list_snapshots()?;
        let backups: Vec<_> = snapshots
            .iter()
            .map(|snapshot| {
                Ok(json!({
                    "filename": snapshot.filename,
                    "size_bytes": snapshot.size_bytes,
                    "size_mb": size_in_mb(snapshot.size_bytes),
                    "created": snapshot.created_at.to_rfc3339(),
                    "metadata": snapshot
                        .metadata
                        .as_ref()
                        .map(serde_json::to_value)
                        .transpose()?
                        .unwrap_or_else(|| json!({})),
                }))
            })
            .collect::<std::result::Result<_, serde_json::Error>>()?;
        let report = json!({
            "generated_date": now.to_rfc3339(),
            "backup_directory": self.paths.backups_dir.display().to_string(),
            "total_backups": snapshots.len(),
            "config": self.config.snapshot(),
            "backups": backups,
        });
        write_atomic(&output, serde_json::to_string_pretty(&report)?.as_bytes())?;
        info!(path = %output.display(), backups = snapshots.len(), "backup report exported");
        Ok(output)
    }

    /// Deletes the oldest archives beyond the retention limit. Failures are
    /// logged per file and do not stop the remaining deletions.
    pub fn prune(&self) -> usize {
        self.prune_with(&self.config.snapshot(), None)
    }

    fn acquire(&self) -> Result<MutexGuard<'_, ()>> {
        match self.operation.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => Err(BackupError::Busy),
        }
    }

    fn create_snapshot_locked(
        &self,
        name: Option<&str>,
        protect: Option<&Path>,
    ) -> Result<PathBuf> {
        let name = match name {
            Some(name) => validate_snapshot_name(name)?,
            None => snapshot_name(DEFAULT_PREFIX, self.clock.now()),
        };
        let config = self.config.snapshot();
        fs::create_dir_all(&self.paths.backups_dir)?;
        let path = self
            .paths
            .backups_dir
            .join(format!("{}.{}", name, ARCHIVE_EXTENSION));

        match self.write_archive(&path, &config) {
            Ok(entries) => {
                info!(
                    operation = "create_snapshot",
                    status = "success",
                    path = %path.display(),
                    entries,
                    "snapshot created"
                );
                self.prune_with(&config, protect);
                Ok(std::path::absolute(&path).unwrap_or(path))
            }
            Err(err) => {
                if path.exists() {
                    if let Err(remove_err) = fs::remove_file(&path) {
                        warn!(
                            path = %path.display(),
                            error = %remove_err,
                            "failed to remove partial archive"
                        );
                    }
                }
                error!(
                    operation = "create_snapshot",
                    status = "failed",
                    path = %path.display(),
                    error = %err,
                    "snapshot creation failed"
                );
                Err(err)
            }
        }
    }

    fn write_archive(&self, target: &Path, config: &BackupConfig) -> Result<usize> {
        let file = File::create(target)?;
        let mut zip = ZipWriter::new(file);
        let options = file_options(config);
        let mut entries = 0;

        if self.paths.database.exists() {
            add_file(&mut zip, &self.paths.database, &self.database_entry(), options)?;
            entries += 1;
        }

        for config_file in self.paths.config_files() {
            if !config_file.exists() {
                continue;
            }
            if let Some(name) = config_file.file_name().and_then(|name| name.to_str()) {
                add_file(&mut zip, &config_file, &format!("{CONFIG_PREFIX}{name}"), options)?;
                entries += 1;
            }
        }

        if config.include_reports {
            for dir in self.paths.report_paths() {
                entries += add_tree(&mut zip, &self.paths.root, &dir, options)?;
            }
        }

        for dir in self.paths.asset_paths() {
            entries += add_tree(&mut zip, &self.paths.root, &dir, options)?;
        }

        let metadata = self.capture_metadata(config);
        zip.start_file(METADATA_ENTRY, options)?;
        zip.write_all(serde_json::to_string_pretty(&metadata)?.as_bytes())?;
        entries += 1;

        zip.finish()?;
        Ok(entries)
    }

    fn capture_metadata(&self, config: &BackupConfig) -> SnapshotMetadata {
        let database = &self.paths.database;
        let database_size = fs::metadata(database).map(|meta| meta.len()).unwrap_or(0);
        let total_records = if database.is_file() {
            self.census.count_records(database).unwrap_or_else(|err| {
                warn!(error = %err, "record census failed");
                BTreeMap::new()
            })
        } else {
            BTreeMap::new()
        };
        SnapshotMetadata::capture(self.clock.now(), database_size, total_records, config.clone())
    }

    fn prune_with(&self, config: &BackupConfig, protect: Option<&Path>) -> usize {
        let snapshots = match self.list_snapshots() {
            Ok(snapshots) => snapshots,
            Err(err) => {
                warn!(error = %err, "unable to list snapshots for retention");
                return 0;
            }
        };
        remove_beyond(snapshots, config.retention_limit(), protect)
    }

    fn inspect(&self, archive_path: &Path) -> Result<(bool, String)> {
        let mut archive = open_archive(archive_path)?;
        let mut corrupt = Vec::new();
        for index in 0..archive.len() {
            match archive.by_index(index) {
                Ok(mut entry) => {
                    if io::copy(&mut entry, &mut io::sink()).is_err() {
                        corrupt.push(entry.name().to_string());
                    }
                }
                Err(_) => corrupt.push(format!("#{index}")),
            }
        }
        if !corrupt.is_empty() {
            return Ok((false, format!("corrupt entries: {corrupt:?}")));
        }

        let names: HashSet<&str> = archive.file_names().collect();
        let missing: Vec<String> = [self.database_entry(), METADATA_ENTRY.to_string()]
            .into_iter()
            .filter(|required| !names.contains(required.as_str()))
            .collect();
        if !missing.is_empty() {
            return Ok((false, format!("missing entries: {missing:?}")));
        }
        Ok((true, "archive is intact".to_string()))
    }

    fn snapshot_path(&self, filename: &str) -> Result<PathBuf> {
        if filename.is_empty()
            || filename.contains(['/', '\\'])
            || filename == "."
            || filename == ".."
        {
            return Err(BackupError::Validation(format!(
                "`{filename}` is not a snapshot file name"
            )));
        }
        Ok(self.paths.backups_dir.join(filename))
    }

    fn safety_snapshot_name(&self, archive_path: &Path) -> String {
        let default = self
            .paths
            .backups_dir
            .join(format!("{SAFETY_SNAPSHOT_NAME}.{ARCHIVE_EXTENSION}"));
        if same_file(archive_path, &default) {
            snapshot_name(SAFETY_SNAPSHOT_NAME, self.clock.now())
        } else {
            SAFETY_SNAPSHOT_NAME.to_string()
        }
    }
}

/// Deletes every snapshot after the first `limit` of a newest-first listing.
/// A failed deletion is logged and the rest still go.
fn remove_beyond(snapshots: Vec<Snapshot>, limit: usize, protect: Option<&Path>) -> usize {
    let mut removed = 0;
    for snapshot in snapshots.into_iter().skip(limit) {
        if protect.is_some_and(|kept| same_file(kept, &snapshot.path)) {
            debug!(file = %snapshot.filename, "keeping archive being restored");
            continue;
        }
        match fs::remove_file(&snapshot.path) {
            Ok(()) => {
                removed += 1;
                info!(file = %snapshot.filename, "old snapshot pruned");
            }
            Err(err) => {
                warn!(file = %snapshot.filename, error = %err, "failed to prune snapshot");
            }
        }
    }
    removed
}

fn validate_snapshot_name(name: &str) -> Result<String> {
    let trimmed = name.trim();
    let trimmed = trimmed
        .strip_suffix(&format!(".{ARCHIVE_EXTENSION}"))
        .unwrap_or(trimmed);
    if trimmed.is_empty() || trimmed.contains(['/', '\\']) || trimmed == "." || trimmed == ".." {
        return Err(BackupError::Validation(format!(
            "`{name}` is not a valid snapshot name"
        )));
    }
    Ok(trimmed.to_string())
}

fn file_options(config: &BackupConfig) -> SimpleFileOptions {
    let level = config.effective_compression_level();
    if level == 0 {
        SimpleFileOptions::default().compression_method(CompressionMethod::Stored)
    } else {
        SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .compression_level(Some(level))
    }
}

fn add_file<W: Write + Seek>(
    zip: &mut ZipWriter<W>,
    source: &Path,
    entry: &str,
    options: SimpleFileOptions,
) -> Result<()> {
    let mut reader = File::open(source)?;
    zip.start_file(entry, options)?;
    io::copy(&mut reader, zip)?;
    Ok(())
}

fn add_tree<W: Write + Seek>(
    zip: &mut ZipWriter<W>,
    root: &Path,
    dir: &Path,
    options: SimpleFileOptions,
) -> Result<usize> {
    if !dir.is_dir() {
        return Ok(0);
    }
    let mut count = 0;
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(root).map_err(|_| {
            BackupError::Validation(format!(
                "{} is outside the data directory",
                entry.path().display()
            ))
        })?;
        add_file(zip, entry.path(), &to_entry_name(relative), options)?;
        count += 1;
    }
    Ok(count)
}

fn open_archive(path: &Path) -> Result<ZipArchive<File>> {
    let file = File::open(path)?;
    Ok(ZipArchive::new(file)?)
}

fn read_metadata(path: &Path) -> Result<Option<SnapshotMetadata>> {
    let mut archive = open_archive(path)?;
    read_metadata_from(&mut archive)
}

fn read_metadata_from<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
) -> Result<Option<SnapshotMetadata>> {
    let mut entry = match archive.by_name(METADATA_ENTRY) {
        Ok(entry) => entry,
        Err(ZipError::FileNotFound) => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let mut json = String::new();
    entry.read_to_string(&mut json)?;
    Ok(Some(serde_json::from_str(&json)?))
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

fn size_in_mb(bytes: u64) -> f64 {
    (bytes as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0
}
