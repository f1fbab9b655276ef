use std::{
    fs::{self, File},
    io::{self, Read, Seek},
    path::{Component, Path, PathBuf},
};

use tracing::{debug, error, warn};
use zip::ZipArchive;

use super::metadata::{CONFIG_PREFIX, DATABASE_PREFIX};
use crate::config::AppPaths;
use crate::errors::{BackupError, Result};
use crate::utils::persistence::{move_file, with_suffix};

const SIDECAR_SUFFIX: &str = "backup";

/// One archive entry and where it lands on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RestoreEntry {
    pub name: String,
    pub target: PathBuf,
}

/// Every entry a restore will write, resolved and validated up front so a bad
/// archive is rejected before any live file changes.
#[derive(Debug, Default)]
pub(crate) struct RestorePlan {
    pub database: Option<RestoreEntry>,
    pub files: Vec<RestoreEntry>,
}

impl RestorePlan {
    pub fn build<R: Read + Seek>(
        archive: &ZipArchive<R>,
        paths: &AppPaths,
        include_reports: bool,
    ) -> Result<Self> {
        let database_entry = format!("{}{}", DATABASE_PREFIX, paths.database_file_name());
        let mut plan = RestorePlan::default();

        for name in archive.file_names() {
            if name.ends_with('/') {
                continue;
            }
            if name == database_entry {
                plan.database = Some(RestoreEntry {
                    name: name.to_string(),
                    target: paths.database.clone(),
                });
            } else if let Some(file_name) = name.strip_prefix(CONFIG_PREFIX) {
                let relative = safe_relative(file_name)?;
                let target = paths
                    .config_files()
                    .into_iter()
                    .find(|known| known.file_name() == Some(relative.as_os_str()))
                    .unwrap_or_else(|| paths.root.join(&relative));
                plan.files.push(RestoreEntry {
                    name: name.to_string(),
                    target,
                });
            } else if under_any(name, &paths.asset_dirs)
                || (include_reports && under_any(name, &paths.report_dirs))
            {
                let relative = safe_relative(name)?;
                plan.files.push(RestoreEntry {
                    name: name.to_string(),
                    target: paths.root.join(relative),
                });
            } else {
                debug!(entry = name, "entry not restored");
            }
        }
        Ok(plan)
    }

    /// Extracts each entry into `staging`, then moves it over its target.
    /// The database goes first.
    pub fn apply<R: Read + Seek>(
        &self,
        archive: &mut ZipArchive<R>,
        staging: &Path,
    ) -> Result<usize> {
        let mut restored = 0;
        for (index, entry) in self.database.iter().chain(self.files.iter()).enumerate() {
            let staged = staging.join(index.to_string());
            {
                let mut source = archive.by_name(&entry.name)?;
                let mut out = File::create(&staged)?;
                io::copy(&mut source, &mut out)?;
                out.sync_all()?;
            }
            move_file(&staged, &entry.target)?;
            restored += 1;
        }
        Ok(restored)
    }
}

/// Copy of the live database taken before it is overwritten.
pub(crate) struct DatabaseSidecar {
    live: PathBuf,
    copy: Option<PathBuf>,
}

impl DatabaseSidecar {
    /// Copies `live` to `<live>.backup` when it exists.
    pub fn stash(live: &Path) -> Result<Self> {
        let copy = if live.is_file() {
            let sidecar = with_suffix(live, SIDECAR_SUFFIX);
            fs::copy(live, &sidecar)?;
            Some(sidecar)
        } else {
            None
        };
        Ok(Self {
            live: live.to_path_buf(),
            copy,
        })
    }

    /// Drops the copy once the new database is in place.
    pub fn discard(self) {
        if let Some(copy) = &self.copy {
            if let Err(err) = fs::remove_file(copy) {
                warn!(path = %copy.display(), error = %err, "failed to remove database sidecar");
            }
        }
    }

    /// Puts the previous database back. When there was none, whatever a
    /// partial restore placed is removed.
    pub fn roll_back(self) {
        match &self.copy {
            Some(copy) => match move_file(copy, &self.live) {
                Ok(()) => warn!(path = %self.live.display(), "previous database restored"),
                Err(err) => error!(
                    sidecar = %copy.display(),
                    error = %err,
                    "could not roll back database; sidecar copy kept"
                ),
            },
            None => {
                if self.live.exists() {
                    if let Err(err) = fs::remove_file(&self.live) {
                        error!(
                            path = %self.live.display(),
                            error = %err,
                            "could not remove partially restored database"
                        );
                    }
                }
            }
        }
    }
}

fn under_any(name: &str, dirs: &[String]) -> bool {
    dirs.iter().any(|dir| {
        name.strip_prefix(dir.as_str())
            .is_some_and(|rest| rest.starts_with('/'))
    })
}

/// Rejects entry names that would land outside the data directory.
fn safe_relative(name: &str) -> Result<PathBuf> {
    let path = Path::new(name);
    let escapes = name.is_empty()
        || name.contains('\\')
        || path
            .components()
            .any(|component| !matches!(component, Component::Normal(_)));
    if escapes {
        return Err(BackupError::Validation(format!(
            "entry `{name}` escapes the data directory"
        )));
    }
    Ok(path.to_path_buf())
}
