use std::{
    env, fs,
    path::{Path, PathBuf},
};

const APP_DIR_NAME: &str = "CriptasParroquia";
const HOME_ENV: &str = "CRIPTAS_HOME";
const BACKUPS_DIR: &str = "backups";
const DATABASE_DIR: &str = "database";
const DATABASE_FILE: &str = "criptas.db";
const BACKUP_CONFIG_FILE: &str = "backup_config.json";
const APP_CONFIG_FILE: &str = "app_config.json";
const LOGS_DIR: &str = "logs";
const REPORT_DIRS: [&str; 3] = ["recibos", "titulos", "reportes"];
const ASSET_DIRS: [&str; 3] = ["assets", "images", "fonts"];

/// Returns the per-user application data directory.
///
/// `CRIPTAS_HOME` wins when set; otherwise the platform local data directory
/// (`%LOCALAPPDATA%`, `~/Library/Application Support`, `~/.local/share`) is used.
pub fn app_data_dir() -> PathBuf {
    if let Some(custom) = env::var_os(HOME_ENV) {
        return PathBuf::from(custom);
    }
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
}

/// Filesystem layout consumed by the archiver.
///
/// Report and asset directories are stored as names relative to `root`; their
/// archive entries keep that relative path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    pub root: PathBuf,
    pub backups_dir: PathBuf,
    pub database: PathBuf,
    pub backup_config_file: PathBuf,
    pub app_config_file: PathBuf,
    pub logs_dir: PathBuf,
    pub report_dirs: Vec<String>,
    pub asset_dirs: Vec<String>,
}

impl AppPaths {
    /// Layout rooted at the resolved application data directory.
    pub fn resolve() -> Self {
        Self::at(app_data_dir())
    }

    /// Layout rooted at an arbitrary directory.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            backups_dir: root.join(BACKUPS_DIR),
            database: root.join(DATABASE_DIR).join(DATABASE_FILE),
            backup_config_file: root.join(BACKUP_CONFIG_FILE),
            app_config_file: root.join(APP_CONFIG_FILE),
            logs_dir: root.join(LOGS_DIR),
            report_dirs: REPORT_DIRS.iter().map(|dir| dir.to_string()).collect(),
            asset_dirs: ASSET_DIRS.iter().map(|dir| dir.to_string()).collect(),
            root,
        }
    }

    /// Configuration files captured under `config/` in every snapshot.
    pub fn config_files(&self) -> Vec<PathBuf> {
        vec![self.backup_config_file.clone(), self.app_config_file.clone()]
    }

    /// Name of the live database file, used for the `database/<name>` entry.
    pub fn database_file_name(&self) -> String {
        self.database
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| DATABASE_FILE.to_string())
    }

    pub fn report_paths(&self) -> Vec<PathBuf> {
        self.report_dirs.iter().map(|dir| self.root.join(dir)).collect()
    }

    pub fn asset_paths(&self) -> Vec<PathBuf> {
        self.asset_dirs.iter().map(|dir| self.root.join(dir)).collect()
    }

    /// Creates every managed directory. Asset directories are left alone; they
    /// ship with the installation and may legitimately be absent.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        ensure_dir(&self.root)?;
        ensure_dir(&self.backups_dir)?;
        ensure_dir(&self.logs_dir)?;
        if let Some(parent) = self.database.parent() {
            ensure_dir(parent)?;
        }
        for dir in self.report_paths() {
            ensure_dir(&dir)?;
        }
        Ok(())
    }
}

fn ensure_dir(path: &Path) -> std::io::Result<()> {
    fs::create_dir_all(path)
}
