#![allow(dead_code)]

use std::{fs, path::Path, sync::Arc};

use cripta_backup::{AppPaths, Archiver};
use tempfile::TempDir;

pub const DATABASE_BYTES: &[u8] = b"0123456789";

/// Data directory with a database, a config file, one report and one asset.
pub struct Fixture {
    pub temp: TempDir,
    pub paths: AppPaths,
}

impl Fixture {
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let paths = AppPaths::at(temp.path().join("CriptasParroquia"));
        paths.ensure_dirs().unwrap();
        fs::write(&paths.database, DATABASE_BYTES).unwrap();
        fs::write(&paths.app_config_file, r#"{"parish": "San Roque"}"#).unwrap();
        write(&paths.root.join("recibos/2024/recibo_001.pdf"), b"%PDF-recibo");
        write(&paths.root.join("images/logo.png"), b"\x89PNG-logo");
        Self { temp, paths }
    }

    pub fn archiver(&self) -> Archiver {
        Archiver::open(self.paths.clone()).unwrap()
    }

    pub fn shared_archiver(&self) -> Arc<Archiver> {
        Arc::new(self.archiver())
    }

    pub fn backup_names(&self) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(&self.paths.backups_dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

pub fn write(path: &Path, bytes: &[u8]) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, bytes).unwrap();
}
