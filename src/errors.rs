use std::path::PathBuf;

use thiserror::Error;

/// Error type shared by the archiver, the scheduler, and the configuration store.
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("Directory walk error: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("Backup archive not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("Invalid backup archive: {0}")]
    Validation(String),
    #[error("Another backup or restore is already in progress")]
    Busy,
    #[error("Invalid schedule: {0}")]
    Schedule(String),
}

pub type Result<T> = std::result::Result<T, BackupError>;

impl BackupError {
    /// Validation failures leave every live file untouched.
    pub fn is_validation(&self) -> bool {
        matches!(self, BackupError::Validation(_))
    }
}
