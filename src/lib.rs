#![doc(test(attr(deny(warnings))))]

//! Cripta Backup produces, rotates, verifies and restores ZIP snapshots of the
//! parish niche registry's database, configuration, reports and assets, and
//! runs them automatically once a week.

pub mod archive;
pub mod cli;
pub mod clock;
pub mod config;
pub mod errors;
pub mod schedule;
pub mod scheduler;
pub mod utils;

use std::sync::Once;

pub use archive::{
    Archiver, RecordCensus, RestoreReport, Snapshot, SnapshotDetails, SnapshotMetadata,
};
pub use config::{AppPaths, BackupConfig, ConfigStore};
pub use errors::{BackupError, Result};
pub use scheduler::{BackupScheduler, ScheduleInfo};

static INIT_TRACING: Once = Once::new();

/// Initializes global tracing and emits a startup info log.
pub fn init() {
    INIT_TRACING.call_once(|| {
        utils::init_tracing();
        tracing::info!(version = utils::build_info::CLI_VERSION, "cripta backup initialized");
    });
}
