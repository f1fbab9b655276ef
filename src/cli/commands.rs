use std::{
    io::{self, Read},
    path::Path,
    sync::Arc,
};

use chrono::Local;

use super::{output, CliError, CliResult};
use crate::archive::{Archiver, METADATA_VERSION};
use crate::config::AppPaths;
use crate::schedule::WeeklySchedule;
use crate::scheduler::BackupScheduler;
use crate::utils::build_info;

const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub(super) struct Context {
    archiver: Arc<Archiver>,
}

impl Context {
    /// Opens the archiver over the resolved data directory, creating the
    /// managed directories on first use.
    pub fn open() -> Result<Self, CliError> {
        let paths = AppPaths::resolve();
        paths.ensure_dirs().map_err(crate::errors::BackupError::from)?;
        Ok(Self {
            archiver: Arc::new(Archiver::open(paths)?),
        })
    }

    pub fn dispatch(&self, command: &str, args: &[&str]) -> CliResult {
        match command {
            "create" => self.create(args.first().copied()),
            "restore" => self.restore(required(args, "restore", "<archive>")?),
            "verify" => self.verify(required(args, "verify", "<archive>")?),
            "list" => self.list(),
            "delete" => self.delete(required(args, "delete", "<file>")?),
            "info" => self.info(required(args, "info", "<file>")?),
            "report" => self.report(args.first().copied()),
            "schedule" => match args {
                [] => self.show_schedule(),
                [day, time] => self.change_schedule(day, time),
                _ => Err(CliError::Usage(
                    "schedule takes either no arguments or <day> <time>".into(),
                )),
            },
            "run" => self.run_scheduler(),
            other => Err(CliError::Usage(format!("unknown command `{other}`"))),
        }
    }

    fn create(&self, name: Option<&str>) -> CliResult {
        let path = self.archiver.create_snapshot(name)?;
        output::success(format!("Snapshot created: {}", path.display()));
        Ok(())
    }

    fn restore(&self, archive: &str) -> CliResult {
        let report = self.archiver.restore_snapshot(Path::new(archive))?;
        output::success(format!(
            "Restored {} entries from the backup dated {}",
            report.restored_entries, report.backup_date
        ));
        output::info(format!(
            "Previous state saved to {}",
            report.safety_snapshot.display()
        ));
        Ok(())
    }

    fn verify(&self, archive: &str) -> CliResult {
        let (intact, message) = self.archiver.verify(Path::new(archive));
        if intact {
            output::success(&message);
            Ok(())
        } else {
            output::error(&message);
            Err(CliError::Failed(message))
        }
    }

    fn list(&self) -> CliResult {
        let snapshots = self.archiver.list_snapshots()?;
        output::section(format!("Snapshots in {}", self.archiver.backup_dir().display()));
        if snapshots.is_empty() {
            output::info("No snapshots found.");
            return Ok(());
        }
        for snapshot in &snapshots {
            let records = snapshot
                .metadata
                .as_ref()
                .map(|metadata| format!("{} records", metadata.record_total()))
                .unwrap_or_else(|| "no metadata".to_string());
            println!(
                "  {:<48} {:>10} bytes  {}  {}",
                snapshot.filename,
                snapshot.size_bytes,
                snapshot.created_at.format(DATE_FORMAT),
                records
            );
        }
        output::info(format!("{} snapshot(s)", snapshots.len()));
        Ok(())
    }

    fn delete(&self, filename: &str) -> CliResult {
        if self.archiver.delete_snapshot(filename)? {
            output::success(format!("Deleted {filename}"));
            Ok(())
        } else {
            let message = format!("No snapshot named {filename}");
            output::warning(&message);
            Err(CliError::Failed(message))
        }
    }

    fn info(&self, filename: &str) -> CliResult {
        let Some(details) = self.archiver.snapshot_details(filename)? else {
            let message = format!("No snapshot named {filename}");
            output::warning(&message);
            return Err(CliError::Failed(message));
        };
        output::section(&details.filename);
        output::field("size", format!("{} bytes", details.size_bytes));
        output::field("entries", details.file_count());
        match &details.metadata {
            Some(metadata) => {
                output::field("backup date", &metadata.backup_date);
                output::field("type", &metadata.backup_type);
                output::field("version", &metadata.version);
                output::field("database size", format!("{} bytes", metadata.database_size));
                for (table, count) in &metadata.total_records {
                    output::field(table, count);
                }
            }
            None => output::warning("Archive has no readable metadata."),
        }
        for entry in &details.entries {
            println!("    {entry}");
        }
        Ok(())
    }

    fn report(&self, output_path: Option<&str>) -> CliResult {
        let path = self.archiver.export_report(output_path.map(Path::new))?;
        output::success(format!("Report written to {}", path.display()));
        Ok(())
    }

    fn show_schedule(&self) -> CliResult {
        let config = self.archiver.config();
        let schedule = WeeklySchedule::from_config(&config.backup_day, &config.backup_time)?;
        output::section("Automatic backups");
        output::field("enabled", config.auto_backup_enabled);
        output::field("day", &config.backup_day);
        output::field("time", &config.backup_time);
        output::field("next run", schedule.next_after(&Local::now()).format(DATE_FORMAT));
        output::field("keep", config.max_backups);
        Ok(())
    }

    fn change_schedule(&self, day: &str, time: &str) -> CliResult {
        let schedule = WeeklySchedule::from_config(day, time)?;
        self.archiver.config_store().set_schedule(day, time)?;
        output::success(format!("Backups scheduled {schedule}"));
        output::field("next run", schedule.next_after(&Local::now()).format(DATE_FORMAT));
        Ok(())
    }

    fn run_scheduler(&self) -> CliResult {
        if !self.archiver.config().auto_backup_enabled {
            output::warning("Automatic backups are disabled; the scheduler was not started.");
            return Ok(());
        }
        let scheduler = BackupScheduler::new(Arc::clone(&self.archiver));
        scheduler.start(None, None)?;
        let info = scheduler.schedule_info();
        output::success(format!("Scheduler running: every {} at {}", info.day, info.time));
        if let Some(next) = info.next_run {
            output::field("next run", next.format(DATE_FORMAT));
        }
        output::info("Close stdin (Ctrl-D) to stop.");

        let mut sink = Vec::new();
        let read = io::stdin().read_to_end(&mut sink);
        scheduler.stop();
        read.map_err(crate::errors::BackupError::from)?;
        output::info("Scheduler stopped.");
        Ok(())
    }
}

pub(super) fn version() -> CliResult {
    let meta = build_info::current();
    output::section(meta.summary());
    output::field("build time", meta.timestamp);
    output::field("target", meta.target);
    output::field("rustc", meta.rustc);
    output::field("metadata", METADATA_VERSION);
    Ok(())
}

fn required<'a>(args: &[&'a str], command: &str, placeholder: &str) -> Result<&'a str, CliError> {
    args.first()
        .copied()
        .ok_or_else(|| CliError::Usage(format!("{command} requires {placeholder}")))
}
