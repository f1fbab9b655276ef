//! Backup Scheduler: fires [`Archiver::create_snapshot`] once a week at the
//! configured day and time from a background polling thread.

use std::{
    panic::{self, AssertUnwindSafe},
    path::PathBuf,
    sync::{
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
        Arc, Mutex, MutexGuard,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use chrono::{DateTime, Local};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::archive::{snapshot_name, Archiver};
use crate::clock::Clock;
use crate::errors::{BackupError, Result};
use crate::schedule::{day_name, parse_day, TimeOfDay, WeeklySchedule};

/// How often the polling thread checks whether the job is due.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);
/// Upper bound `stop` waits for the polling thread to exit.
pub const STOP_TIMEOUT: Duration = Duration::from_millis(500);
const AUTO_PREFIX: &str = "auto_backup";
const MANUAL_PREFIX: &str = "manual_backup";

/// Handle to a backup running on its own worker thread.
pub type BackupHandle = JoinHandle<Result<PathBuf>>;

/// Read-only view of the scheduler for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduleInfo {
    pub day: String,
    pub time: String,
    pub next_run: Option<DateTime<Local>>,
    pub is_running: bool,
}

struct Job {
    schedule: WeeklySchedule,
    next_fire: DateTime<Local>,
}

struct Shared {
    archiver: Arc<Archiver>,
    clock: Arc<dyn Clock>,
    job: Mutex<Option<Job>>,
}

impl Shared {
    fn job(&self) -> MutexGuard<'_, Option<Job>> {
        self.job.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn run_pending(&self) -> Option<BackupHandle> {
        let now = self.clock.now();
        let name = {
            let mut guard = self.job();
            let job = guard.as_mut()?;
            if !WeeklySchedule::is_due(&job.next_fire, &now) {
                return None;
            }
            job.next_fire = job.schedule.next_after(&now);
            info!(next = %job.next_fire, "scheduled backup due");
            let prefix = format!("{}_{}", AUTO_PREFIX, day_name(job.schedule.weekday));
            snapshot_name(&prefix, now)
        };
        match spawn_backup(Arc::clone(&self.archiver), name, "automatic") {
            Ok(handle) => Some(handle),
            Err(err) => {
                error!(error = %err, "could not start automatic backup");
                None
            }
        }
    }
}

struct Worker {
    stop_tx: Sender<()>,
    done_rx: Receiver<()>,
    handle: JoinHandle<()>,
}

struct SchedulerState {
    day: String,
    time: String,
    worker: Option<Worker>,
}

/// Weekly automatic backups with a `stopped`/`running` lifecycle.
///
/// At most one job is installed at a time; `reconfigure` cancels the previous
/// job before installing the new one.
pub struct BackupScheduler {
    shared: Arc<Shared>,
    poll_interval: Duration,
    state: Mutex<SchedulerState>,
}

impl BackupScheduler {
    /// Reads `backup_day`/`backup_time` from the archiver's configuration.
    pub fn new(archiver: Arc<Archiver>) -> Self {
        let config = archiver.config();
        let clock = Arc::clone(archiver.clock());
        Self {
            shared: Arc::new(Shared {
                archiver,
                clock,
                job: Mutex::new(None),
            }),
            poll_interval: DEFAULT_POLL_INTERVAL,
            state: Mutex::new(SchedulerState {
                day: config.backup_day,
                time: config.backup_time,
                worker: None,
            }),
        }
    }

    /// Replaces the clock. Only effective before `start`.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.clock = clock;
        }
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Installs the weekly job and starts the polling thread, restarting it
    /// when already running. `day`/`time` override the current schedule.
    pub fn start(&self, day: Option<&str>, time: Option<&str>) -> Result<()> {
        let mut state = self.state();
        self.start_locked(&mut state, day, time)
    }

    /// Clears the job and waits up to [`STOP_TIMEOUT`] for the thread to exit.
    pub fn stop(&self) {
        let mut state = self.state();
        self.stop_locked(&mut state);
    }

    /// Persists the new day and time, then restarts with them.
    pub fn reconfigure(&self, day: &str, time: &str) -> Result<()> {
        TimeOfDay::parse(time)?;
        if parse_day(day).is_none() {
            warn!(day, "unrecognized backup day; the fallback day will be used");
        }
        let mut state = self.state();
        self.shared
            .archiver
            .config_store()
            .set_schedule(day, time)?;
        self.start_locked(&mut state, Some(day), Some(time))
    }

    /// Runs one poll tick: fires the job when due and returns the backup handle.
    pub fn run_pending(&self) -> Option<BackupHandle> {
        self.shared.run_pending()
    }

    /// Starts a `manual_backup_<timestamp>` snapshot on a worker thread.
    pub fn force_backup_now(&self) -> Result<BackupHandle> {
        let name = snapshot_name(MANUAL_PREFIX, self.shared.clock.now());
        spawn_backup(Arc::clone(&self.shared.archiver), name, "manual")
    }

    pub fn next_fire_time(&self) -> Option<DateTime<Local>> {
        self.shared.job().as_ref().map(|job| job.next_fire)
    }

    pub fn is_running(&self) -> bool {
        self.state().worker.is_some()
    }

    pub fn schedule_info(&self) -> ScheduleInfo {
        let state = self.state();
        ScheduleInfo {
            day: state.day.clone(),
            time: state.time.clone(),
            next_run: self.next_fire_time(),
            is_running: state.worker.is_some(),
        }
    }

    fn state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn start_locked(
        &self,
        state: &mut SchedulerState,
        day: Option<&str>,
        time: Option<&str>,
    ) -> Result<()> {
        if state.worker.is_some() {
            self.stop_locked(state);
        }
        let day = day
            .map(|value| value.trim().to_lowercase())
            .unwrap_or_else(|| state.day.clone());
        let time = time
            .map(|value| value.trim().to_string())
            .unwrap_or_else(|| state.time.clone());
        let schedule = WeeklySchedule::from_config(&day, &time)?;
        state.day = day;
        state.time = time;

        let next_fire = schedule.next_after(&self.shared.clock.now());
        *self.shared.job() = Some(Job {
            schedule,
            next_fire,
        });

        let (stop_tx, stop_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();
        let shared = Arc::clone(&self.shared);
        let interval = self.poll_interval;
        let spawned = thread::Builder::new()
            .name("backup-scheduler".into())
            .spawn(move || poll_loop(shared, interval, stop_rx, done_tx));
        let handle = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                *self.shared.job() = None;
                return Err(err.into());
            }
        };
        state.worker = Some(Worker {
            stop_tx,
            done_rx,
            handle,
        });
        info!(schedule = %schedule, next = %next_fire, "backup scheduler started");
        Ok(())
    }

    fn stop_locked(&self, state: &mut SchedulerState) {
        let Some(worker) = state.worker.take() else {
            return;
        };
        *self.shared.job() = None;
        let _ = worker.stop_tx.send(());
        match worker.done_rx.recv_timeout(STOP_TIMEOUT) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if worker.handle.join().is_err() {
                    warn!("backup scheduler thread panicked");
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!("backup scheduler thread did not stop in time; detaching");
            }
        }
        info!("backup scheduler stopped");
    }
}

impl Drop for BackupScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn poll_loop(shared: Arc<Shared>, interval: Duration, stop_rx: Receiver<()>, done_tx: Sender<()>) {
    loop {
        match stop_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
        // A failing tick must not end the loop.
        if panic::catch_unwind(AssertUnwindSafe(|| shared.run_pending())).is_err() {
            error!("backup scheduler tick panicked; continuing");
        }
    }
    let _ = done_tx.send(());
}

fn spawn_backup(
    archiver: Arc<Archiver>,
    name: String,
    trigger: &'static str,
) -> Result<BackupHandle> {
    let handle = thread::Builder::new()
        .name(format!("{trigger}-backup"))
        .spawn(move || match archiver.create_snapshot(Some(&name)) {
            Ok(path) => {
                info!(trigger, path = %path.display(), "backup completed");
                Ok(path)
            }
            Err(BackupError::Busy) => {
                warn!(trigger, name = %name, "backup skipped: another operation is running");
                Err(BackupError::Busy)
            }
            Err(err) => {
                error!(trigger, name = %name, error = %err, "backup failed");
                Err(err)
            }
        })?;
    Ok(handle)
}
