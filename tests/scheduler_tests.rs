mod common;

use std::{
    fs,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use chrono::{DateTime, Datelike, Local, TimeZone, Timelike, Weekday};
use common::Fixture;
use cripta_backup::{
    clock::{Clock, ManualClock},
    BackupError, BackupScheduler, ConfigStore,
};

fn local(y: i32, m: u32, d: u32, h: u32, min: u32, sec: u32) -> DateTime<Local> {
    Local.with_ymd_and_hms(y, m, d, h, min, sec).earliest().unwrap()
}

/// Manual clock that panics on the next `panics` reads.
struct FlakyClock {
    inner: ManualClock,
    panics: AtomicUsize,
}

impl Clock for FlakyClock {
    fn now(&self) -> DateTime<Local> {
        let armed = self
            .panics
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if armed {
            panic!("clock unavailable");
        }
        self.inner.now()
    }
}

fn wait_for_backups(fixture: &Fixture) -> Vec<String> {
    for _ in 0..100 {
        let names = fixture.backup_names();
        if !names.is_empty() {
            return names;
        }
        thread::sleep(Duration::from_millis(20));
    }
    fixture.backup_names()
}

#[test]
fn reconfigure_updates_schedule_and_persists_it() {
    let fixture = Fixture::new();
    let scheduler = BackupScheduler::new(fixture.shared_archiver());

    scheduler.reconfigure("tuesday", "09:00").unwrap();

    let info = scheduler.schedule_info();
    assert_eq!(info.day, "tuesday");
    assert_eq!(info.time, "09:00");
    assert!(info.is_running);
    let next = scheduler.next_fire_time().unwrap();
    assert_eq!(next.weekday(), Weekday::Tue);
    assert_eq!((next.hour(), next.minute()), (9, 0));
    assert!(next > Local::now());

    let stored = ConfigStore::open(&fixture.paths.backup_config_file).snapshot();
    assert_eq!(stored.backup_day, "tuesday");
    assert_eq!(stored.backup_time, "09:00");
}

#[test]
fn concurrent_reconfigures_leave_one_consistent_job() {
    let fixture = Fixture::new();
    let scheduler = Arc::new(BackupScheduler::new(fixture.shared_archiver()));

    let handles: Vec<_> = [("monday", "08:00"), ("thursday", "18:30"), ("sunday", "23:59")]
        .into_iter()
        .map(|(day, time)| {
            let scheduler = Arc::clone(&scheduler);
            thread::spawn(move || scheduler.reconfigure(day, time).unwrap())
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let info = scheduler.schedule_info();
    let next = info.next_run.unwrap();
    let expected = match info.day.as_str() {
        "monday" => (Weekday::Mon, "08:00"),
        "thursday" => (Weekday::Thu, "18:30"),
        "sunday" => (Weekday::Sun, "23:59"),
        other => panic!("unexpected day {other}"),
    };
    assert_eq!(next.weekday(), expected.0);
    assert_eq!(info.time, expected.1);
    assert!(info.is_running);

    let stored = ConfigStore::open(&fixture.paths.backup_config_file).snapshot();
    assert_eq!(stored.backup_day, info.day);
    assert_eq!(stored.backup_time, info.time);
}

#[test]
fn polling_thread_fires_due_backup() {
    let fixture = Fixture::new();
    // Friday 2024-03-15 23:59; the job is due at Saturday 00:00.
    let clock = Arc::new(ManualClock::new(
        Local.with_ymd_and_hms(2024, 3, 15, 23, 59, 0).earliest().unwrap(),
    ));
    let archiver = Arc::new(fixture.archiver().with_clock(clock.clone() as Arc<dyn Clock>));
    let scheduler =
        BackupScheduler::new(archiver).with_poll_interval(Duration::from_millis(20));
    scheduler.start(Some("sábado"), Some("00:00")).unwrap();
    assert!(fixture.backup_names().is_empty());

    clock.set(Local.with_ymd_and_hms(2024, 3, 16, 0, 0, 30).earliest().unwrap());
    let mut names = Vec::new();
    for _ in 0..100 {
        names = fixture.backup_names();
        if !names.is_empty() {
            break;
        }
        thread::sleep(Duration::from_millis(20));
    }
    scheduler.stop();

    assert_eq!(names, vec!["auto_backup_saturday_20240316_000030.zip"]);
    assert!(!scheduler.is_running());
}

#[test]
fn dropping_the_scheduler_stops_it() {
    let fixture = Fixture::new();
    let scheduler = BackupScheduler::new(fixture.shared_archiver());
    scheduler.start(None, None).unwrap();
    let started = std::time::Instant::now();
    drop(scheduler);
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[test]
fn polling_survives_a_panicking_tick() {
    let fixture = Fixture::new();
    let clock = Arc::new(FlakyClock {
        inner: ManualClock::new(local(2024, 3, 15, 23, 59, 0)),
        panics: AtomicUsize::new(0),
    });
    let archiver = Arc::new(fixture.archiver().with_clock(clock.clone() as Arc<dyn Clock>));
    let scheduler =
        BackupScheduler::new(archiver).with_poll_interval(Duration::from_millis(20));
    scheduler.start(Some("saturday"), Some("00:00")).unwrap();

    clock.panics.store(2, Ordering::SeqCst);
    clock.inner.set(local(2024, 3, 16, 0, 0, 30));
    let names = wait_for_backups(&fixture);

    assert_eq!(clock.panics.load(Ordering::SeqCst), 0);
    assert!(scheduler.is_running());
    scheduler.stop();
    assert_eq!(names, vec!["auto_backup_saturday_20240316_000030.zip"]);
}

#[test]
fn failed_scheduled_backup_keeps_the_scheduler_running() {
    let fixture = Fixture::new();
    fs::remove_file(&fixture.paths.database).unwrap();
    fs::create_dir_all(&fixture.paths.database).unwrap();
    let clock = Arc::new(ManualClock::new(local(2024, 1, 1, 10, 0, 0)));
    let archiver = Arc::new(fixture.archiver().with_clock(clock.clone() as Arc<dyn Clock>));
    let scheduler = BackupScheduler::new(archiver);
    scheduler.start(Some("tuesday"), Some("09:00")).unwrap();

    clock.set(local(2024, 1, 2, 9, 0, 0));
    let outcome = scheduler.run_pending().unwrap().join().unwrap();

    assert!(matches!(outcome, Err(BackupError::Io(_))));
    assert!(fixture.backup_names().is_empty());
    assert!(scheduler.is_running());
    assert_eq!(scheduler.next_fire_time(), Some(local(2024, 1, 9, 9, 0, 0)));
}

