//! Scheduler for the reconcile and cleanup passes.
//!
//! An explicit component owning its cancellable run handle: `start` spawns
//! the polling loop, `stop` cancels it, `status` reports per-job cron and
//! next/last run times. No module-level mutable state. Jobs fire from a
//! once-a-minute poll against their cron schedules; per-job last-run
//! tracking keeps a schedule slot from firing twice, and the reconciler's
//! own single-flight guards keep a slow run from overlapping itself when
//! the next slot comes due.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;

use crate::config::{ScheduleEntry, Schedules};
use crate::reconciler::Reconciler;

/// Poll interval for the scheduler loop (1 minute).
const POLL_INTERVAL_SECS: u64 = 60;

/// Match window around a scheduled time. Wider than the poll interval so a
/// delayed poll (system sleep, load) still catches its slot.
const MATCH_WINDOW_SECS: i64 = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobId {
    Reconcile,
    Cleanup,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub job: JobId,
    pub enabled: bool,
    pub cron: String,
    pub timezone: String,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub running: bool,
    pub jobs: Vec<JobStatus>,
}

struct RunningLoop {
    handle: tokio::task::JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

pub struct WatchScheduler {
    schedules: Schedules,
    reconciler: Arc<Reconciler>,
    last_runs: Arc<Mutex<HashMap<JobId, DateTime<Utc>>>>,
    inner: Mutex<Option<RunningLoop>>,
}

impl WatchScheduler {
    pub fn new(schedules: Schedules, reconciler: Arc<Reconciler>) -> Self {
        Self {
            schedules,
            reconciler,
            last_runs: Arc::new(Mutex::new(HashMap::new())),
            inner: Mutex::new(None),
        }
    }

    /// Spawn the polling loop. Returns false when already running.
    pub fn start(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.is_some() {
            log::warn!("Scheduler already running");
            return false;
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let schedules = self.schedules.clone();
        let reconciler = self.reconciler.clone();
        let last_runs = self.last_runs.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(POLL_INTERVAL_SECS)) => {}
                    _ = shutdown_rx.changed() => {
                        log::info!("Scheduler loop stopping");
                        return;
                    }
                }

                let now = Utc::now();

                if schedules.reconcile.enabled
                    && due(&schedules.reconcile, JobId::Reconcile, &last_runs, now)
                {
                    last_runs.lock().insert(JobId::Reconcile, now);
                    let job = reconciler.clone();
                    tokio::spawn(async move {
                        job.run_tick().await;
                    });
                }

                if schedules.cleanup.enabled
                    && due(&schedules.cleanup, JobId::Cleanup, &last_runs, now)
                {
                    last_runs.lock().insert(JobId::Cleanup, now);
                    let job = reconciler.clone();
                    tokio::spawn(async move {
                        job.run_deep_cleanup().await;
                    });
                }
            }
        });

        *inner = Some(RunningLoop {
            handle,
            shutdown: shutdown_tx,
        });
        log::info!("Scheduler started");
        true
    }

    /// Cancel the polling loop. Jobs already dispatched run to completion.
    /// Returns false when not running.
    pub fn stop(&self) -> bool {
        match self.inner.lock().take() {
            Some(running) => {
                let _ = running.shutdown.send(true);
                running.handle.abort();
                log::info!("Scheduler stopped");
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().is_some()
    }

    pub fn status(&self) -> SchedulerStatus {
        let last = self.last_runs.lock();
        let jobs = [
            (JobId::Reconcile, &self.schedules.reconcile),
            (JobId::Cleanup, &self.schedules.cleanup),
        ]
        .into_iter()
        .map(|(job, entry)| JobStatus {
            job,
            enabled: entry.enabled,
            cron: entry.cron.clone(),
            timezone: entry.timezone.clone(),
            last_run: last.get(&job).copied(),
            next_run: next_run_time(entry).ok(),
        })
        .collect();

        SchedulerStatus {
            running: self.is_running(),
            jobs,
        }
    }
}

/// Whether a job's schedule has a slot due now that hasn't fired yet.
fn due(
    entry: &ScheduleEntry,
    job: JobId,
    last_runs: &Mutex<HashMap<JobId, DateTime<Utc>>>,
    now: DateTime<Utc>,
) -> bool {
    let schedule = match parse_cron(&entry.cron) {
        Ok(schedule) => schedule,
        Err(e) => {
            log::warn!("Skipping {:?}: {}", job, e);
            return false;
        }
    };
    let tz: Tz = match entry.timezone.parse() {
        Ok(tz) => tz,
        Err(_) => {
            log::warn!("Skipping {:?}: invalid timezone {}", job, entry.timezone);
            return false;
        }
    };

    let now_local = now.with_timezone(&tz);
    let last_run = last_runs.lock().get(&job).copied();

    let mut scheduled_times = schedule.after(&(now_local - chrono::Duration::minutes(2)));
    if let Some(next_time) = scheduled_times.next() {
        let next_utc = next_time.with_timezone(&Utc);
        let diff = (now - next_utc).num_seconds().abs();
        if diff < MATCH_WINDOW_SECS {
            if let Some(last) = last_run {
                if (last - next_utc).num_seconds().abs() < 60 {
                    return false; // Already ran this slot
                }
            }
            return true;
        }
    }

    false
}

/// Parse a 5-field cron expression (the `cron` crate wants a seconds field;
/// prepend a zero).
pub fn parse_cron(expr: &str) -> Result<Schedule, String> {
    let full_expr = format!("0 {}", expr);
    full_expr
        .parse::<Schedule>()
        .map_err(|e| format!("Invalid cron expression '{}': {}", expr, e))
}

/// Next fire time for a schedule entry, in UTC.
pub fn next_run_time(entry: &ScheduleEntry) -> Result<DateTime<Utc>, String> {
    let schedule = parse_cron(&entry.cron)?;
    let tz: Tz = entry
        .timezone
        .parse()
        .map_err(|_| format!("Invalid timezone: {}", entry.timezone))?;

    schedule
        .upcoming(tz)
        .next()
        .map(|t| t.with_timezone(&Utc))
        .ok_or_else(|| "No upcoming scheduled time".to_string())
}
