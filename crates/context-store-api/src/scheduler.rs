//! Background autosave and backup driver.
//!
//! One worker thread wakes on the earlier of the two intervals and runs the due
//! job. Every job, whether started by the worker or forced by a caller, holds
//! the same lane mutex, so at most one autosave or backup is in flight.

use std::collections::VecDeque;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use serde::Serialize;
use time::OffsetDateTime;

use crate::{AutosaveReport, BackupReport, ContextStore, RestoreSummary};

const HISTORY_LIMIT: usize = 100;
const MIN_INTERVAL: Duration = Duration::from_millis(50);
const MAX_INTERVAL: Duration = Duration::from_secs(365 * 24 * 3600);
const JOIN_POLL: Duration = Duration::from_millis(10);
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerState {
    #[default]
    Stopped,
    Running,
    Paused,
    Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskRecord {
    pub name: String,
    pub status: TaskStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub finished_at: OffsetDateTime,
    pub detail: Option<serde_json::Value>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub autosaves: u64,
    pub backups: u64,
    pub restores: u64,
    pub errors: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_autosave: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_backup: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    pub uptime_secs: u64,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<SchedulerState>,
    lane: Mutex<()>,
    stats: Mutex<SchedulerStats>,
    started: Mutex<Option<Instant>>,
    history: Mutex<VecDeque<TaskRecord>>,
}

impl Shared {
    fn state(&self) -> SchedulerState {
        *self.state.lock()
    }

    fn set_state(&self, state: SchedulerState) {
        *self.state.lock() = state;
    }

    /// Run `task` on the single lane and record its outcome.
    fn run<T: Serialize>(&self, name: &str, task: impl FnOnce() -> Result<T>) -> Result<T> {
        let _lane = self.lane.lock();
        let started_at = OffsetDateTime::now_utc();
        let result = task();
        let finished_at = OffsetDateTime::now_utc();

        let record = match &result {
            Ok(value) => {
                let mut stats = self.stats.lock();
                match name {
                    "autosave" => {
                        stats.autosaves += 1;
                        stats.last_autosave = Some(finished_at);
                    }
                    "backup" => {
                        stats.backups += 1;
                        stats.last_backup = Some(finished_at);
                    }
                    "restore" => stats.restores += 1,
                    _ => {}
                }
                TaskRecord {
                    name: name.to_string(),
                    status: TaskStatus::Succeeded,
                    started_at,
                    finished_at,
                    detail: serde_json::to_value(value).ok(),
                    error: None,
                }
            }
            Err(err) => {
                self.stats.lock().errors += 1;
                tracing::error!(task = name, error = %format!("{err:#}"), "scheduled task failed");
                TaskRecord {
                    name: name.to_string(),
                    status: TaskStatus::Failed,
                    started_at,
                    finished_at,
                    detail: None,
                    error: Some(format!("{err:#}")),
                }
            }
        };

        let mut history = self.history.lock();
        if history.len() == HISTORY_LIMIT {
            history.pop_front();
        }
        history.push_back(record);
        result
    }
}

#[derive(Debug)]
struct Worker {
    handle: JoinHandle<()>,
    cancel: Sender<()>,
}

/// Periodic autosave/backup driver for a [`ContextStore`].
#[derive(Debug)]
pub struct Scheduler {
    store: Arc<ContextStore>,
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl Scheduler {
    #[must_use]
    pub fn new(store: Arc<ContextStore>) -> Self {
        Self { store, shared: Arc::new(Shared::default()), worker: Mutex::new(None) }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<ContextStore> {
        &self.store
    }

    #[must_use]
    pub fn state(&self) -> SchedulerState {
        self.shared.state()
    }

    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        let mut stats = self.shared.stats.lock().clone();
        stats.uptime_secs = self.shared.started.lock().map_or(0, |started| started.elapsed().as_secs());
        stats
    }

    /// Most recent task records, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<TaskRecord> {
        self.shared.history.lock().iter().cloned().collect()
    }

    /// Spawn the worker. Returns `false` when it is already running.
    ///
    /// # Errors
    /// Returns an error when the worker thread cannot be spawned.
    pub fn start(&self) -> Result<bool> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(false);
        }
        let (cancel, cancelled) = mpsc::channel();
        let store = Arc::clone(&self.store);
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("context-store-scheduler".to_string())
            .spawn(move || worker_loop(&store, &shared, &cancelled))
            .context("failed to spawn scheduler thread")?;

        *worker = Some(Worker { handle, cancel });
        *self.shared.started.lock() = Some(Instant::now());
        self.shared.stats.lock().started_at = Some(OffsetDateTime::now_utc());
        self.shared.set_state(SchedulerState::Running);
        tracing::info!(
            autosave_secs = self.store.config().autosave_interval.as_secs_f64(),
            backup_secs = self.store.config().backup_interval.as_secs_f64(),
            backup_enabled = self.store.config().backup_enabled,
            "scheduler started"
        );
        Ok(true)
    }

    /// Signal the worker and wait up to `timeout` for it to exit. Returns
    /// whether it exited in time; a worker that does not is detached.
    pub fn stop(&self, timeout: Duration) -> bool {
        let Some(worker) = self.worker.lock().take() else {
            return true;
        };
        self.shared.set_state(SchedulerState::Stopping);
        let _ = worker.cancel.send(());

        let deadline = deadline_after(Instant::now(), timeout);
        while !worker.handle.is_finished() && Instant::now() < deadline {
            thread::sleep(JOIN_POLL);
        }
        let joined = worker.handle.is_finished();
        if joined {
            if worker.handle.join().is_err() {
                tracing::error!("scheduler worker panicked");
            }
        } else {
            tracing::warn!(timeout_ms = timeout.as_millis(), "scheduler worker did not stop in time; detaching");
        }
        *self.shared.started.lock() = None;
        self.shared.set_state(SchedulerState::Stopped);
        tracing::info!(joined, "scheduler stopped");
        joined
    }

    /// Skip due jobs until [`Self::resume`]. No effect unless running.
    pub fn pause(&self) -> bool {
        let mut state = self.shared.state.lock();
        if *state == SchedulerState::Running {
            *state = SchedulerState::Paused;
            tracing::info!("scheduler paused");
            true
        } else {
            false
        }
    }

    pub fn resume(&self) -> bool {
        let mut state = self.shared.state.lock();
        if *state == SchedulerState::Paused {
            *state = SchedulerState::Running;
            tracing::info!("scheduler resumed");
            true
        } else {
            false
        }
    }

    /// Run an autosave now, on the caller's thread.
    ///
    /// # Errors
    /// Returns an error when every registered app failed to save.
    pub fn force_autosave(&self) -> Result<AutosaveReport> {
        self.shared.run("autosave", || autosave(&self.store))
    }

    /// Run a backup now, on the caller's thread.
    ///
    /// # Errors
    /// Returns an error when the backup sweep cannot run.
    pub fn force_backup(&self) -> Result<BackupReport> {
        self.shared.run("backup", || self.store.backup_all())
    }

    /// Run the restore cascade for every discovered app.
    ///
    /// # Errors
    /// Returns an error when the project root cannot be listed.
    pub fn restore_all(&self) -> Result<RestoreSummary> {
        self.shared.run("restore", || self.store.restore_all())
    }

    /// Stop the worker and flush in-memory state one last time. Failures are logged.
    pub fn shutdown(&self) -> Option<AutosaveReport> {
        self.stop(DEFAULT_STOP_TIMEOUT);
        match self.force_autosave() {
            Ok(report) => {
                tracing::info!(apps = report.persisted.len(), "final flush complete");
                Some(report)
            }
            Err(err) => {
                tracing::error!(error = %format!("{err:#}"), "final flush failed");
                None
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if self.worker.get_mut().is_some() {
            self.stop(DEFAULT_STOP_TIMEOUT);
        }
    }
}

fn autosave(store: &ContextStore) -> Result<AutosaveReport> {
    let report = store.autosave_all();
    if !report.failed.is_empty() && report.persisted.is_empty() {
        let apps: Vec<&str> = report.failed.iter().map(|failure| failure.app.as_str()).collect();
        return Err(anyhow!("autosave failed for every app: {}", apps.join(", ")));
    }
    Ok(report)
}

/// `now + span`, with `span` capped at a year so the sum stays representable.
fn deadline_after(now: Instant, span: Duration) -> Instant {
    now.checked_add(span.min(MAX_INTERVAL)).unwrap_or(now)
}

fn worker_loop(store: &ContextStore, shared: &Shared, cancelled: &mpsc::Receiver<()>) {
    let config = store.config();
    let autosave_every = config.autosave_interval.clamp(MIN_INTERVAL, MAX_INTERVAL);
    let backup_every = config.backup_interval.clamp(MIN_INTERVAL, MAX_INTERVAL);
    let mut next_autosave = deadline_after(Instant::now(), autosave_every);
    let mut next_backup = config.backup_enabled.then(|| deadline_after(Instant::now(), backup_every));

    loop {
        let next_due = next_backup.map_or(next_autosave, |backup| backup.min(next_autosave));
        match cancelled.recv_timeout(next_due.saturating_duration_since(Instant::now())) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        let now = Instant::now();
        let paused = shared.state() == SchedulerState::Paused;
        if now >= next_autosave {
            next_autosave = deadline_after(now, autosave_every);
            if !paused {
                let _ = shared.run("autosave", || autosave(store));
            }
        }
        if let Some(due) = next_backup.filter(|due| now >= *due) {
            next_backup = Some(deadline_after(due.max(now), backup_every));
            if !paused {
                let _ = shared.run("backup", || store.backup_all());
            }
        }
    }
    tracing::debug!("scheduler worker exiting");
}
