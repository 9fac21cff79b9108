use crate::backup::function_path;
use crate::backup::history::{HistoryRetention, RunHistoryEntry, RunOutcome};
use crate::backup::manager::{BackupManager, BackupOutcome, BackupRecord};
use crate::backup::notifications::{emit, BackupEvent, EventKind, Notification, Operation};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{AddFunctionName, AddMsg};
use crate::backup::state_file;

use bon::{bon, Builder};
use chrono::{DateTime, Utc};
use derive_more::Display;
use function_name::named;
use getset::Getters;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use uuid::Uuid;

use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

pub static SCHEDULES_FILE_NAME: &str = "schedules.json";
pub static HISTORY_FILE_NAME: &str = "run_history.json";
/// Upper bound on one idle wait, so external schedule edits and clock
/// jumps are noticed within a minute.
static IDLE_POLL: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug, Display, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    #[display("daily")]
    Daily,
    #[display("weekly")]
    Weekly,
}

/// One recurring backup slot. `next_fire_at` is the only piece of mutable
/// state, everything else is fixed at creation.
#[skip_serializing_none]
#[derive(Clone, Debug, Builder, Getters, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub")]
pub struct ScheduleEntry {
    id: Uuid,
    kind: ScheduleKind,
    hour: u32,
    minute: u32,
    /// Weekly only, 0 is Sunday.
    weekday: Option<u32>,
    enabled: bool,
    next_fire_at: DateTime<Utc>,
}

impl ScheduleEntry {
    fn cron(&self) -> String {
        cron_expr(self.kind, self.hour, self.minute, self.weekday)
    }
}

fn cron_expr(kind: ScheduleKind, hour: u32, minute: u32, weekday: Option<u32>) -> String {
    match kind {
        ScheduleKind::Daily => format!("{minute} {hour} * * *"),
        ScheduleKind::Weekly => format!("{minute} {hour} * * {}", weekday.unwrap_or(0)),
    }
}

fn parse_cron(cron: &str, after: &DateTime<Utc>) -> Result<DateTime<Utc>> {
    cron_parser::parse(cron, after)
        .map_err(|e| Error::invalid_schedule(format!("cron {cron:?}: {e}")))
}

struct SchedulerState {
    entries: Vec<ScheduleEntry>,
    history: Vec<RunHistoryEntry>,
    stop: bool,
}

struct SchedulerInner {
    manager: BackupManager,
    backup_dir: Arc<Path>,
    retention: HistoryRetention,
    state: Mutex<SchedulerState>,
    wake: Condvar,
    sinks: Arc<Vec<Arc<dyn Notification>>>,
}

/// Runs daily and weekly backup schedules on a background worker thread.
/// Due runs execute one at a time ordered by due time then id, a backlog
/// of missed occurrences collapses into a single immediate run before the
/// schedule realigns to its next slot.
pub struct BackupScheduler {
    inner: Arc<SchedulerInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for BackupScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupScheduler")
            .field("backup_dir", &self.inner.backup_dir)
            .field("retention", &self.inner.retention)
            .finish_non_exhaustive()
    }
}

#[bon]
impl BackupScheduler {
    /// Loads persisted schedules and run history from `backup_dir`. The
    /// worker thread is not started until `start` is called.
    #[builder]
    pub fn new(
        manager: BackupManager,
        #[builder(into)] backup_dir: Arc<Path>,
        #[builder(default)] retention: HistoryRetention,
        #[builder(default)] sinks: Vec<Arc<dyn Notification>>,
    ) -> Result<Self> {
        let entries: Vec<ScheduleEntry> =
            state_file::load_json_or_default(backup_dir.join(SCHEDULES_FILE_NAME))?;
        let history: Vec<RunHistoryEntry> =
            state_file::load_json_or_default(backup_dir.join(HISTORY_FILE_NAME))?;
        tracing::debug!(
            "Loaded {} schedules and {} run history entries from {:?}",
            entries.len(),
            history.len(),
            backup_dir
        );
        Ok(BackupScheduler {
            inner: Arc::new(SchedulerInner {
                manager,
                backup_dir,
                retention,
                state: Mutex::new(SchedulerState {
                    entries,
                    history,
                    stop: false,
                }),
                wake: Condvar::new(),
                sinks: Arc::new(sinks),
            }),
            worker: Mutex::new(None),
        })
    }

    /// Adds a schedule firing every day at `hour:minute` UTC.
    #[named]
    pub fn add_daily(&self, hour: u32, minute: u32) -> Result<ScheduleEntry> {
        self.add_entry(ScheduleKind::Daily, hour, minute, None, Utc::now())
            .add_fn_name(function_path!())
    }

    /// Adds a schedule firing every week on `weekday` (0 is Sunday) at
    /// `hour:minute` UTC.
    #[named]
    pub fn add_weekly(&self, weekday: u32, hour: u32, minute: u32) -> Result<ScheduleEntry> {
        self.add_entry(ScheduleKind::Weekly, hour, minute, Some(weekday), Utc::now())
            .add_fn_name(function_path!())
    }

    fn add_entry(
        &self,
        kind: ScheduleKind,
        hour: u32,
        minute: u32,
        weekday: Option<u32>,
        now: DateTime<Utc>,
    ) -> Result<ScheduleEntry> {
        if hour > 23 {
            return Err(Error::invalid_schedule(format!("hour {hour} out of range 0-23")));
        }
        if minute > 59 {
            return Err(Error::invalid_schedule(format!(
                "minute {minute} out of range 0-59"
            )));
        }
        if let Some(weekday) = weekday {
            if weekday > 6 {
                return Err(Error::invalid_schedule(format!(
                    "weekday {weekday} out of range 0-6, 0 is Sunday"
                )));
            }
        }

        let next_fire_at = parse_cron(&cron_expr(kind, hour, minute, weekday), &now)?;
        let entry = ScheduleEntry::builder()
            .id(Uuid::new_v4())
            .kind(kind)
            .hour(hour)
            .minute(minute)
            .maybe_weekday(weekday)
            .enabled(true)
            .next_fire_at(next_fire_at)
            .build();
        {
            let mut state = self.inner.lock_state();
            state.entries.push(entry.clone());
            self.inner.save_schedules(&state.entries)?;
        }
        self.inner.wake.notify_all();
        tracing::info!(
            "Added {} schedule {} firing next at {}",
            entry.kind(),
            entry.id(),
            entry.next_fire_at()
        );
        Ok(entry)
    }

    /// Snapshot of all schedules in insertion order.
    pub fn entries(&self) -> Vec<ScheduleEntry> {
        self.inner.lock_state().entries.clone()
    }

    /// Snapshot of the run history, oldest first.
    pub fn history(&self) -> Vec<RunHistoryEntry> {
        let mut history = self.inner.lock_state().history.clone();
        history.sort_by(|a, b| a.triggered_at().cmp(b.triggered_at()));
        history
    }

    pub fn enable(&self, id: Uuid) -> Result<ScheduleEntry> {
        self.set_enabled(id, true)
    }

    pub fn disable(&self, id: Uuid) -> Result<ScheduleEntry> {
        self.set_enabled(id, false)
    }

    fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<ScheduleEntry> {
        let updated = {
            let mut state = self.inner.lock_state();
            let entry = state
                .entries
                .iter_mut()
                .find(|e| *e.id() == id)
                .ok_or_else(|| Error::not_found(format!("schedule {id}")))?;
            if enabled {
                // a re-enabled schedule must not replay slots missed
                // while it was off
                entry.next_fire_at = parse_cron(&entry.cron(), &Utc::now())?;
            }
            entry.enabled = enabled;
            let updated = entry.clone();
            self.inner.save_schedules(&state.entries)?;
            updated
        };
        self.inner.wake.notify_all();
        tracing::info!(
            "Schedule {} is now {}",
            id,
            if enabled { "enabled" } else { "disabled" }
        );
        Ok(updated)
    }

    pub fn remove(&self, id: Uuid) -> Result<()> {
        {
            let mut state = self.inner.lock_state();
            let before = state.entries.len();
            state.entries.retain(|e| *e.id() != id);
            if state.entries.len() == before {
                return Err(Error::not_found(format!("schedule {id}")));
            }
            self.inner.save_schedules(&state.entries)?;
        }
        self.inner.wake.notify_all();
        tracing::info!("Removed schedule {id}");
        Ok(())
    }

    /// Executes one backup immediately on the calling thread, journaled in
    /// the run history without a schedule id.
    pub fn run_now(&self) -> Result<BackupRecord> {
        self.inner.execute(None, Utc::now())
    }

    pub fn clear_history(&self) -> Result<()> {
        let mut state = self.inner.lock_state();
        state.history.clear();
        self.inner.save_history(&state.history)
    }

    /// Starts the background worker. Calling it while a worker is running
    /// is a no-op.
    pub fn start(&self) -> Result<()> {
        let mut worker = self.lock_worker();
        if worker.is_some() {
            tracing::warn!("Scheduler worker already running");
            return Ok(());
        }
        self.inner.lock_state().stop = false;
        let inner = self.inner.clone();
        let handle = std::thread::Builder::new()
            .name("snapvault-scheduler".to_string())
            .spawn(move || inner.run_loop())
            .map_err(Error::from)
            .add_msg("Spawning the scheduler worker failed")?;
        *worker = Some(handle);
        tracing::info!("Scheduler worker started");
        Ok(())
    }

    /// Stops the background worker, waiting for an in-flight run to finish.
    /// Calling it without a running worker is a no-op.
    pub fn stop(&self) -> Result<()> {
        let mut worker = self.lock_worker();
        let Some(handle) = worker.take() else {
            tracing::warn!("Scheduler worker is not running");
            return Ok(());
        };
        self.inner.lock_state().stop = true;
        self.inner.wake.notify_all();
        if handle.join().is_err() {
            tracing::error!("Scheduler worker panicked");
        }
        tracing::info!("Scheduler worker stopped");
        Ok(())
    }

    fn lock_worker(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SchedulerInner {
    fn run_loop(&self) {
        tracing::info!("Scheduler loop running");
        loop {
            if self.lock_state().stop {
                break;
            }
            let now = Utc::now();
            if self.fire_due(now) > 0 {
                continue;
            }
            let state = self.lock_state();
            if state.stop {
                break;
            }
            let wait = state
                .entries
                .iter()
                .filter(|e| *e.enabled())
                .map(|e| *e.next_fire_at())
                .min()
                .map(|next| (next - now).to_std().unwrap_or(Duration::ZERO))
                .unwrap_or(IDLE_POLL);
            let _ = self
                .wake
                .wait_timeout(state, wait.min(IDLE_POLL))
                .unwrap_or_else(PoisonError::into_inner);
        }
        tracing::info!("Scheduler loop exited");
    }

    /// Runs every enabled schedule whose fire time has passed, ordered by
    /// due time then id. Returns how many ran.
    fn fire_due(&self, now: DateTime<Utc>) -> usize {
        let due: Vec<ScheduleEntry> = {
            let state = self.lock_state();
            state
                .entries
                .iter()
                .filter(|e| *e.enabled() && *e.next_fire_at() <= now)
                .cloned()
                .sorted_by(|a, b| {
                    a.next_fire_at()
                        .cmp(b.next_fire_at())
                        .then_with(|| a.id().cmp(b.id()))
                })
                .collect()
        };

        let mut fired = 0;
        for entry in &due {
            if self.lock_state().stop {
                break;
            }
            if let Err(e) = self.execute(Some(entry), now) {
                tracing::warn!("Scheduled run for {} failed: {}", entry.id(), e);
            }
            fired += 1;
        }
        fired
    }

    fn execute(&self, schedule: Option<&ScheduleEntry>, now: DateTime<Utc>) -> Result<BackupRecord> {
        let detail = match schedule {
            Some(entry) => format!("schedule {}", entry.id()),
            None => "on-demand".to_string(),
        };
        emit(
            &self.sinks,
            &BackupEvent::now_with_detail(EventKind::Started, Operation::ScheduledRun, detail.clone()),
        );

        let result = self.manager.create(self.manager.source_dir());
        let completed_at = Utc::now();
        let (outcome, backup_record_id, error_detail) = match &result {
            Ok(record) if *record.outcome() == BackupOutcome::Success => {
                (RunOutcome::Success, Some(*record.id()), None)
            }
            Ok(record) => (
                RunOutcome::Failed,
                Some(*record.id()),
                record.error_detail().clone(),
            ),
            Err(e) => (RunOutcome::Failed, None, Some(e.to_string())),
        };

        let run = RunHistoryEntry::builder()
            .id(Uuid::new_v4())
            .maybe_schedule_id(schedule.map(|e| *e.id()))
            .triggered_at(now)
            .completed_at(completed_at)
            .outcome(outcome)
            .maybe_backup_record_id(backup_record_id)
            .maybe_error_detail(error_detail)
            .build();

        {
            let mut state = self.lock_state();
            state.history.push(run);
            let removed = self.retention.prune(&mut state.history, completed_at);
            if removed > 0 {
                tracing::debug!("Pruned {} run history entries", removed);
            }
            if let Some(schedule) = schedule {
                if let Some(entry) = state.entries.iter_mut().find(|e| e.id() == schedule.id()) {
                    // realign from the trigger time, any backlog of missed
                    // occurrences has collapsed into the run above
                    match parse_cron(&entry.cron(), &now) {
                        Ok(next) => entry.next_fire_at = next,
                        Err(e) => {
                            tracing::warn!(
                                "Schedule {} has an unusable cron, disabling: {}",
                                entry.id(),
                                e
                            );
                            entry.enabled = false;
                        }
                    }
                }
                if let Err(e) = self.save_schedules(&state.entries) {
                    tracing::warn!("Persisting schedules failed: {}", e);
                }
            }
            if let Err(e) = self.save_history(&state.history) {
                tracing::warn!("Persisting run history failed: {}", e);
            }
        }

        let kind = match outcome {
            RunOutcome::Success => EventKind::Succeeded,
            RunOutcome::Failed => EventKind::Failed,
        };
        emit(
            &self.sinks,
            &BackupEvent::now_with_detail(kind, Operation::ScheduledRun, detail),
        );
        result
    }

    fn save_schedules(&self, entries: &[ScheduleEntry]) -> Result<()> {
        state_file::save_json(self.backup_dir.join(SCHEDULES_FILE_NAME), &entries)
            .add_msg("Writing schedules failed")
    }

    fn save_history(&self, history: &[RunHistoryEntry]) -> Result<()> {
        state_file::save_json(self.backup_dir.join(HISTORY_FILE_NAME), &history)
            .add_msg("Writing run history failed")
    }

    fn lock_state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
