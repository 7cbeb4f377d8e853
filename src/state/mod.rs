// State management module
//
// StateManager wraps SyncState with thread-safe access using Arc<RwLock<T>> and
// emits change events for whoever presents sync status. ActiveSourcePointer is the
// process-wide active source selection.

use crate::models::{ErrorKind, JobState, Source, SyncJob, SyncTrigger};
use indexmap::{IndexMap, IndexSet};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

/// Change events emitted when sync state is modified
///
/// Subscribers learn about job progress, recovery and source switches without
/// polling. The core never depends on who is listening.
#[derive(Clone, Debug, PartialEq)]
pub enum StateChange {
    /// A run for a source has started
    JobStarted {
        source_id: &'static str,
        trigger: SyncTrigger,
    },

    /// A run reached its terminal state
    JobFinished {
        source_id: &'static str,
        state: JobState,
        error_kind: Option<ErrorKind>,
    },

    /// A successful run brought in titles or episodes that were not stored before
    NewContent {
        source_id: &'static str,
        new_titles: usize,
        new_episodes: usize,
    },

    RecoveryStarted {
        source_id: &'static str,
    },

    RecoveryCompleted {
        source_id: &'static str,
    },

    /// The engine cannot continue without a reinstall
    FatalError {
        message: String,
    },

    /// The active source changed. Every in-memory projection of the old catalog is stale.
    SourceSwitched {
        from: &'static str,
        to: &'static str,
        restart_required: bool,
    },

    /// A recurring timer was installed (`Some(minutes)`) or removed (`None`)
    ScheduleChanged {
        source_id: &'static str,
        interval_minutes: Option<u32>,
    },

    EmergencyPendingChanged {
        pending: bool,
    },
}

/// Snapshot of everything the engine reports about itself.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncState {
    pub active_source_id: &'static str,

    /// Latest job per source. No history beyond the most recent attempt is kept.
    pub latest_jobs: IndexMap<&'static str, SyncJob>,

    /// Sources with a run in flight
    pub running: IndexSet<&'static str>,

    /// Sources currently going through recovery
    pub recovering: IndexSet<&'static str>,

    /// Normalized interval of the installed timer per source
    pub schedules: IndexMap<&'static str, u32>,

    pub emergency_pending: bool,

    /// Set once recovery hit a dead end. Normal use must stop while this is `Some`.
    pub fatal: Option<String>,
}

impl SyncState {
    pub fn new(active_source_id: &'static str) -> Self {
        Self {
            active_source_id,
            latest_jobs: IndexMap::new(),
            running: IndexSet::new(),
            recovering: IndexSet::new(),
            schedules: IndexMap::new(),
            emergency_pending: false,
            fatal: None,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal.is_some()
    }

    pub fn is_running(&self, source_id: &str) -> bool {
        self.running.contains(source_id)
    }

    pub fn latest_job(&self, source_id: &str) -> Option<&SyncJob> {
        self.latest_jobs.get(source_id)
    }
}

/// Thread-safe state manager with event emission
///
/// - [`read()`](Self::read) for reading state
/// - [`update()`](Self::update) for mutations with automatic event emission
/// - [`subscribe()`](Self::subscribe) for listening to state changes
pub struct StateManager {
    state: Arc<RwLock<SyncState>>,

    /// Broadcast channel for emitting state change events
    state_tx: broadcast::Sender<StateChange>,
}

impl StateManager {
    /// Create a new StateManager with a broadcast buffer of 100 events
    pub fn new(active_source_id: &'static str) -> Self {
        let (state_tx, _) = broadcast::channel(100);
        Self {
            state: Arc::new(RwLock::new(SyncState::new(active_source_id))),
            state_tx,
        }
    }

    /// Clone of the current state, safe to use without holding locks.
    pub fn snapshot(&self) -> SyncState {
        self.state.read().unwrap().clone()
    }

    pub fn read<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&SyncState) -> R,
    {
        let state = self.state.read().unwrap();
        f(&state)
    }

    /// Update the state and emit change events
    ///
    /// Captures the old state, applies `update_fn`, diffs old and new,
    /// and broadcasts one event per detected change.
    ///
    /// # Returns
    /// The events that were emitted
    pub fn update<F>(&self, update_fn: F) -> Vec<StateChange>
    where
        F: FnOnce(&mut SyncState),
    {
        let mut state = self.state.write().unwrap();
        let old_state = state.clone();

        update_fn(&mut state);

        let changes = self.detect_changes(&old_state, &state);

        for change in &changes {
            // Ignore send errors - it's OK if no one is listening
            let _ = self.state_tx.send(change.clone());
        }

        changes
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.state_tx.subscribe()
    }

    fn detect_changes(&self, old: &SyncState, new: &SyncState) -> Vec<StateChange> {
        let mut changes = Vec::new();

        if old.active_source_id != new.active_source_id {
            changes.push(StateChange::SourceSwitched {
                from: old.active_source_id,
                to: new.active_source_id,
                restart_required: true,
            });
        }

        for source_id in new.running.difference(&old.running) {
            let trigger = new
                .latest_jobs
                .get(source_id)
                .map(|job| job.trigger)
                .unwrap_or(SyncTrigger::Manual);
            changes.push(StateChange::JobStarted {
                source_id: *source_id,
                trigger,
            });
        }

        // A job is reported once, when it first shows up in a terminal state.
        for (source_id, job) in &new.latest_jobs {
            if !job.is_terminal() || old.latest_jobs.get(source_id) == Some(job) {
                continue;
            }
            changes.push(StateChange::JobFinished {
                source_id: *source_id,
                state: job.state,
                error_kind: job.error_kind,
            });
            if let Some(stats) = job.merge_stats.filter(|s| s.has_new_content()) {
                changes.push(StateChange::NewContent {
                    source_id: *source_id,
                    new_titles: stats.new_titles(),
                    new_episodes: stats.episodes_inserted,
                });
            }
        }

        for source_id in new.recovering.difference(&old.recovering) {
            changes.push(StateChange::RecoveryStarted {
                source_id: *source_id,
            });
        }
        for source_id in old.recovering.difference(&new.recovering) {
            changes.push(StateChange::RecoveryCompleted {
                source_id: *source_id,
            });
        }

        for source in crate::registry::all() {
            let (before, after) = (old.schedules.get(source.id), new.schedules.get(source.id));
            if before != after {
                changes.push(StateChange::ScheduleChanged {
                    source_id: source.id,
                    interval_minutes: after.copied(),
                });
            }
        }

        if old.emergency_pending != new.emergency_pending {
            changes.push(StateChange::EmergencyPendingChanged {
                pending: new.emergency_pending,
            });
        }

        if old.fatal.is_none() {
            if let Some(message) = &new.fatal {
                changes.push(StateChange::FatalError {
                    message: message.clone(),
                });
            }
        }

        changes
    }

    // Convenience methods for common state updates

    /// Record that `job` is now running
    pub fn job_started(&self, job: &SyncJob) -> Vec<StateChange> {
        self.update(|state| {
            state.latest_jobs.insert(job.source_id, job.clone());
            state.running.insert(job.source_id);
        })
    }

    /// Record the terminal state of `job`
    pub fn job_finished(&self, job: &SyncJob) -> Vec<StateChange> {
        self.update(|state| {
            state.running.shift_remove(job.source_id);
            state.latest_jobs.insert(job.source_id, job.clone());
        })
    }

    pub fn recovery_started(&self, source_id: &'static str) -> Vec<StateChange> {
        self.update(|state| {
            state.recovering.insert(source_id);
        })
    }

    pub fn recovery_finished(&self, source_id: &'static str) -> Vec<StateChange> {
        self.update(|state| {
            state.recovering.shift_remove(source_id);
        })
    }

    pub fn set_schedule(&self, source_id: &'static str, interval: Option<u32>) -> Vec<StateChange> {
        self.update(|state| match interval {
            Some(minutes) => {
                state.schedules.insert(source_id, minutes);
            }
            None => {
                state.schedules.shift_remove(source_id);
            }
        })
    }

    pub fn set_emergency_pending(&self, pending: bool) -> Vec<StateChange> {
        self.update(|state| state.emergency_pending = pending)
    }

    /// Raise the fatal flag. Only the first message is kept.
    pub fn set_fatal(&self, message: impl Into<String>) -> Vec<StateChange> {
        let message = message.into();
        self.update(|state| {
            if state.fatal.is_none() {
                state.fatal = Some(message);
            }
        })
    }

    pub(crate) fn set_active_source(&self, source_id: &'static str) -> Vec<StateChange> {
        self.update(|state| state.active_source_id = source_id)
    }
}

impl Clone for StateManager {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            state_tx: self.state_tx.clone(),
        }
    }
}

/// Process-wide pointer to the selected source.
///
/// Readers always see a whole `&'static Source`; the pointer is never empty once
/// constructed. Only the switch coordinator writes it.
#[derive(Debug)]
pub struct ActiveSourcePointer {
    current: RwLock<&'static Source>,
}

impl ActiveSourcePointer {
    pub fn new(source: &'static Source) -> Self {
        Self {
            current: RwLock::new(source),
        }
    }

    pub fn get(&self) -> &'static Source {
        *self.current.read().unwrap()
    }

    pub fn is_active(&self, source: &Source) -> bool {
        self.get().id == source.id
    }

    pub(crate) fn set(&self, source: &'static Source) {
        *self.current.write().unwrap() = source;
    }
}
