//! Recurring and on-demand sync scheduling.
//!
//! # Components
//!
//! - [`SyncScheduler`]: owns one recurring timer slot per network-synced source,
//!   coalesces concurrent triggers for the same source into one run, and hands
//!   storage failures to recovery once a run has left flight
//! - [`HostJobScheduler`]: the host facility that actually keeps timers;
//!   [`TokioHostScheduler`] implements it on `tokio::time`
//! - [`EmergencyTrigger`]: cloneable handle recovery uses to request an
//!   emergency resync without holding the scheduler
//!
//! # Timing
//!
//! User intervals are kept as entered and normalized on every reschedule with
//! [`normalize_interval`] and [`flex_for`]. Both are idempotent.

use super::executor::SyncExecutor;
use super::recovery::RecoveryManager;
use crate::metrics::Metrics;
use crate::models::{ErrorKind, Source, SyncConfig, SyncJob, SyncTrigger};
use crate::registry;
use crate::state::{ActiveSourcePointer, StateManager};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("Source {0} does not support network sync")]
    UnsupportedOperation(&'static str),
}

/// Parameters handed to the host for one recurring job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobSpec {
    pub min_interval_minutes: u32,
    pub flex_minutes: u32,
    pub network_required: bool,
    pub requires_charging: bool,
}

impl JobSpec {
    pub fn periodic(min_interval_minutes: u32, flex_minutes: u32) -> Self {
        Self {
            min_interval_minutes,
            flex_minutes,
            network_required: true,
            requires_charging: false,
        }
    }
}

/// Host timer facility.
///
/// Installing a timer cannot fail. `enqueue_periodic` replaces any job already
/// registered under the same name.
pub trait HostJobScheduler: Send + Sync {
    fn enqueue_periodic(&self, unique_name: &str, spec: JobSpec, source_id: &'static str);

    fn cancel(&self, unique_name: &str);

    fn cancel_all(&self);
}

/// Work the dispatcher loop runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchRequest {
    Periodic { source_id: &'static str },
    Emergency { source_id: &'static str },
}

pub type DispatchSender = mpsc::UnboundedSender<DispatchRequest>;
pub type DispatchReceiver = mpsc::UnboundedReceiver<DispatchRequest>;

pub fn dispatch_channel() -> (DispatchSender, DispatchReceiver) {
    mpsc::unbounded_channel()
}

/// Handle for requesting an emergency resync through the dispatcher.
#[derive(Debug, Clone)]
pub struct EmergencyTrigger {
    tx: DispatchSender,
}

impl EmergencyTrigger {
    pub fn new(tx: DispatchSender) -> Self {
        Self { tx }
    }

    /// Returns `false` if the dispatcher is gone; the persisted flag then carries
    /// the request to the next start.
    pub fn request(&self, source: &'static Source) -> bool {
        self.tx
            .send(DispatchRequest::Emergency {
                source_id: source.id,
            })
            .is_ok()
    }
}

/// Interval handed to the host, or `None` for manual-only (0).
pub fn normalize_interval(minutes: u32, floor_minutes: u32) -> Option<u32> {
    match minutes {
        0 => None,
        m => Some(m.max(floor_minutes)),
    }
}

/// One third of the interval, never below `floor_minutes`.
pub fn flex_for(interval_minutes: u32, floor_minutes: u32) -> u32 {
    (interval_minutes / 3).max(floor_minutes)
}

/// Platform-imposed lower bounds for recurring work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleFloors {
    pub min_interval_minutes: u32,
    pub min_flex_minutes: u32,
}

impl Default for ScheduleFloors {
    fn default() -> Self {
        Self {
            min_interval_minutes: 15,
            min_flex_minutes: 5,
        }
    }
}

struct InFlight {
    result: watch::Receiver<Option<SyncJob>>,
    cancel: watch::Sender<bool>,
}

type InFlightMap = Arc<Mutex<HashMap<&'static str, InFlight>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes a source's in-flight slot when the run task ends, even by panic.
struct SlotGuard {
    in_flight: InFlightMap,
    source_id: &'static str,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        lock(&self.in_flight).remove(self.source_id);
    }
}

pub struct SyncScheduler {
    executor: Arc<SyncExecutor>,
    recovery: Arc<RecoveryManager>,
    host: Arc<dyn HostJobScheduler>,
    active: Arc<ActiveSourcePointer>,
    state: StateManager,
    metrics: Arc<Metrics>,
    floors: ScheduleFloors,
    in_flight: InFlightMap,
    /// `(source, raw interval)` pairs already warned about
    normalization_warned: Mutex<HashSet<(&'static str, u32)>>,
    shutdown_tx: watch::Sender<bool>,
}

impl SyncScheduler {
    pub fn new(
        executor: Arc<SyncExecutor>,
        recovery: Arc<RecoveryManager>,
        host: Arc<dyn HostJobScheduler>,
        active: Arc<ActiveSourcePointer>,
        state: StateManager,
        metrics: Arc<Metrics>,
        floors: ScheduleFloors,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            executor,
            recovery,
            host,
            active,
            state,
            metrics,
            floors,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            normalization_warned: Mutex::new(HashSet::new()),
            shutdown_tx,
        }
    }

    pub fn floors(&self) -> ScheduleFloors {
        self.floors
    }

    /// Replace the recurring timer of `source` according to `config`.
    ///
    /// Always cancels first. Installs nothing for static sources, disabled
    /// configs, or a zero interval.
    pub fn reschedule(&self, source: &'static Source, config: &SyncConfig) {
        let name = source.job_name();
        self.host.cancel(&name);

        if !source.supports_network_sync() {
            tracing::debug!("{} is static-only, no recurring sync", source.id);
            self.state.set_schedule(source.id, None);
            return;
        }

        let interval = if config.enabled {
            normalize_interval(config.interval_minutes, self.floors.min_interval_minutes)
        } else {
            None
        };

        let Some(interval) = interval else {
            tracing::info!(
                "Recurring sync for {} off (enabled={}, interval={}m)",
                source.id,
                config.enabled,
                config.interval_minutes
            );
            self.state.set_schedule(source.id, None);
            return;
        };

        if interval != config.interval_minutes {
            let first_time = lock(&self.normalization_warned).insert((source.id, config.interval_minutes));
            if first_time {
                tracing::warn!(
                    "Sync interval {}m for {} is below the {}m minimum, using {}m",
                    config.interval_minutes,
                    source.id,
                    self.floors.min_interval_minutes,
                    interval
                );
            }
        }

        let flex = flex_for(interval, self.floors.min_flex_minutes);
        self.host
            .enqueue_periodic(&name, JobSpec::periodic(interval, flex), source.id);
        self.state.set_schedule(source.id, Some(interval));
        tracing::info!(
            "Scheduled {} every {}m (flex {}m)",
            source.id,
            interval,
            flex
        );
    }

    pub async fn trigger_manual(&self, source: &'static Source) -> Result<SyncJob, SchedulerError> {
        if !source.supports_network_sync() {
            return Err(SchedulerError::UnsupportedOperation(source.id));
        }
        Ok(self.run(source, SyncTrigger::Manual).await)
    }

    /// Like [`trigger_manual`](Self::trigger_manual), marked as an emergency.
    /// Still coalesces with an in-flight run for the same source.
    pub async fn trigger_emergency(&self, source: &'static Source) -> Result<SyncJob, SchedulerError> {
        if !source.supports_network_sync() {
            return Err(SchedulerError::UnsupportedOperation(source.id));
        }
        self.metrics.record_emergency_trigger();
        Ok(self.run(source, SyncTrigger::Emergency).await)
    }

    /// Run `source` now, or join the run already in flight for it.
    ///
    /// All callers that coalesce into one run receive the same job.
    pub async fn run(&self, source: &'static Source, trigger: SyncTrigger) -> SyncJob {
        let mut result = self.join_or_start(source, trigger);
        let outcome = result.wait_for(Option::is_some).await.ok().and_then(|job| job.clone());
        outcome.unwrap_or_else(|| {
            let mut job = SyncJob::pending(source.id, trigger);
            job.start();
            job.fail(ErrorKind::Cancelled, "run ended without reporting a result");
            job
        })
    }

    fn join_or_start(
        &self,
        source: &'static Source,
        trigger: SyncTrigger,
    ) -> watch::Receiver<Option<SyncJob>> {
        let mut in_flight = lock(&self.in_flight);
        if let Some(existing) = in_flight.get(source.id) {
            tracing::debug!("{} request for {} joins the run in flight", trigger, source.id);
            self.metrics.record_coalesced();
            return existing.result.clone();
        }

        let (result_tx, result_rx) = watch::channel(None);
        let (cancel_tx, cancel_rx) = watch::channel(*self.shutdown_tx.borrow());
        in_flight.insert(
            source.id,
            InFlight {
                result: result_rx.clone(),
                cancel: cancel_tx,
            },
        );

        let slot = SlotGuard {
            in_flight: Arc::clone(&self.in_flight),
            source_id: source.id,
        };
        let executor = Arc::clone(&self.executor);
        let recovery = Arc::clone(&self.recovery);
        tokio::spawn(async move {
            let job = executor.run(source, trigger, cancel_rx).await;
            // Free the slot first so an emergency resync raised by recovery starts a new run.
            drop(slot);

            if job.error_kind == Some(ErrorKind::StorageError) {
                match recovery.on_storage_failure(source).await {
                    Ok(outcome) => tracing::info!("Recovery check for {}: {:?}", source.id, outcome),
                    Err(e) => tracing::error!("Recovery of {} failed: {}", source.id, e),
                }
            } else {
                recovery.resync_finished(source);
            }

            let _ = result_tx.send(Some(job));
        });

        result_rx
    }

    pub fn is_in_flight(&self, source: &Source) -> bool {
        lock(&self.in_flight).contains_key(source.id)
    }

    /// Fire the cancellation of the run in flight for `source`, if any.
    pub fn cancel(&self, source: &Source) -> bool {
        match lock(&self.in_flight).get(source.id) {
            Some(run) => {
                tracing::info!("Cancelling in-flight sync for {}", source.id);
                run.cancel.send_replace(true);
                true
            }
            None => false,
        }
    }

    /// Wait until `source` has no run in flight.
    pub async fn wait_idle_for(&self, source: &Source) {
        let pending = lock(&self.in_flight).get(source.id).map(|run| run.result.clone());
        if let Some(mut result) = pending {
            let _ = result.wait_for(Option::is_some).await;
        }
    }

    /// Wait until every run that was in flight when called has finished.
    pub async fn wait_idle(&self) {
        let pending: Vec<_> = lock(&self.in_flight)
            .values()
            .map(|run| run.result.clone())
            .collect();
        for mut result in pending {
            let _ = result.wait_for(Option::is_some).await;
        }
    }

    /// Cancel every timer and every in-flight run. Runs started afterwards begin cancelled.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        self.host.cancel_all();
        for run in lock(&self.in_flight).values() {
            run.cancel.send_replace(true);
        }
        tracing::info!("Scheduler shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Consume periodic ticks and emergency requests until shutdown.
    ///
    /// Every request runs on its own task so one slow source never delays another.
    pub async fn run_dispatcher(self: Arc<Self>, mut requests: DispatchReceiver) {
        let mut shutdown = self.shutdown_tx.subscribe();
        tracing::debug!("Dispatcher started");

        loop {
            let request = tokio::select! {
                request = requests.recv() => request,
                _ = super::executor::cancelled(&mut shutdown) => None,
            };
            let Some(request) = request else {
                break;
            };
            self.dispatch(request);
        }

        tracing::debug!("Dispatcher stopped");
    }

    fn dispatch(self: &Arc<Self>, request: DispatchRequest) {
        let (source_id, trigger) = match request {
            DispatchRequest::Periodic { source_id } => (source_id, SyncTrigger::Periodic),
            DispatchRequest::Emergency { source_id } => (source_id, SyncTrigger::Emergency),
        };
        let source = match registry::by_id(source_id) {
            Ok(source) => source,
            Err(e) => {
                tracing::warn!("Dropping {} request: {}", trigger, e);
                return;
            }
        };

        // Only the active source has an open store; the others refresh once selected.
        if trigger == SyncTrigger::Periodic && !self.active.is_active(source) {
            tracing::debug!("Skipping periodic tick for inactive source {}", source.id);
            return;
        }

        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let result = match trigger {
                SyncTrigger::Emergency => scheduler.trigger_emergency(source).await,
                _ => Ok(scheduler.run(source, trigger).await),
            };
            if let Err(e) = result {
                tracing::warn!("{} request for {} rejected: {}", trigger, source.id, e);
            }
        });
    }
}

/// [`HostJobScheduler`] on `tokio::time`: one interval task per job name,
/// each tick delivered to the dispatcher.
///
/// The first tick fires one full interval after enqueueing. Flex is recorded but
/// this host always fires at the start of the window.
pub struct TokioHostScheduler {
    ticks: DispatchSender,
    minute: Duration,
    jobs: Mutex<HashMap<String, (JobSpec, JoinHandle<()>)>>,
}

impl TokioHostScheduler {
    pub fn new(ticks: DispatchSender) -> Self {
        Self::with_minute(ticks, Duration::from_secs(60))
    }

    /// Use `minute` as the length of one scheduling minute.
    pub fn with_minute(ticks: DispatchSender, minute: Duration) -> Self {
        Self {
            ticks,
            minute,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn spec(&self, unique_name: &str) -> Option<JobSpec> {
        lock(&self.jobs).get(unique_name).map(|(spec, _)| *spec)
    }

    pub fn job_count(&self) -> usize {
        lock(&self.jobs).len()
    }
}

impl HostJobScheduler for TokioHostScheduler {
    fn enqueue_periodic(&self, unique_name: &str, spec: JobSpec, source_id: &'static str) {
        let period = self.minute * spec.min_interval_minutes.max(1);
        let ticks = self.ticks.clone();

        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval_at(Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                timer.tick().await;
                if ticks.send(DispatchRequest::Periodic { source_id }).is_err() {
                    break;
                }
            }
        });

        if let Some((_, previous)) = lock(&self.jobs).insert(unique_name.to_string(), (spec, handle)) {
            previous.abort();
        }
        tracing::debug!("Host job {} enqueued: {:?}", unique_name, spec);
    }

    fn cancel(&self, unique_name: &str) {
        if let Some((_, handle)) = lock(&self.jobs).remove(unique_name) {
            handle.abort();
            tracing::debug!("Host job {} cancelled", unique_name);
        }
    }

    fn cancel_all(&self) {
        for (_, (_, handle)) in lock(&self.jobs).drain() {
            handle.abort();
        }
    }
}

impl Drop for TokioHostScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
