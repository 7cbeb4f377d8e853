//! Application-lifetime context.
//!
//! [`SyncEngine`] is the composition root: it owns the store manager, the active
//! source pointer and every service, and is the only thing callers hold.

use crate::config::SettingsStore;
use crate::metrics::Metrics;
use crate::models::{AppSettings, Source, SyncJob};
use crate::registry;
use crate::services::{
    CatalogFetcher, DispatchReceiver, EmergencyTrigger, HostJobScheduler, RecoveryManager,
    RecoveryOutcome, ScheduleFloors, SchedulerError, SourceLocks, SourceSwitchCoordinator,
    SyncExecutor, SyncScheduler, TokioHostScheduler, dispatch_channel,
};
use crate::state::{ActiveSourcePointer, StateChange, StateManager, SyncState};
use crate::store::{StoreBackend, StoreError, StoreHandle, StoreManager};
use anyhow::{Context, Result, bail};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};

impl From<&AppSettings> for ScheduleFloors {
    fn from(settings: &AppSettings) -> Self {
        Self {
            min_interval_minutes: settings.min_interval_minutes,
            min_flex_minutes: settings.min_flex_minutes,
        }
    }
}

/// Collaborators the engine is assembled from.
pub struct EngineParts {
    pub settings: Arc<dyn SettingsStore>,
    pub fetcher: Arc<dyn CatalogFetcher>,
    pub backend: Arc<dyn StoreBackend>,
    pub floors: ScheduleFloors,
    /// Host timer facility. `None` uses a [`TokioHostScheduler`].
    pub host: Option<Arc<dyn HostJobScheduler>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct SyncEngine {
    settings: Arc<dyn SettingsStore>,
    stores: Arc<StoreManager>,
    active: Arc<ActiveSourcePointer>,
    state: StateManager,
    metrics: Arc<Metrics>,
    recovery: Arc<RecoveryManager>,
    scheduler: Arc<SyncScheduler>,
    switcher: SourceSwitchCoordinator,
    emergency: EmergencyTrigger,
    dispatch_rx: Mutex<Option<DispatchReceiver>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl SyncEngine {
    pub fn new(parts: EngineParts) -> Self {
        let EngineParts {
            settings,
            fetcher,
            backend,
            floors,
            host,
        } = parts;

        let persisted = settings.snapshot();
        let initial = registry::resolve_or_default(persisted.active_source_id.as_deref());

        let active = Arc::new(ActiveSourcePointer::new(initial));
        let state = StateManager::new(initial.id);
        let metrics = Arc::new(Metrics::new());
        let stores = Arc::new(StoreManager::new(backend));
        let locks = Arc::new(SourceLocks::new());

        let (dispatch_tx, dispatch_rx) = dispatch_channel();
        let host: Arc<dyn HostJobScheduler> =
            host.unwrap_or_else(|| Arc::new(TokioHostScheduler::new(dispatch_tx.clone())));
        let emergency = EmergencyTrigger::new(dispatch_tx);

        let executor = Arc::new(SyncExecutor::new(
            fetcher,
            Arc::clone(&stores),
            Arc::clone(&settings),
            Arc::clone(&active),
            Arc::clone(&locks),
            state.clone(),
            Arc::clone(&metrics),
        ));
        let recovery = Arc::new(RecoveryManager::new(
            Arc::clone(&stores),
            Arc::clone(&settings),
            Arc::clone(&active),
            Arc::clone(&locks),
            emergency.clone(),
            state.clone(),
            Arc::clone(&metrics),
        ));
        let scheduler = Arc::new(SyncScheduler::new(
            executor,
            Arc::clone(&recovery),
            host,
            Arc::clone(&active),
            state.clone(),
            Arc::clone(&metrics),
            floors,
        ));
        let switcher = SourceSwitchCoordinator::new(
            Arc::clone(&stores),
            Arc::clone(&active),
            Arc::clone(&settings),
            locks,
            Arc::clone(&scheduler),
            state.clone(),
        );

        Self {
            settings,
            stores,
            active,
            state,
            metrics,
            recovery,
            scheduler,
            switcher,
            emergency,
            dispatch_rx: Mutex::new(Some(dispatch_rx)),
            dispatcher: Mutex::new(None),
        }
    }

    /// Open and probe the active store, install every recurring timer, start the
    /// dispatcher, and resume an emergency resync left over from a previous run.
    pub async fn start(&self) -> Result<()> {
        let Some(requests) = lock(&self.dispatch_rx).take() else {
            bail!("engine already started");
        };

        let persisted = self.settings.snapshot();
        let active = self.active.get();
        tracing::info!("Starting sync engine with active source {}", active.id);

        if persisted.fatal_error {
            let reason = persisted
                .fatal_reason
                .clone()
                .unwrap_or_else(|| "fatal error recorded by a previous run".to_string());
            tracing::error!("Fatal condition persisted: {}", reason);
            self.state.set_fatal(reason);
        }
        if persisted.emergency_resync_pending {
            self.state.set_emergency_pending(true);
        }

        let outcome = self.open_active(active).await;

        for source in registry::all() {
            self.scheduler
                .reschedule(source, &self.settings.sync_config(source.id));
        }

        let dispatcher = tokio::spawn(Arc::clone(&self.scheduler).run_dispatcher(requests));
        *lock(&self.dispatcher) = Some(dispatcher);

        if persisted.emergency_resync_pending
            && outcome == RecoveryOutcome::Healthy
            && !self.is_fatal()
            && active.supports_network_sync()
        {
            tracing::info!("Resuming pending emergency resync for {}", active.id);
            self.emergency.request(active);
        }

        Ok(())
    }

    async fn open_active(&self, active: &'static Source) -> RecoveryOutcome {
        let corrupted = match self.stores.open(active) {
            Ok(()) => self.recovery.check_health(active).err().map(|e| e.to_string()),
            Err(e) => Some(e.to_string()),
        };
        let Some(reason) = corrupted else {
            return RecoveryOutcome::Healthy;
        };

        tracing::warn!("Store for {} unusable at startup: {}", active.id, reason);
        match self.recovery.recover(active).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!("Startup recovery of {} incomplete: {}", active.id, e);
                RecoveryOutcome::Recovered
            }
        }
    }

    /// Manual trigger surface. `None` triggers every network-synced source
    /// concurrently; results come back in registry order.
    pub async fn sync_now(&self, source_id: Option<&str>) -> Result<Vec<SyncJob>> {
        if let Some(id) = source_id {
            let source = registry::by_id(id)?;
            let job = self.scheduler.trigger_manual(source).await?;
            return Ok(vec![job]);
        }

        let mut runs = JoinSet::new();
        for source in registry::network_sources() {
            let scheduler = Arc::clone(&self.scheduler);
            runs.spawn(async move { scheduler.trigger_manual(source).await });
        }

        let mut jobs = Vec::new();
        while let Some(joined) = runs.join_next().await {
            let job = joined.context("manual sync task panicked")??;
            jobs.push(job);
        }
        jobs.sort_by_key(|job| registry::all().iter().position(|s| s.id == job.source_id));
        Ok(jobs)
    }

    /// Persist a source's schedule and apply it.
    pub fn update_sync_config(&self, source_id: &str, enabled: bool, interval_minutes: u32) -> Result<()> {
        let source = registry::by_id(source_id)?;
        if !source.supports_network_sync() {
            return Err(SchedulerError::UnsupportedOperation(source.id).into());
        }

        self.settings
            .set_sync_config(source.id, enabled, interval_minutes)
            .with_context(|| format!("Failed to save sync config for {}", source.id))?;
        self.scheduler
            .reschedule(source, &self.settings.sync_config(source.id));
        Ok(())
    }

    /// See [`SourceSwitchCoordinator::switch_to`].
    pub async fn switch_source(&self, source_id: &str) -> Result<bool> {
        let source = registry::by_id(source_id)?;
        Ok(self.switcher.switch_to(source).await)
    }

    /// Run `f` against the active source's store on the blocking pool. A storage
    /// failure is reported to recovery before the error is returned.
    pub async fn query<R, F>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut dyn StoreHandle) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let source = self.active.get();
        let stores = Arc::clone(&self.stores);
        let result = tokio::task::spawn_blocking(move || stores.with_handle(source, f))
            .await
            .unwrap_or_else(|join_error| {
                Err(StoreError::TaskAborted {
                    source_id: source.id.to_string(),
                    message: join_error.to_string(),
                })
            });
        if let Err(e) = &result {
            if e.indicates_corruption() {
                if let Err(recovery_error) = self.recovery.report_access_failure(source, e).await {
                    tracing::error!("{}", recovery_error);
                }
            }
        }
        result
    }

    pub fn active_source(&self) -> &'static Source {
        self.active.get()
    }

    pub fn is_fatal(&self) -> bool {
        self.state.read(|s| s.is_fatal())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.state.subscribe()
    }

    pub fn state(&self) -> SyncState {
        self.state.snapshot()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn scheduler(&self) -> &Arc<SyncScheduler> {
        &self.scheduler
    }

    /// Cancel timers and runs, wait for in-flight runs to end, close the store.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown();
        self.scheduler.wait_idle().await;

        let dispatcher = lock(&self.dispatcher).take();
        if let Some(dispatcher) = dispatcher {
            if let Err(e) = dispatcher.await {
                tracing::warn!("Dispatcher ended abnormally: {}", e);
            }
        }

        match self.stores.close() {
            Ok(Some(source_id)) => tracing::debug!("Closed store for {} on shutdown", source_id),
            Ok(None) => {}
            Err(e) => tracing::warn!("Closing store on shutdown: {}", e),
        }

        self.metrics.log_summary();
    }
}
