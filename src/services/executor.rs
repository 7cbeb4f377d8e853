use super::fetcher::CatalogFetcher;
use super::locks::SourceLocks;
use crate::config::SettingsStore;
use crate::metrics::Metrics;
use crate::models::{ErrorKind, Source, SyncJob, SyncTrigger};
use crate::state::{ActiveSourcePointer, StateManager};
use crate::store::{StoreError, StoreManager};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;

/// Resolves once `cancel` reads `true`. Never resolves if the sender is gone.
pub(crate) async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Runs one sync job for one source: fetch, then upsert-merge into the local store.
///
/// Every call to [`run`](Self::run) returns a job in a terminal state.
/// The executor never escalates storage failures itself; the scheduler does that
/// once the run is no longer in flight.
pub struct SyncExecutor {
    fetcher: Arc<dyn CatalogFetcher>,
    stores: Arc<StoreManager>,
    settings: Arc<dyn SettingsStore>,
    active: Arc<ActiveSourcePointer>,
    locks: Arc<SourceLocks>,
    state: StateManager,
    metrics: Arc<Metrics>,
}

impl SyncExecutor {
    pub fn new(
        fetcher: Arc<dyn CatalogFetcher>,
        stores: Arc<StoreManager>,
        settings: Arc<dyn SettingsStore>,
        active: Arc<ActiveSourcePointer>,
        locks: Arc<SourceLocks>,
        state: StateManager,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            fetcher,
            stores,
            settings,
            active,
            locks,
            state,
            metrics,
        }
    }

    pub async fn run(
        &self,
        source: &'static Source,
        trigger: SyncTrigger,
        mut cancel: watch::Receiver<bool>,
    ) -> SyncJob {
        let mut job = SyncJob::pending(source.id, trigger);
        job.start();
        self.state.job_started(&job);
        tracing::info!("Starting {} sync for {}", trigger, source.id);

        match self.execute(&mut job, source, &mut cancel).await {
            Ok(()) => {}
            Err((kind, message)) => {
                job.fail(kind, message);
            }
        }

        self.finish(job)
    }

    async fn execute(
        &self,
        job: &mut SyncJob,
        source: &'static Source,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), (ErrorKind, String)> {
        if !source.supports_network_sync() {
            return Err((
                ErrorKind::UnsupportedOperation,
                format!("{} cannot be synced over the network", source.id),
            ));
        }
        if !self.active.is_active(source) {
            return Err((
                ErrorKind::SourceInactive,
                format!("{} is not the active source", source.id),
            ));
        }
        if *cancel.borrow() {
            return Err((ErrorKind::Cancelled, "cancelled before fetch".to_string()));
        }

        let fetched = tokio::select! {
            result = self.fetcher.fetch(source) => result,
            _ = cancelled(cancel) => {
                return Err((ErrorKind::Cancelled, "cancelled during fetch".to_string()));
            }
        };
        let snapshot = fetched.map_err(|e| {
            tracing::warn!("Fetch for {} failed: {}", source.id, e);
            (e.kind(), e.to_string())
        })?;
        tracing::debug!("Fetched {} entities for {}", snapshot.len(), source.id);

        let _guard = self.locks.lock(source.id).await;

        // Switching or shutdown may have happened while waiting for the lock.
        if *cancel.borrow() {
            return Err((ErrorKind::Cancelled, "cancelled before merge".to_string()));
        }
        if !self.active.is_active(source) {
            return Err((
                ErrorKind::Cancelled,
                format!("{} was switched away from before merge", source.id),
            ));
        }

        let now_ms = Utc::now().timestamp_millis();
        let stores = Arc::clone(&self.stores);
        let merged = tokio::task::spawn_blocking(move || {
            stores.with_handle(source, |handle| handle.merge(&snapshot, now_ms))
        })
        .await;

        let stats = match merged {
            Ok(Ok(stats)) => stats,
            Ok(Err(e)) => return Err(storage_failure(source, &e)),
            Err(join_error) => {
                tracing::error!("Merge task for {} aborted: {}", source.id, join_error);
                return Err((ErrorKind::StorageError, join_error.to_string()));
            }
        };

        job.succeed(stats);

        if let Err(e) = self.settings.record_sync_success(source.id, now_ms) {
            tracing::error!("Failed to persist last sync time for {}: {:#}", source.id, e);
        }
        if self.state.read(|s| s.emergency_pending) || self.settings.snapshot().emergency_resync_pending {
            match self.settings.clear_emergency_resync() {
                Ok(()) => {
                    self.state.set_emergency_pending(false);
                    tracing::info!("Emergency resync of {} completed", source.id);
                }
                Err(e) => tracing::error!("Failed to clear emergency resync flag: {:#}", e),
            }
        }

        Ok(())
    }

    fn finish(&self, job: SyncJob) -> SyncJob {
        match (&job.error_kind, job.merge_stats) {
            (None, Some(stats)) => tracing::info!(
                "{} sync for {} succeeded: {}",
                job.trigger,
                job.source_id,
                stats.summary()
            ),
            (Some(ErrorKind::StorageError), _) => tracing::error!(
                "{} sync for {} failed with a storage error: {}",
                job.trigger,
                job.source_id,
                job.error_message.as_deref().unwrap_or_default()
            ),
            (Some(kind), _) => tracing::warn!(
                "{} sync for {} failed ({}): {}",
                job.trigger,
                job.source_id,
                kind,
                job.error_message.as_deref().unwrap_or_default()
            ),
            (None, None) => {}
        }

        self.metrics.record_job(&job);
        self.state.job_finished(&job);
        job
    }
}

fn storage_failure(source: &Source, e: &StoreError) -> (ErrorKind, String) {
    tracing::error!("Merge into {} failed: {}", source.id, e);
    (ErrorKind::StorageError, e.to_string())
}
