use super::locks::SourceLocks;
use super::scheduler::EmergencyTrigger;
use crate::config::SettingsStore;
use crate::metrics::Metrics;
use crate::models::Source;
use crate::state::{ActiveSourcePointer, StateManager};
use crate::store::{StoreError, StoreManager};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("Store for {source_id} is corrupted: {source}")]
    StoreCorrupted {
        source_id: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("Could not close store for {source_id}, deletion skipped: {source}")]
    CloseFailed {
        source_id: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("Failed to delete store for {source_id}: {source}")]
    DeleteFailed {
        source_id: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("Failed to persist recovery state for {source_id}: {message}")]
    Persist {
        source_id: &'static str,
        message: String,
    },
}

/// How a health check ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// The probe succeeded; nothing was touched.
    Healthy,
    /// The store was deleted and an emergency resync requested (or left pending).
    Recovered,
    /// A static source lost its store. Needs a reinstall.
    Fatal,
}

/// Detects an unusable local store and resets it.
///
/// # Recovery sequence
///
/// 1. Close the open handle. Deletion never runs while a handle is open.
/// 2. Delete the backing storage.
/// 3. Zero the source's last sync time and persist the emergency resync flag.
///    This step runs even when 1 or 2 failed.
/// 4. Request an emergency resync (network sources) or raise the fatal flag
///    (static sources).
pub struct RecoveryManager {
    stores: Arc<StoreManager>,
    settings: Arc<dyn SettingsStore>,
    active: Arc<ActiveSourcePointer>,
    locks: Arc<SourceLocks>,
    emergency: EmergencyTrigger,
    state: StateManager,
    metrics: Arc<Metrics>,
    /// Sources whose emergency resync has been requested but not yet completed
    awaiting_resync: Mutex<HashSet<&'static str>>,
}

impl RecoveryManager {
    pub fn new(
        stores: Arc<StoreManager>,
        settings: Arc<dyn SettingsStore>,
        active: Arc<ActiveSourcePointer>,
        locks: Arc<SourceLocks>,
        emergency: EmergencyTrigger,
        state: StateManager,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            stores,
            settings,
            active,
            locks,
            emergency,
            state,
            metrics,
            awaiting_resync: Mutex::new(HashSet::new()),
        }
    }

    /// Probe the store of `source`.
    ///
    /// Only the active source is ever opened for probing; an inactive source with no
    /// open handle has nothing to check and is reported healthy.
    pub fn check_health(&self, source: &'static Source) -> Result<(), RecoveryError> {
        if !self.active.is_active(source) && !self.stores.is_open_for(source) {
            tracing::debug!("No open store for inactive {}, skipping probe", source.id);
            return Ok(());
        }

        match self.stores.with_handle(source, |handle| handle.probe()) {
            Ok(count) => {
                tracing::debug!("Store for {} is healthy ({} movies)", source.id, count);
                Ok(())
            }
            Err(StoreError::HandleOpen { open, .. }) => {
                tracing::debug!("Store for {} is open, not probing {}", open, source.id);
                Ok(())
            }
            Err(e) => {
                tracing::error!("Health probe for {} failed: {}", source.id, e);
                Err(RecoveryError::StoreCorrupted {
                    source_id: source.id,
                    source: e,
                })
            }
        }
    }

    /// Health check after a failed merge; recovers only if the probe fails too.
    pub async fn on_storage_failure(&self, source: &'static Source) -> Result<RecoveryOutcome, RecoveryError> {
        let probe = {
            let _guard = self.locks.lock(source.id).await;
            self.check_health(source)
        };
        match probe {
            Ok(()) => {
                tracing::info!("Storage failure on {} was not a corruption", source.id);
                Ok(RecoveryOutcome::Healthy)
            }
            Err(e) => {
                tracing::warn!("{}; starting recovery", e);
                self.recover(source).await
            }
        }
    }

    /// Entry point for read paths that hit a storage error.
    pub async fn report_access_failure(
        &self,
        source: &'static Source,
        error: &StoreError,
    ) -> Result<RecoveryOutcome, RecoveryError> {
        tracing::warn!("Read from {} failed: {}", source.id, error);
        self.on_storage_failure(source).await
    }

    /// Close, delete, flag, and resync (or go fatal).
    pub async fn recover(&self, source: &'static Source) -> Result<RecoveryOutcome, RecoveryError> {
        self.state.recovery_started(source.id);
        let _guard = self.locks.lock(source.id).await;
        tracing::warn!("Recovering store for {}", source.id);

        let mut first_error = None;

        // Close before anything touches the files.
        let closed = if self.stores.is_open_for(source) {
            match self.stores.close() {
                Ok(_) => true,
                Err(e) => {
                    tracing::error!("Closing store for {} failed: {}", source.id, e);
                    first_error = Some(RecoveryError::CloseFailed {
                        source_id: source.id,
                        source: e,
                    });
                    false
                }
            }
        } else {
            true
        };

        let deleted = closed
            && match self.stores.delete(source) {
                Ok(()) => true,
                Err(e) => {
                    tracing::error!("Deleting store for {} failed: {}", source.id, e);
                    first_error.get_or_insert(RecoveryError::DeleteFailed {
                        source_id: source.id,
                        source: e,
                    });
                    false
                }
            };

        // Persist the intent before anything else can go wrong.
        if let Err(e) = self.settings.mark_emergency_resync(source.id) {
            tracing::error!("Failed to persist emergency resync for {}: {:#}", source.id, e);
            first_error.get_or_insert(RecoveryError::Persist {
                source_id: source.id,
                message: format!("{:#}", e),
            });
        }
        self.state.set_emergency_pending(true);

        let outcome = if source.supports_network_sync() {
            if deleted {
                self.request_resync(source);
            } else {
                tracing::error!(
                    "Store for {} was not reset; emergency resync left pending for the next start",
                    source.id
                );
            }
            RecoveryOutcome::Recovered
        } else {
            self.go_fatal(source, &mut first_error);
            RecoveryOutcome::Fatal
        };

        self.metrics.record_recovery(outcome == RecoveryOutcome::Fatal);
        self.state.recovery_finished(source.id);

        match first_error {
            Some(e) => Err(e),
            None => {
                tracing::info!("Recovery of {} finished: {:?}", source.id, outcome);
                Ok(outcome)
            }
        }
    }

    fn request_resync(&self, source: &'static Source) {
        let repeated = !self
            .awaiting_resync
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(source.id);
        if repeated {
            // The emergency resync itself hit a corrupted store again.
            tracing::error!(
                "Emergency resync of {} failed on storage again; leaving it pending for the next start",
                source.id
            );
            return;
        }

        if self.emergency.request(source) {
            tracing::info!("Emergency resync requested for {}", source.id);
        } else {
            tracing::warn!(
                "Dispatcher unavailable; emergency resync of {} stays pending",
                source.id
            );
        }
    }

    fn go_fatal(&self, source: &'static Source, first_error: &mut Option<RecoveryError>) {
        let message = format!(
            "Store for static source {} was destroyed and cannot be rebuilt from the network; reinstall required",
            source.id
        );
        tracing::error!("{}", message);

        if let Err(e) = self.settings.set_fatal(&message) {
            tracing::error!("Failed to persist fatal flag: {:#}", e);
            first_error.get_or_insert(RecoveryError::Persist {
                source_id: source.id,
                message: format!("{:#}", e),
            });
        }
        self.state.set_fatal(message);
    }

    /// A run for `source` ended without a storage failure; a later corruption may
    /// request a fresh emergency resync.
    pub fn resync_finished(&self, source: &Source) {
        self.awaiting_resync
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(source.id);
    }
}
