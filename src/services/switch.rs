use super::locks::SourceLocks;
use super::scheduler::SyncScheduler;
use crate::config::SettingsStore;
use crate::models::Source;
use crate::state::{ActiveSourcePointer, StateManager};
use crate::store::StoreManager;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Changes the active source.
///
/// A successful switch invalidates every in-memory projection of the old
/// catalog; callers restart their presentation layer when
/// [`switch_to`](Self::switch_to) returns `true`. Stores of inactive sources are
/// kept on disk so switching back is fast.
pub struct SourceSwitchCoordinator {
    stores: Arc<StoreManager>,
    active: Arc<ActiveSourcePointer>,
    settings: Arc<dyn SettingsStore>,
    locks: Arc<SourceLocks>,
    scheduler: Arc<SyncScheduler>,
    state: StateManager,
    critical: Mutex<()>,
}

impl SourceSwitchCoordinator {
    pub fn new(
        stores: Arc<StoreManager>,
        active: Arc<ActiveSourcePointer>,
        settings: Arc<dyn SettingsStore>,
        locks: Arc<SourceLocks>,
        scheduler: Arc<SyncScheduler>,
        state: StateManager,
    ) -> Self {
        Self {
            stores,
            active,
            settings,
            locks,
            scheduler,
            state,
            critical: Mutex::new(()),
        }
    }

    /// Make `target` the active source. All-or-nothing: on `false` the pointer
    /// and the open store are as they were.
    pub async fn switch_to(&self, target: &'static Source) -> bool {
        let _critical = self.critical.lock().await;

        let current = self.active.get();
        if current.id == target.id {
            tracing::debug!("{} is already the active source", target.id);
            return false;
        }

        tracing::info!("Switching source {} -> {}", current.id, target.id);

        // Runs for the old source end Cancelled; runs for the target end
        // SourceInactive before fetching, or wait here on its lock.
        self.scheduler.cancel(current);
        let _locks = self.locks.lock_pair(current.id, target.id).await;

        if let Err(e) = self.stores.close() {
            // The handle is released regardless.
            tracing::warn!("Closing store for {}: {}", current.id, e);
        }

        if let Err(e) = self.stores.open(target) {
            tracing::error!("Cannot open store for {}: {}; staying on {}", target.id, e, current.id);
            if let Err(e) = self.stores.open(current) {
                // Not fatal: the next access reopens it lazily.
                tracing::error!("Reopening store for {} failed: {}", current.id, e);
            }
            return false;
        }

        self.active.set(target);
        self.state.set_active_source(target.id);

        if let Err(e) = self.settings.set_active_source(target.id) {
            tracing::error!(
                "Switched to {} but failed to persist the selection: {:#}",
                target.id,
                e
            );
        }

        tracing::info!("Active source is now {}; presentation restart required", target.id);
        true
    }
}
