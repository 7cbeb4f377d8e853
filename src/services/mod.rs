//! Services module - the sync and store lifecycle logic.
//!
//! Nothing here knows who presents the results; progress is published through
//! [`crate::state::StateManager`].
//!
//! # Components
//!
//! - [`CatalogFetcher`]: produces a [`crate::models::CatalogSnapshot`] for a source.
//!   [`HttpCatalogFetcher`] reads it from a JSON endpoint.
//! - [`SyncExecutor`]: runs one job (fetch, then upsert merge) to a terminal state
//! - [`SyncScheduler`]: recurring timers, manual and emergency triggers, coalescing
//! - [`RecoveryManager`]: health probe and the close/delete/flag/resync sequence
//! - [`SourceSwitchCoordinator`]: all-or-nothing change of the active source
//! - [`SourceLocks`]: per-source run locks shared by merge, recovery and switching
//!
//! # Lock order
//!
//! switch critical section, then run locks (in source id order), then the store slot.

pub mod executor;
pub mod fetcher;
pub mod locks;
pub mod recovery;
pub mod scheduler;
pub mod switch;

pub use executor::SyncExecutor;
pub use fetcher::{CatalogFetcher, FetchError, HttpCatalogFetcher};
pub use locks::SourceLocks;
pub use recovery::{RecoveryError, RecoveryManager, RecoveryOutcome};
pub use scheduler::{
    DispatchReceiver, DispatchRequest, DispatchSender, EmergencyTrigger, HostJobScheduler, JobSpec,
    ScheduleFloors, SchedulerError, SyncScheduler, TokioHostScheduler, dispatch_channel, flex_for,
    normalize_interval,
};
pub use switch::SourceSwitchCoordinator;
