// catalog-sync - background mirror of remote content catalogs
//
// This is the library crate containing the sync engine and its data structures.
// The binary crate (main.rs) provides the command-line entry point.

pub mod config;
pub mod engine;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod registry;
pub mod services;
pub mod state;
pub mod store;

// Re-export commonly used types for convenience
pub use config::{ConfigManager, SettingsStore};
pub use engine::{EngineParts, SyncEngine};
pub use models::{
    AppSettings, CatalogSnapshot, ErrorKind, JobState, MergeStats, PersistedState, Source,
    SyncCapability, SyncConfig, SyncJob, SyncTrigger,
};
pub use state::{ActiveSourcePointer, StateChange, StateManager, SyncState};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
