use serde::{Deserialize, Serialize};
use std::fmt;

/// How a source's local store can be (re)built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncCapability {
    /// The remote catalog can be fetched and merged periodically.
    NetworkSync,
    /// The store only ever comes from the bundled seed database.
    StaticOnly,
}

/// Immutable descriptor of a remote content catalog.
///
/// Sources are compile-time constants owned by the [`crate::registry`]; the rest of the
/// crate passes them around as `&'static Source`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Source {
    pub id: &'static str,
    pub display_name: &'static str,
    pub storage_file_name: &'static str,
    pub sync_capability: SyncCapability,
}

impl Source {
    pub const fn new(
        id: &'static str,
        display_name: &'static str,
        storage_file_name: &'static str,
        sync_capability: SyncCapability,
    ) -> Self {
        Self {
            id,
            display_name,
            storage_file_name,
            sync_capability,
        }
    }

    pub fn supports_network_sync(&self) -> bool {
        self.sync_capability == SyncCapability::NetworkSync
    }

    /// Unique name of this source's recurring job in the host scheduler.
    pub fn job_name(&self) -> String {
        format!("catalog-sync-{}", self.id)
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name)
    }
}
