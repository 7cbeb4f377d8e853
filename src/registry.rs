// Source registry
//
// Static catalog of every known source. Pure data, so it is safe to read from any thread.

use crate::models::{Source, SyncCapability};
use thiserror::Error;

/// Every known source, in display order.
pub static SOURCES: [Source; 4] = [
    Source::new(
        "farsiland",
        "Farsiland",
        "farsiland_content.db",
        SyncCapability::NetworkSync,
    ),
    Source::new(
        "farsiplex",
        "FarsiPlex",
        "farsiplex_content.db",
        SyncCapability::NetworkSync,
    ),
    Source::new(
        "namakade",
        "Namakade",
        "namakade_content.db",
        SyncCapability::NetworkSync,
    ),
    Source::new(
        "imvbox",
        "IMVBox",
        "imvbox_content.db",
        SyncCapability::StaticOnly,
    ),
];

/// Source used when the persisted selection is missing or unknown.
pub const DEFAULT_SOURCE_ID: &str = "farsiland";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Unknown source: {0}")]
    UnknownSource(String),
}

pub fn all() -> &'static [Source] {
    &SOURCES
}

pub fn network_sources() -> impl Iterator<Item = &'static Source> {
    SOURCES.iter().filter(|s| s.supports_network_sync())
}

pub fn by_id(id: &str) -> Result<&'static Source, RegistryError> {
    SOURCES
        .iter()
        .find(|s| s.id == id)
        .ok_or_else(|| RegistryError::UnknownSource(id.to_string()))
}

pub fn by_storage_file_name(name: &str) -> Result<&'static Source, RegistryError> {
    SOURCES
        .iter()
        .find(|s| s.storage_file_name == name)
        .ok_or_else(|| RegistryError::UnknownSource(name.to_string()))
}

pub fn default_source() -> &'static Source {
    SOURCES
        .iter()
        .find(|s| s.id == DEFAULT_SOURCE_ID)
        .unwrap_or(&SOURCES[0])
}

/// Resolve a persisted source id, falling back to [`DEFAULT_SOURCE_ID`].
///
/// The fallback is always logged; a missing id (first run) logs at info level,
/// an unknown one at warn level.
pub fn resolve_or_default(id: Option<&str>) -> &'static Source {
    match id {
        Some(id) => match by_id(id) {
            Ok(source) => source,
            Err(e) => {
                tracing::warn!("{}; falling back to default source {}", e, DEFAULT_SOURCE_ID);
                default_source()
            }
        },
        None => {
            tracing::info!("No active source persisted, using default {}", DEFAULT_SOURCE_ID);
            default_source()
        }
    }
}
