use camino::Utf8PathBuf;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Per-source sync configuration, persisted in `sync-state.yaml`.
///
/// `interval_minutes` is stored exactly as the user entered it; clamping to the
/// platform floor happens in the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// 0 means manual sync only.
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u32,

    /// Milliseconds since epoch of the last successful sync; 0 = never.
    #[serde(default)]
    pub last_sync_timestamp: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            interval_minutes: default_interval_minutes(),
            last_sync_timestamp: 0,
        }
    }
}

impl SyncConfig {
    pub fn has_synced(&self) -> bool {
        self.last_sync_timestamp > 0
    }
}

fn default_enabled() -> bool {
    true
}

fn default_interval_minutes() -> u32 {
    360
}

/// The persisted key-value document the engine reads at startup and writes
/// on job completion and recovery.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default)]
    pub sources: IndexMap<String, SyncConfig>,

    #[serde(default)]
    pub emergency_resync_pending: bool,

    #[serde(default)]
    pub fatal_error: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fatal_reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_source_id: Option<String>,
}

impl PersistedState {
    /// Config for a source, falling back to defaults for sources never persisted.
    pub fn source(&self, id: &str) -> SyncConfig {
        self.sources.get(id).cloned().unwrap_or_default()
    }

    pub fn source_mut(&mut self, id: &str) -> &mut SyncConfig {
        self.sources.entry(id.to_string()).or_default()
    }
}

/// Application settings loaded from `catalog-sync.yaml` and `CATALOG_SYNC__*` env vars.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppSettings {
    /// Where per-source database files live.
    #[serde(default = "default_data_dir")]
    pub data_dir: Utf8PathBuf,

    /// Bundled seed databases, one per `storage_file_name`.
    #[serde(default = "default_seed_dir")]
    pub seed_dir: Utf8PathBuf,

    #[serde(default = "default_log_dir")]
    pub log_dir: Utf8PathBuf,

    #[serde(default)]
    pub debug: bool,

    /// Write log files as JSON lines.
    #[serde(default)]
    pub log_json: bool,

    /// Platform-imposed minimum recurring interval.
    #[serde(default = "default_min_interval")]
    pub min_interval_minutes: u32,

    /// Platform-imposed minimum flex window.
    #[serde(default = "default_min_flex")]
    pub min_flex_minutes: u32,

    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,

    /// Catalog snapshot endpoint per source id.
    #[serde(default)]
    pub endpoints: IndexMap<String, String>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            seed_dir: default_seed_dir(),
            log_dir: default_log_dir(),
            debug: false,
            log_json: false,
            min_interval_minutes: default_min_interval(),
            min_flex_minutes: default_min_flex(),
            http_timeout_secs: default_http_timeout(),
            endpoints: IndexMap::new(),
        }
    }
}

fn default_data_dir() -> Utf8PathBuf {
    Utf8PathBuf::from("data")
}

fn default_seed_dir() -> Utf8PathBuf {
    Utf8PathBuf::from("assets/databases")
}

fn default_log_dir() -> Utf8PathBuf {
    Utf8PathBuf::from("logs")
}

fn default_min_interval() -> u32 {
    15
}

fn default_min_flex() -> u32 {
    5
}

fn default_http_timeout() -> u64 {
    30
}
