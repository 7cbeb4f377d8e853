use crate::models::{AppSettings, PersistedState, SyncConfig};
use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use std::fs;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// File name of the persisted sync state inside the config directory.
pub const STATE_FILE_NAME: &str = "sync-state.yaml";

/// File name of the application settings inside the config directory.
pub const SETTINGS_FILE_NAME: &str = "catalog-sync.yaml";

/// Environment prefix for settings overrides, e.g. `CATALOG_SYNC__DATA_DIR`.
pub const ENV_PREFIX: &str = "CATALOG_SYNC";

/// Persisted key-value configuration the engine reads at startup and
/// writes on job completion and recovery.
///
/// Every mutation is a read-modify-write of the whole [`PersistedState`],
/// so callers never observe a half-applied update.
pub trait SettingsStore: Send + Sync {
    fn snapshot(&self) -> PersistedState;

    fn update(&self, f: &mut dyn FnMut(&mut PersistedState)) -> Result<()>;

    fn sync_config(&self, source_id: &str) -> SyncConfig {
        self.snapshot().source(source_id)
    }

    fn set_sync_config(&self, source_id: &str, enabled: bool, interval_minutes: u32) -> Result<()> {
        self.update(&mut |state| {
            let config = state.source_mut(source_id);
            config.enabled = enabled;
            config.interval_minutes = interval_minutes;
        })
    }

    fn record_sync_success(&self, source_id: &str, timestamp_ms: i64) -> Result<()> {
        self.update(&mut |state| state.source_mut(source_id).last_sync_timestamp = timestamp_ms)
    }

    /// Forget the last sync of `source_id` and leave a resync request behind
    /// that survives a restart.
    fn mark_emergency_resync(&self, source_id: &str) -> Result<()> {
        self.update(&mut |state| {
            state.source_mut(source_id).last_sync_timestamp = 0;
            state.emergency_resync_pending = true;
        })
    }

    fn clear_emergency_resync(&self) -> Result<()> {
        self.update(&mut |state| state.emergency_resync_pending = false)
    }

    fn set_fatal(&self, reason: &str) -> Result<()> {
        self.update(&mut |state| {
            state.fatal_error = true;
            state.fatal_reason = Some(reason.to_string());
        })
    }

    fn set_active_source(&self, source_id: &str) -> Result<()> {
        self.update(&mut |state| state.active_source_id = Some(source_id.to_string()))
    }
}

/// YAML-backed [`SettingsStore`].
///
/// Manages `sync-state.yaml` in the config directory. The document is read once
/// on construction and written through on every update.
#[derive(Debug)]
pub struct ConfigManager {
    config_dir: Utf8PathBuf,
    state_path: Utf8PathBuf,
    state: Mutex<PersistedState>,
}

impl ConfigManager {
    /// Create a ConfigManager for `config_dir`, creating the directory if needed
    /// and loading any previously persisted state.
    pub fn new<P: AsRef<Utf8Path>>(config_dir: P) -> Result<Self> {
        let config_dir = config_dir.as_ref().to_path_buf();

        if !config_dir.exists() {
            fs::create_dir_all(&config_dir)
                .with_context(|| format!("Failed to create config directory: {}", config_dir))?;
        }

        let state_path = config_dir.join(STATE_FILE_NAME);
        let state = Self::load_state(&state_path)?;

        Ok(Self {
            config_dir,
            state_path,
            state: Mutex::new(state),
        })
    }

    fn load_state(path: &Utf8Path) -> Result<PersistedState> {
        if !path.exists() {
            tracing::info!("Sync state not found at {}, starting fresh", path);
            return Ok(PersistedState::default());
        }

        let file_contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read sync state: {}", path))?;

        let state: PersistedState = serde_yaml_ng::from_str(&file_contents)
            .with_context(|| format!("Failed to parse sync state: {}", path))?;

        tracing::info!("Loaded sync state from {}", path);
        Ok(state)
    }

    fn save_state(&self, state: &PersistedState) -> Result<()> {
        let yaml_string =
            serde_yaml_ng::to_string(state).context("Failed to serialize sync state to YAML")?;

        fs::write(&self.state_path, yaml_string)
            .with_context(|| format!("Failed to write sync state: {}", self.state_path))?;

        tracing::debug!("Saved sync state to {}", self.state_path);
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, PersistedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config_dir(&self) -> &Utf8Path {
        &self.config_dir
    }

    pub fn state_path(&self) -> &Utf8Path {
        &self.state_path
    }
}

impl SettingsStore for ConfigManager {
    fn snapshot(&self) -> PersistedState {
        self.lock().clone()
    }

    fn update(&self, f: &mut dyn FnMut(&mut PersistedState)) -> Result<()> {
        let mut state = self.lock();
        let mut next = state.clone();
        f(&mut next);
        if next == *state {
            return Ok(());
        }
        // Memory only moves forward once the file has it.
        self.save_state(&next)?;
        *state = next;
        Ok(())
    }
}

/// Load [`AppSettings`] from `<config_dir>/catalog-sync.yaml` layered with
/// `CATALOG_SYNC__*` environment variables. A missing file means defaults.
pub fn load_app_settings<P: AsRef<Utf8Path>>(config_dir: P) -> Result<AppSettings> {
    let settings_path = config_dir.as_ref().join(SETTINGS_FILE_NAME);

    let settings = ::config::Config::builder()
        .add_source(::config::File::from(settings_path.as_std_path()).required(false))
        .add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("Failed to load settings from {}", settings_path))?;

    let app_settings: AppSettings = settings
        .try_deserialize()
        .with_context(|| format!("Invalid settings in {}", settings_path))?;

    tracing::debug!("Loaded settings: {:?}", app_settings);
    Ok(app_settings)
}
