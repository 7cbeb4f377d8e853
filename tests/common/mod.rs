//! Shared test doubles for the integration tests.
//!
//! - [`MemoryBackend`]: in-memory [`StoreBackend`] that records every store operation
//!   and can be told to fail any of them
//! - [`RecordingHost`]: [`HostJobScheduler`] that only records what it was asked to do
//! - [`GatedFetcher`]: fetcher that blocks until released, counting calls
//! - [`Rig`]: the engine's components wired by hand, with the dispatch channel exposed

#![allow(dead_code)]

use async_trait::async_trait;
use camino::Utf8PathBuf;
use catalog_sync::config::{ConfigManager, SettingsStore};
use catalog_sync::metrics::Metrics;
use catalog_sync::models::{CatalogSnapshot, ContentKind, MergeStats, Movie, Source};
use catalog_sync::registry;
use catalog_sync::services::{
    CatalogFetcher, DispatchReceiver, EmergencyTrigger, FetchError, HostJobScheduler, JobSpec,
    RecoveryManager, ScheduleFloors, SourceLocks, SourceSwitchCoordinator, SyncExecutor,
    SyncScheduler, dispatch_channel,
};
use catalog_sync::state::{ActiveSourcePointer, StateManager};
use catalog_sync::store::{
    CatalogCounts, Favorite, StoreBackend, StoreError, StoreHandle, StoreManager, StoredTitle,
    WatchProgress,
};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::{Notify, Semaphore};

pub fn movie(url: &str, title: &str) -> Movie {
    Movie {
        url: url.to_string(),
        title: title.to_string(),
        poster_url: None,
        description: None,
        year: Some(2020),
        rating: None,
        runtime: Some(100),
        director: None,
        cast: None,
        genres: vec![],
        date_added: None,
        last_updated: None,
    }
}

pub fn snapshot(urls: &[&str]) -> CatalogSnapshot {
    CatalogSnapshot {
        movies: urls.iter().map(|url| movie(url, url)).collect(),
        ..Default::default()
    }
}

pub fn source(id: &str) -> &'static Source {
    registry::by_id(id).unwrap()
}

fn corrupted() -> StoreError {
    StoreError::Io(std::io::Error::other("database disk image is malformed"))
}

/// Which store operations should fail.
#[derive(Debug, Default, Clone)]
pub struct Failures {
    pub merge: bool,
    pub probe: bool,
    pub close: bool,
    pub delete: bool,
    pub open: HashSet<&'static str>,
}

#[derive(Default)]
struct BackendState {
    ops: Vec<String>,
    movies: HashMap<&'static str, BTreeSet<String>>,
    failures: Failures,
}

/// In-memory [`StoreBackend`]. Clones share the same state.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<BackendState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every operation so far, as `"<op>:<source id>"`.
    pub fn ops(&self) -> Vec<String> {
        self.inner.lock().unwrap().ops.clone()
    }

    /// Operations of one kind, e.g. `"merge"`.
    pub fn ops_named(&self, op: &str) -> Vec<String> {
        let prefix = format!("{}:", op);
        self.ops().into_iter().filter(|o| o.starts_with(&prefix)).collect()
    }

    pub fn fail(&self, configure: impl FnOnce(&mut Failures)) {
        configure(&mut self.inner.lock().unwrap().failures);
    }

    pub fn heal(&self) {
        self.inner.lock().unwrap().failures = Failures::default();
    }

    pub fn movie_urls(&self, source_id: &str) -> BTreeSet<String> {
        self.inner
            .lock()
            .unwrap()
            .movies
            .get(source_id)
            .cloned()
            .unwrap_or_default()
    }

    fn record(&self, op: &str, source_id: &str) {
        self.inner.lock().unwrap().ops.push(format!("{}:{}", op, source_id));
    }

    fn failures(&self) -> Failures {
        self.inner.lock().unwrap().failures.clone()
    }
}

impl StoreBackend for MemoryBackend {
    fn open(&self, source: &'static Source) -> Result<Box<dyn StoreHandle>, StoreError> {
        self.record("open", source.id);
        if self.failures().open.contains(source.id) {
            return Err(corrupted());
        }
        self.inner.lock().unwrap().movies.entry(source.id).or_default();
        Ok(Box::new(MemoryHandle {
            source_id: source.id,
            backend: self.clone(),
        }))
    }

    fn delete(&self, source: &Source) -> Result<(), StoreError> {
        self.record("delete", source.id);
        if self.failures().delete {
            return Err(StoreError::Io(std::io::Error::other("permission denied")));
        }
        self.inner.lock().unwrap().movies.remove(source.id);
        Ok(())
    }

    fn exists(&self, source: &Source) -> bool {
        self.inner.lock().unwrap().movies.contains_key(source.id)
    }
}

struct MemoryHandle {
    source_id: &'static str,
    backend: MemoryBackend,
}

impl StoreHandle for MemoryHandle {
    fn source_id(&self) -> &'static str {
        self.source_id
    }

    fn probe(&self) -> Result<u64, StoreError> {
        self.backend.record("probe", self.source_id);
        if self.backend.failures().probe {
            return Err(corrupted());
        }
        Ok(self.backend.movie_urls(self.source_id).len() as u64)
    }

    fn merge(&mut self, snapshot: &CatalogSnapshot, _now_ms: i64) -> Result<MergeStats, StoreError> {
        self.backend.record("merge", self.source_id);
        if self.backend.failures().merge {
            return Err(corrupted());
        }
        let mut state = self.backend.inner.lock().unwrap();
        let movies = state.movies.entry(self.source_id).or_default();
        let mut stats = MergeStats::default();
        for movie in &snapshot.movies {
            if movies.insert(movie.url.clone()) {
                stats.movies_inserted += 1;
            } else {
                stats.movies_updated += 1;
            }
        }
        Ok(stats)
    }

    fn counts(&self) -> Result<CatalogCounts, StoreError> {
        Ok(CatalogCounts {
            movies: self.backend.movie_urls(self.source_id).len() as u64,
            ..Default::default()
        })
    }

    fn find_title(&self, _kind: ContentKind, _url: &str) -> Result<Option<StoredTitle>, StoreError> {
        Ok(None)
    }

    fn latest_titles(&self, _limit: usize) -> Result<Vec<StoredTitle>, StoreError> {
        Ok(vec![])
    }

    fn add_favorite(&mut self, _kind: ContentKind, _url: &str, _now_ms: i64) -> Result<bool, StoreError> {
        Ok(false)
    }

    fn favorites(&self) -> Result<Vec<Favorite>, StoreError> {
        Ok(vec![])
    }

    fn save_progress(
        &mut self,
        _kind: ContentKind,
        _url: &str,
        _position_ms: i64,
        _duration_ms: i64,
        _now_ms: i64,
    ) -> Result<bool, StoreError> {
        Ok(false)
    }

    fn progress(&self, _kind: ContentKind, _url: &str) -> Result<Option<WatchProgress>, StoreError> {
        Ok(None)
    }

    fn close(self: Box<Self>) -> Result<(), StoreError> {
        self.backend.record("close", self.source_id);
        if self.backend.failures().close {
            return Err(StoreError::CloseFailed {
                source_id: self.source_id.to_string(),
                message: "busy".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCall {
    Enqueue {
        name: String,
        spec: JobSpec,
        source_id: &'static str,
    },
    Cancel(String),
    CancelAll,
}

/// [`HostJobScheduler`] that never fires; it only records calls.
#[derive(Default)]
pub struct RecordingHost {
    calls: Mutex<Vec<HostCall>>,
}

impl RecordingHost {
    pub fn calls(&self) -> Vec<HostCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Jobs currently installed, replaying the call log.
    pub fn installed(&self) -> HashMap<String, JobSpec> {
        let mut jobs = HashMap::new();
        for call in self.calls() {
            match call {
                HostCall::Enqueue { name, spec, .. } => {
                    jobs.insert(name, spec);
                }
                HostCall::Cancel(name) => {
                    jobs.remove(&name);
                }
                HostCall::CancelAll => jobs.clear(),
            }
        }
        jobs
    }

    pub fn enqueued_for(&self, source_id: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, HostCall::Enqueue { source_id: id, .. } if *id == source_id))
            .count()
    }
}

impl HostJobScheduler for RecordingHost {
    fn enqueue_periodic(&self, unique_name: &str, spec: JobSpec, source_id: &'static str) {
        self.calls.lock().unwrap().push(HostCall::Enqueue {
            name: unique_name.to_string(),
            spec,
            source_id,
        });
    }

    fn cancel(&self, unique_name: &str) {
        self.calls
            .lock()
            .unwrap()
            .push(HostCall::Cancel(unique_name.to_string()));
    }

    fn cancel_all(&self) {
        self.calls.lock().unwrap().push(HostCall::CancelAll);
    }
}

/// Fetcher that blocks every call until [`release`](Self::release) hands out a permit.
pub struct GatedFetcher {
    calls: AtomicUsize,
    gate: Semaphore,
    entered: Notify,
    urls: Vec<String>,
}

impl GatedFetcher {
    pub fn new(urls: &[&str]) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            gate: Semaphore::new(0),
            entered: Notify::new(),
            urls: urls.iter().map(|u| u.to_string()).collect(),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Resolves once a fetch has started (or had started before the call).
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    pub fn release(&self, fetches: usize) {
        self.gate.add_permits(fetches);
    }
}

#[async_trait]
impl CatalogFetcher for GatedFetcher {
    async fn fetch(&self, _source: &Source) -> Result<CatalogSnapshot, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| FetchError::Unknown(e.to_string()))?;
        permit.forget();
        let urls: Vec<&str> = self.urls.iter().map(String::as_str).collect();
        Ok(snapshot(&urls))
    }
}

/// Fetcher that answers immediately with a fixed result.
pub struct StaticFetcher(pub Result<CatalogSnapshot, FetchError>);

#[async_trait]
impl CatalogFetcher for StaticFetcher {
    async fn fetch(&self, _source: &Source) -> Result<CatalogSnapshot, FetchError> {
        self.0.clone()
    }
}

pub fn temp_config() -> (Arc<ConfigManager>, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let dir = Utf8PathBuf::try_from(temp_dir.path().to_path_buf()).unwrap();
    (Arc::new(ConfigManager::new(dir).unwrap()), temp_dir)
}

/// The engine's components, wired without a dispatcher so emergency requests
/// stay on [`Rig::requests`] for inspection.
pub struct Rig {
    pub backend: MemoryBackend,
    pub host: Arc<RecordingHost>,
    pub settings: Arc<ConfigManager>,
    pub stores: Arc<StoreManager>,
    pub active: Arc<ActiveSourcePointer>,
    pub locks: Arc<SourceLocks>,
    pub state: StateManager,
    pub metrics: Arc<Metrics>,
    pub recovery: Arc<RecoveryManager>,
    pub scheduler: Arc<SyncScheduler>,
    pub switcher: SourceSwitchCoordinator,
    pub requests: DispatchReceiver,
    _dir: TempDir,
}

impl Rig {
    pub fn new(fetcher: Arc<dyn CatalogFetcher>, active_id: &str) -> Self {
        let backend = MemoryBackend::new();
        let host = Arc::new(RecordingHost::default());
        let (settings, dir) = temp_config();
        let active_source = source(active_id);

        let stores = Arc::new(StoreManager::new(Arc::new(backend.clone())));
        let active = Arc::new(ActiveSourcePointer::new(active_source));
        let locks = Arc::new(SourceLocks::new());
        let state = StateManager::new(active_source.id);
        let metrics = Arc::new(Metrics::new());
        let (tx, requests) = dispatch_channel();
        let settings_store: Arc<dyn SettingsStore> = settings.clone();

        let executor = Arc::new(SyncExecutor::new(
            fetcher,
            Arc::clone(&stores),
            Arc::clone(&settings_store),
            Arc::clone(&active),
            Arc::clone(&locks),
            state.clone(),
            Arc::clone(&metrics),
        ));
        let recovery = Arc::new(RecoveryManager::new(
            Arc::clone(&stores),
            Arc::clone(&settings_store),
            Arc::clone(&active),
            Arc::clone(&locks),
            EmergencyTrigger::new(tx),
            state.clone(),
            Arc::clone(&metrics),
        ));
        let scheduler = Arc::new(SyncScheduler::new(
            executor,
            Arc::clone(&recovery),
            host.clone(),
            Arc::clone(&active),
            state.clone(),
            Arc::clone(&metrics),
            ScheduleFloors::default(),
        ));
        let switcher = SourceSwitchCoordinator::new(
            Arc::clone(&stores),
            Arc::clone(&active),
            Arc::clone(&settings_store),
            Arc::clone(&locks),
            Arc::clone(&scheduler),
            state.clone(),
        );

        stores.open(active_source).unwrap();

        Self {
            backend,
            host,
            settings,
            stores,
            active,
            locks,
            state,
            metrics,
            recovery,
            scheduler,
            switcher,
            requests,
            _dir: dir,
        }
    }
}
