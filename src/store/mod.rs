//! Local store for mirrored catalogs.
//!
//! - [`StoreBackend`]: Opens and deletes the backing storage of one [`Source`]
//! - [`StoreHandle`]: A live handle to one source's store (merge, probe, queries, user state)
//! - [`StoreManager`]: Owns the single open handle; the only way the rest of the crate
//!   reaches a store
//! - [`SqliteBackend`]: SQLite implementation, one database file per source
//!
//! # Invariant
//!
//! At most one [`StoreHandle`] is open at any time. [`StoreManager::open`] refuses to
//! open a second source while another handle is live, and [`StoreManager::delete`]
//! refuses to delete a source whose handle is still open.

pub mod sqlite;

pub use sqlite::{SqliteBackend, SqliteStore};

use crate::models::{CatalogSnapshot, ContentKind, MergeStats, Source};
use camino::Utf8PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Errors raised by the storage layer
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("No seed database for static source {source_id} at {path}")]
    SeedMissing { source_id: String, path: Utf8PathBuf },

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store for {open} is open; close it before using {requested}")]
    HandleOpen {
        open: &'static str,
        requested: &'static str,
    },

    #[error("Refusing to delete store for {0} while its handle is open")]
    DeleteWhileOpen(&'static str),

    #[error("Failed to close store for {source_id}: {message}")]
    CloseFailed { source_id: String, message: String },

    #[error("Store task for {source_id} did not finish: {message}")]
    TaskAborted { source_id: String, message: String },
}

impl StoreError {
    /// Whether this error means the backing storage itself is unusable
    /// (as opposed to a handle-protocol mistake or a missing seed).
    pub fn indicates_corruption(&self) -> bool {
        matches!(self, Self::Sqlite(_) | Self::Io(_))
    }
}

/// Row counts per table, used by the health probe and by callers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CatalogCounts {
    pub movies: u64,
    pub series: u64,
    pub episodes: u64,
    pub genres: u64,
    pub favorites: u64,
}

/// A title as stored locally.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredTitle {
    pub id: i64,
    pub url: String,
    pub title: String,
    pub date_added: i64,
    pub last_updated: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Favorite {
    pub kind: ContentKind,
    pub content_id: i64,
    pub added_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchProgress {
    pub position_ms: i64,
    pub duration_ms: i64,
    pub updated_at: i64,
}

/// Live handle to one source's store.
pub trait StoreHandle: Send {
    fn source_id(&self) -> &'static str;

    /// Lightweight integrity probe (a count query). Any error means the store is unusable.
    fn probe(&self) -> Result<u64, StoreError>;

    /// Upsert every entity of `snapshot`, keyed by its remote identifier.
    /// Never deletes, and never touches user state.
    fn merge(&mut self, snapshot: &CatalogSnapshot, now_ms: i64) -> Result<MergeStats, StoreError>;

    fn counts(&self) -> Result<CatalogCounts, StoreError>;

    fn find_title(&self, kind: ContentKind, url: &str) -> Result<Option<StoredTitle>, StoreError>;

    /// Most recently added movies and series, newest first.
    fn latest_titles(&self, limit: usize) -> Result<Vec<StoredTitle>, StoreError>;

    /// Mark content as favorite. Returns `false` if no local entity has that url.
    fn add_favorite(&mut self, kind: ContentKind, url: &str, now_ms: i64) -> Result<bool, StoreError>;

    fn favorites(&self) -> Result<Vec<Favorite>, StoreError>;

    /// Returns `false` if no local entity has that url.
    fn save_progress(
        &mut self,
        kind: ContentKind,
        url: &str,
        position_ms: i64,
        duration_ms: i64,
        now_ms: i64,
    ) -> Result<bool, StoreError>;

    fn progress(&self, kind: ContentKind, url: &str) -> Result<Option<WatchProgress>, StoreError>;

    /// Release the handle. The handle is gone afterwards even if closing reports an error.
    fn close(self: Box<Self>) -> Result<(), StoreError>;
}

/// Opens and deletes per-source backing storage.
pub trait StoreBackend: Send + Sync {
    /// Open the store for `source`, creating it from its seed (or empty) on first use.
    fn open(&self, source: &'static Source) -> Result<Box<dyn StoreHandle>, StoreError>;

    /// Delete the backing storage for `source`. Must only be called with no open handle.
    fn delete(&self, source: &Source) -> Result<(), StoreError>;

    fn exists(&self, source: &Source) -> bool;
}

/// Owner of the single open store handle.
pub struct StoreManager {
    backend: Arc<dyn StoreBackend>,
    slot: Mutex<Option<Box<dyn StoreHandle>>>,
}

impl StoreManager {
    pub fn new(backend: Arc<dyn StoreBackend>) -> Self {
        Self {
            backend,
            slot: Mutex::new(None),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<Box<dyn StoreHandle>>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open the store for `source`. A no-op if it is already the open one.
    pub fn open(&self, source: &'static Source) -> Result<(), StoreError> {
        let mut slot = self.slot();
        if let Some(handle) = slot.as_ref() {
            if handle.source_id() == source.id {
                return Ok(());
            }
            return Err(StoreError::HandleOpen {
                open: handle.source_id(),
                requested: source.id,
            });
        }
        let handle = self.backend.open(source)?;
        tracing::info!("Opened store for {}", source.id);
        *slot = Some(handle);
        Ok(())
    }

    /// Close the open handle, if any. Returns the id of the source that was closed.
    pub fn close(&self) -> Result<Option<&'static str>, StoreError> {
        let Some(handle) = self.slot().take() else {
            return Ok(None);
        };
        let source_id = handle.source_id();
        handle.close()?;
        tracing::info!("Closed store for {}", source_id);
        Ok(Some(source_id))
    }

    pub fn open_source_id(&self) -> Option<&'static str> {
        self.slot().as_ref().map(|h| h.source_id())
    }

    pub fn is_open_for(&self, source: &Source) -> bool {
        self.open_source_id() == Some(source.id)
    }

    /// Run `f` against the handle of `source`, reopening it if the slot is empty.
    ///
    /// Fails with [`StoreError::HandleOpen`] if a different source's handle is open.
    pub fn with_handle<R>(
        &self,
        source: &'static Source,
        f: impl FnOnce(&mut dyn StoreHandle) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let mut slot = self.slot();
        let open_id = slot.as_ref().map(|h| h.source_id());
        match open_id {
            Some(open) if open != source.id => {
                return Err(StoreError::HandleOpen {
                    open,
                    requested: source.id,
                });
            }
            Some(_) => {}
            None => {
                tracing::debug!("Reopening store for {}", source.id);
                *slot = Some(self.backend.open(source)?);
            }
        }
        match slot.as_mut() {
            Some(handle) => f(handle.as_mut()),
            None => unreachable!("slot filled above"),
        }
    }

    /// Probe the open handle for `source` without reopening it.
    ///
    /// Returns `Ok(None)` when no handle for `source` is open.
    pub fn probe_open(&self, source: &Source) -> Result<Option<u64>, StoreError> {
        let slot = self.slot();
        match slot.as_ref() {
            Some(handle) if handle.source_id() == source.id => handle.probe().map(Some),
            _ => Ok(None),
        }
    }

    /// Delete the backing storage of `source`. Refused while its handle is open.
    pub fn delete(&self, source: &Source) -> Result<(), StoreError> {
        let slot = self.slot();
        if let Some(handle) = slot.as_ref() {
            if handle.source_id() == source.id {
                return Err(StoreError::DeleteWhileOpen(handle.source_id()));
            }
        }
        self.backend.delete(source)?;
        tracing::warn!("Deleted store for {}", source.id);
        Ok(())
    }

    pub fn exists(&self, source: &Source) -> bool {
        self.backend.exists(source)
    }
}
