//! Integration tests for the SQLite store
//!
//! These tests verify:
//! - Merging is a union keyed by remote url, whatever the order of snapshots
//! - First-seen timestamps are never overwritten
//! - User state survives a full sync through the engine
//! - Renumbered upstream episodes keep syncing instead of failing every run

mod common;

use async_trait::async_trait;
use camino::Utf8PathBuf;
use catalog_sync::config::SettingsStore;
use catalog_sync::models::{CatalogSnapshot, ContentKind, ErrorKind, Source};
use catalog_sync::services::{CatalogFetcher, FetchError, ScheduleFloors};
use catalog_sync::store::{SqliteBackend, StoreBackend};
use catalog_sync::{EngineParts, SyncEngine, registry};
use common::{StaticFetcher, movie, snapshot, temp_config};
use proptest::prelude::*;
use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Serves the queued snapshots in order, then keeps serving the last one.
struct SequenceFetcher(Mutex<VecDeque<CatalogSnapshot>>);

#[async_trait]
impl CatalogFetcher for SequenceFetcher {
    async fn fetch(&self, _source: &Source) -> Result<CatalogSnapshot, FetchError> {
        let mut queue = self.0.lock().unwrap();
        if queue.len() > 1 {
            Ok(queue.pop_front().unwrap())
        } else {
            Ok(queue.front().cloned().unwrap_or_default())
        }
    }
}

fn show_with_episodes(episodes: &[(&str, i32)]) -> CatalogSnapshot {
    let episodes: Vec<_> = episodes
        .iter()
        .map(|(url, number)| {
            serde_json::json!({
                "url": url,
                "series_url": "series/show",
                "season": 1,
                "episode": number,
                "title": format!("Episode {}", number),
            })
        })
        .collect();
    serde_json::from_value(serde_json::json!({
        "series": [{"url": "series/show", "title": "Show"}],
        "episodes": episodes,
    }))
    .unwrap()
}

fn sqlite_backend() -> (SqliteBackend, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let root = Utf8PathBuf::try_from(temp_dir.path().to_path_buf()).unwrap();
    let backend = SqliteBackend::new(root.join("data"), root.join("seeds")).unwrap();
    (backend, temp_dir)
}

fn movies_snapshot(urls: &BTreeSet<String>, title_prefix: &str) -> CatalogSnapshot {
    CatalogSnapshot {
        movies: urls
            .iter()
            .map(|url| movie(url, &format!("{} {}", title_prefix, url)))
            .collect(),
        ..Default::default()
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn test_merge_is_a_union(
        first in prop::collection::btree_set("movie/[a-z]{1,6}", 0..12),
        second in prop::collection::btree_set("movie/[a-z]{1,6}", 0..12),
    ) {
        let (backend, _dir) = sqlite_backend();
        let source = registry::by_id("farsiland").unwrap();
        let mut store = backend.open(source).unwrap();

        let stats = store.merge(&movies_snapshot(&first, "old"), 1_000).unwrap();
        prop_assert_eq!(stats.movies_inserted, first.len());
        store.merge(&movies_snapshot(&second, "new"), 2_000).unwrap();

        let expected: BTreeSet<_> = first.union(&second).cloned().collect();
        prop_assert_eq!(store.counts().unwrap().movies, expected.len() as u64);

        for url in &expected {
            let title = store.find_title(ContentKind::Movie, url).unwrap().unwrap();
            let first_seen = if first.contains(url) { 1_000 } else { 2_000 };
            prop_assert_eq!(title.date_added, first_seen);
            // Later snapshots win for catalog fields
            let prefix = if second.contains(url) { "new" } else { "old" };
            prop_assert_eq!(title.title, format!("{} {}", prefix, url));
        }
    }
}

#[tokio::test]
async fn test_favorites_survive_resync_through_engine() {
    let (settings, _config_dir) = temp_config();
    let (backend, _data_dir) = sqlite_backend();

    let engine = SyncEngine::new(EngineParts {
        settings,
        fetcher: Arc::new(StaticFetcher(Ok(snapshot(&["movie/a", "movie/b"])))),
        backend: Arc::new(backend),
        floors: ScheduleFloors::default(),
        host: None,
    });
    engine.start().await.unwrap();

    let jobs = engine.sync_now(Some("farsiland")).await.unwrap();
    assert!(jobs[0].succeeded());

    let added = engine
        .query(|store| store.add_favorite(ContentKind::Movie, "movie/a", 10))
        .await
        .unwrap();
    assert!(added);

    let jobs = engine.sync_now(Some("farsiland")).await.unwrap();
    assert_eq!(jobs[0].merge_stats.map(|s| s.movies_updated), Some(2));

    let favorites = engine.query(|store| store.favorites()).await.unwrap();
    assert_eq!(favorites.len(), 1);
    assert_eq!(favorites[0].kind, ContentKind::Movie);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_renumbered_episodes_keep_syncing() {
    let (settings, _config_dir) = temp_config();
    let (backend, _data_dir) = sqlite_backend();
    let fetcher = SequenceFetcher(Mutex::new(VecDeque::from([
        show_with_episodes(&[("episode/a", 1), ("episode/b", 2)]),
        show_with_episodes(&[("episode/a", 2), ("episode/b", 1)]),
    ])));

    let engine = SyncEngine::new(EngineParts {
        settings: settings.clone(),
        fetcher: Arc::new(fetcher),
        backend: Arc::new(backend),
        floors: ScheduleFloors::default(),
        host: None,
    });
    engine.start().await.unwrap();

    let jobs = engine.sync_now(Some("farsiland")).await.unwrap();
    assert!(jobs[0].succeeded());
    assert_eq!(jobs[0].merge_stats.map(|s| s.episodes_inserted), Some(2));

    // The swap and every later run of the same catalog succeed
    for _ in 0..2 {
        let jobs = engine.sync_now(Some("farsiland")).await.unwrap();
        assert!(jobs[0].succeeded(), "{:?}", jobs[0].error_message);
        assert_ne!(jobs[0].error_kind, Some(ErrorKind::StorageError));
        assert_eq!(jobs[0].merge_stats.map(|s| s.episodes_updated), Some(2));
    }

    let counts = engine.query(|store| store.counts()).await.unwrap();
    assert_eq!(counts.episodes, 2);
    assert!(settings.sync_config("farsiland").has_synced());
    assert!(!engine.state().emergency_pending);

    engine.shutdown().await;
}
