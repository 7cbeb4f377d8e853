//! Integration tests for SyncEngine
//!
//! These tests verify:
//! - Startup scheduling, health probing and recovery
//! - Resuming an emergency resync persisted by a previous run
//! - The manual, config and switch surfaces
//! - Shutdown

mod common;

use catalog_sync::config::{ConfigManager, SettingsStore};
use catalog_sync::models::{CatalogSnapshot, ErrorKind, JobState, SyncTrigger};
use catalog_sync::registry::RegistryError;
use catalog_sync::services::{CatalogFetcher, JobSpec, ScheduleFloors, SchedulerError};
use catalog_sync::store::StoreError;
use catalog_sync::{EngineParts, StateChange, SyncEngine};
use common::{HostCall, MemoryBackend, RecordingHost, StaticFetcher, snapshot, temp_config};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::time::{Duration, timeout};

struct TestEngine {
    engine: SyncEngine,
    backend: MemoryBackend,
    host: Arc<RecordingHost>,
    settings: Arc<ConfigManager>,
    _dir: TempDir,
}

fn build(fetcher: Arc<dyn CatalogFetcher>, prepare: impl FnOnce(&ConfigManager)) -> TestEngine {
    let (settings, dir) = temp_config();
    prepare(&settings);
    let backend = MemoryBackend::new();
    let host = Arc::new(RecordingHost::default());

    let engine = SyncEngine::new(EngineParts {
        settings: settings.clone(),
        fetcher,
        backend: Arc::new(backend.clone()),
        floors: ScheduleFloors::default(),
        host: Some(host.clone()),
    });

    TestEngine {
        engine,
        backend,
        host,
        settings,
        _dir: dir,
    }
}

fn ok_fetcher() -> Arc<dyn CatalogFetcher> {
    Arc::new(StaticFetcher(Ok(snapshot(&["movie/1", "movie/2"]))))
}

async fn next_job_finished(rx: &mut broadcast::Receiver<StateChange>) -> (&'static str, JobState) {
    timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(StateChange::JobFinished { source_id, state, .. }) => return (source_id, state),
                Ok(_) => continue,
                Err(e) => panic!("Channel error: {}", e),
            }
        }
    })
    .await
    .expect("Timeout waiting for a job to finish")
}

#[tokio::test]
async fn test_start_schedules_network_sources_only() {
    let t = build(ok_fetcher(), |_| {});
    t.engine.start().await.unwrap();

    let installed = t.host.installed();
    assert_eq!(installed.len(), 3);
    for id in ["farsiland", "farsiplex", "namakade"] {
        assert_eq!(
            installed.get(&format!("catalog-sync-{}", id)),
            Some(&JobSpec::periodic(360, 120))
        );
    }
    assert_eq!(t.host.enqueued_for("imvbox"), 0);
    assert_eq!(t.backend.ops(), vec!["open:farsiland", "probe:farsiland"]);

    t.engine.shutdown().await;
}

#[tokio::test]
async fn test_start_twice_fails() {
    let t = build(ok_fetcher(), |_| {});
    t.engine.start().await.unwrap();
    assert!(t.engine.start().await.is_err());
    t.engine.shutdown().await;
}

#[tokio::test]
async fn test_start_uses_persisted_active_source() {
    let t = build(ok_fetcher(), |settings| {
        settings.set_active_source("namakade").unwrap();
    });
    t.engine.start().await.unwrap();

    assert_eq!(t.engine.active_source().id, "namakade");
    assert_eq!(t.backend.ops()[0], "open:namakade");
    t.engine.shutdown().await;
}

#[tokio::test]
async fn test_unknown_persisted_source_falls_back_to_default() {
    let t = build(ok_fetcher(), |settings| {
        settings.set_active_source("retired-source").unwrap();
    });
    assert_eq!(t.engine.active_source().id, "farsiland");
}

#[tokio::test]
async fn test_start_resumes_pending_emergency() {
    let t = build(ok_fetcher(), |settings| {
        settings.record_sync_success("farsiland", 5).unwrap();
        settings.mark_emergency_resync("farsiland").unwrap();
    });
    let mut rx = t.engine.subscribe();

    t.engine.start().await.unwrap();

    assert_eq!(next_job_finished(&mut rx).await, ("farsiland", JobState::Succeeded));
    let state = t.engine.state();
    let job = state.latest_job("farsiland").unwrap();
    assert_eq!(job.trigger, SyncTrigger::Emergency);
    assert!(!state.emergency_pending);

    let persisted = t.settings.snapshot();
    assert!(!persisted.emergency_resync_pending);
    assert!(persisted.source("farsiland").last_sync_timestamp > 5);

    t.engine.shutdown().await;
}

#[tokio::test]
async fn test_corrupted_store_at_startup_is_recovered_and_resynced() {
    let t = build(ok_fetcher(), |_| {});
    t.backend.fail(|f| f.probe = true);
    let mut rx = t.engine.subscribe();

    t.engine.start().await.unwrap();

    assert_eq!(next_job_finished(&mut rx).await, ("farsiland", JobState::Succeeded));
    assert_eq!(
        t.backend.ops(),
        vec![
            "open:farsiland",
            "probe:farsiland",
            "close:farsiland",
            "delete:farsiland",
            "open:farsiland",
            "merge:farsiland",
        ]
    );
    assert_eq!(t.backend.movie_urls("farsiland").len(), 2);
    assert!(!t.settings.snapshot().emergency_resync_pending);

    t.engine.shutdown().await;
}

#[tokio::test]
async fn test_persisted_fatal_flag_is_restored() {
    let t = build(ok_fetcher(), |settings| {
        settings.set_fatal("imvbox store destroyed").unwrap();
    });
    t.engine.start().await.unwrap();

    assert!(t.engine.is_fatal());
    assert_eq!(t.engine.state().fatal.as_deref(), Some("imvbox store destroyed"));
    t.engine.shutdown().await;
}

#[tokio::test]
async fn test_sync_now_runs_every_network_source() {
    let t = build(ok_fetcher(), |_| {});
    t.engine.start().await.unwrap();

    let jobs = t.engine.sync_now(None).await.unwrap();

    let ids: Vec<_> = jobs.iter().map(|job| job.source_id).collect();
    assert_eq!(ids, vec!["farsiland", "farsiplex", "namakade"]);
    assert!(jobs[0].succeeded());
    // Only the active source has an open store
    assert_eq!(jobs[1].error_kind, Some(ErrorKind::SourceInactive));
    assert_eq!(jobs[2].error_kind, Some(ErrorKind::SourceInactive));

    let counts = t.engine.query(|store| store.counts()).await.unwrap();
    assert_eq!(counts.movies, 2);

    t.engine.shutdown().await;
}

#[tokio::test]
async fn test_sync_now_rejects_static_and_unknown_sources() {
    let t = build(ok_fetcher(), |_| {});
    t.engine.start().await.unwrap();

    let err = t.engine.sync_now(Some("imvbox")).await.unwrap_err();
    assert_eq!(
        err.downcast_ref::<SchedulerError>(),
        Some(&SchedulerError::UnsupportedOperation("imvbox"))
    );

    let err = t.engine.sync_now(Some("nowhere")).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<RegistryError>(),
        Some(RegistryError::UnknownSource(id)) if id == "nowhere"
    ));

    t.engine.shutdown().await;
}

#[tokio::test]
async fn test_update_sync_config_persists_raw_and_schedules_normalized() {
    let t = build(ok_fetcher(), |_| {});
    t.engine.start().await.unwrap();

    t.engine.update_sync_config("farsiplex", true, 10).unwrap();
    assert_eq!(t.settings.sync_config("farsiplex").interval_minutes, 10);
    assert_eq!(
        t.host.installed().get("catalog-sync-farsiplex"),
        Some(&JobSpec::periodic(15, 5))
    );
    assert_eq!(
        t.engine.state().schedules.get("farsiplex").copied(),
        Some(15)
    );

    t.engine.update_sync_config("farsiplex", false, 10).unwrap();
    assert!(t.host.installed().get("catalog-sync-farsiplex").is_none());

    let err = t.engine.update_sync_config("imvbox", true, 60).unwrap_err();
    assert!(err.downcast_ref::<SchedulerError>().is_some());

    t.engine.shutdown().await;
}

#[tokio::test]
async fn test_switch_source_through_engine() {
    let t = build(ok_fetcher(), |_| {});
    t.engine.start().await.unwrap();

    assert!(t.engine.switch_source("farsiplex").await.unwrap());
    assert_eq!(t.engine.active_source().id, "farsiplex");
    assert!(!t.engine.switch_source("farsiplex").await.unwrap());
    assert!(t.engine.switch_source("nowhere").await.is_err());

    let job = t.engine.sync_now(Some("farsiplex")).await.unwrap().remove(0);
    assert!(job.succeeded());

    t.engine.shutdown().await;
}

#[tokio::test]
async fn test_query_runs_off_the_async_worker() {
    let t = build(ok_fetcher(), |_| {});
    t.engine.start().await.unwrap();
    let (release, released) = std::sync::mpsc::channel::<()>();

    // The read blocks until a task on this runtime lets it go
    let (counts, _) = timeout(Duration::from_secs(5), async {
        tokio::join!(
            t.engine.query(move |store| {
                released.recv().ok();
                store.counts()
            }),
            async move {
                tokio::task::yield_now().await;
                release.send(()).unwrap();
            }
        )
    })
    .await
    .expect("query blocked the runtime");
    assert_eq!(counts.unwrap().movies, 0);

    t.engine.shutdown().await;
}

#[tokio::test]
async fn test_query_failure_is_escalated_to_recovery() {
    let t = build(ok_fetcher(), |_| {});
    t.engine.start().await.unwrap();
    t.backend.fail(|f| f.probe = true);
    let mut rx = t.engine.subscribe();

    let result: Result<(), StoreError> = t
        .engine
        .query(|_| Err(StoreError::Io(std::io::Error::other("malformed page"))))
        .await;
    assert!(result.is_err());

    // Recovery resets the store and the emergency resync refills it
    assert_eq!(next_job_finished(&mut rx).await, ("farsiland", JobState::Succeeded));
    assert_eq!(t.backend.ops_named("delete"), vec!["delete:farsiland"]);
    assert_eq!(
        t.engine.state().latest_job("farsiland").map(|j| j.trigger),
        Some(SyncTrigger::Emergency)
    );
    assert_eq!(t.backend.movie_urls("farsiland").len(), 2);
    assert!(!t.settings.snapshot().emergency_resync_pending);

    t.engine.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_cancels_timers_and_closes_store() {
    let t = build(Arc::new(StaticFetcher(Ok(CatalogSnapshot::default()))), |_| {});
    t.engine.start().await.unwrap();

    t.engine.shutdown().await;

    assert!(t.engine.scheduler().is_shut_down());
    assert!(t.host.calls().contains(&HostCall::CancelAll));
    assert_eq!(t.backend.ops().last().map(String::as_str), Some("close:farsiland"));
}
