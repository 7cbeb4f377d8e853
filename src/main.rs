//! catalog-sync - keeps a local mirror of the selected content catalog fresh.
//!
//! # Usage
//!
//! ```text
//! catalog-sync                    run the background scheduler until Ctrl-C
//! catalog-sync sync-now [SOURCE]  sync once (all network sources if omitted) and exit
//! catalog-sync sources            list known sources
//! ```
//!
//! # Execution Flow
//!
//! 1. Load settings from `<config dir>/catalog-sync.yaml` and `CATALOG_SYNC__*`
//! 2. Initialize logging -> `<log_dir>/catalog-sync.<date>`
//! 3. Create the tokio runtime
//! 4. Build the HTTP fetcher, the SQLite backend and the engine; start it
//! 5. Run the requested command
//! 6. Shut down: cancel runs, close the store, log metrics
//!
//! The config directory defaults to `catalog-sync-data` and can be moved with
//! `CATALOG_SYNC_CONFIG_DIR`. Sync state is kept in `sync-state.yaml` inside it.

use anyhow::{Context, Result, bail};
use camino::Utf8PathBuf;
use catalog_sync::logging::{self, LogOptions};
use catalog_sync::services::HttpCatalogFetcher;
use catalog_sync::store::SqliteBackend;
use catalog_sync::{APP_NAME, ConfigManager, EngineParts, SyncEngine, VERSION, registry};
use std::sync::Arc;
use std::time::Duration;

enum Command {
    Run,
    SyncNow(Option<String>),
    Sources,
}

fn parse_args() -> Result<Command> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        [] => Ok(Command::Run),
        ["sync-now"] => Ok(Command::SyncNow(None)),
        ["sync-now", source] => Ok(Command::SyncNow(Some(source.to_string()))),
        ["sources"] => Ok(Command::Sources),
        other => bail!("unrecognized arguments: {}", other.join(" ")),
    }
}

fn main() -> Result<()> {
    let command = parse_args()?;

    let config_dir = Utf8PathBuf::from(
        std::env::var("CATALOG_SYNC_CONFIG_DIR").unwrap_or_else(|_| "catalog-sync-data".to_string()),
    );
    let settings = catalog_sync::config::load_app_settings(&config_dir)?;

    let _guard = logging::setup_logging(
        &settings.log_dir,
        APP_NAME,
        LogOptions {
            debug: settings.debug,
            console: true,
            json: settings.log_json,
        },
    )?;

    tracing::info!("Starting {} v{}", APP_NAME, VERSION);

    if let Command::Sources = command {
        for source in registry::all() {
            println!(
                "{:<10} {:<10} {:<22} {:?}",
                source.id, source.display_name, source.storage_file_name, source.sync_capability
            );
        }
        return Ok(());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("catalog-sync-worker")
        .build()?;

    let result = runtime.block_on(async {
        let state_store = Arc::new(ConfigManager::new(&config_dir)?);
        let fetcher = HttpCatalogFetcher::new(
            settings.endpoints.clone(),
            Duration::from_secs(settings.http_timeout_secs),
        )
        .context("Failed to build HTTP client")?;
        let backend = SqliteBackend::new(&settings.data_dir, &settings.seed_dir)
            .with_context(|| format!("Failed to prepare data directory {}", settings.data_dir))?;

        let engine = SyncEngine::new(EngineParts {
            settings: state_store,
            fetcher: Arc::new(fetcher),
            backend: Arc::new(backend),
            floors: (&settings).into(),
            host: None,
        });
        engine.start().await?;

        if engine.is_fatal() {
            tracing::error!("Engine is in a fatal state; reinstall the bundled databases");
        }

        let outcome = match command {
            Command::SyncNow(source) => sync_now(&engine, source.as_deref()).await,
            _ => {
                tracing::info!("Running scheduler, press Ctrl-C to stop");
                tokio::signal::ctrl_c()
                    .await
                    .context("Failed to listen for Ctrl-C")
            }
        };

        engine.shutdown().await;
        outcome
    });

    runtime.shutdown_timeout(Duration::from_secs(5));
    tracing::info!("Shutdown complete");
    result
}

async fn sync_now(engine: &SyncEngine, source: Option<&str>) -> Result<()> {
    let jobs = engine.sync_now(source).await?;
    for job in &jobs {
        match (&job.error_kind, job.merge_stats) {
            (None, Some(stats)) => println!("{}: ok ({})", job.source_id, stats.summary()),
            (Some(kind), _) => println!(
                "{}: failed [{}] {}",
                job.source_id,
                kind,
                job.error_message.as_deref().unwrap_or_default()
            ),
            (None, None) => println!("{}: {:?}", job.source_id, job.state),
        }
    }

    let counts = engine.query(|store| store.counts()).await?;
    println!(
        "{} now holds {} movies, {} series, {} episodes",
        engine.active_source().display_name,
        counts.movies,
        counts.series,
        counts.episodes
    );
    Ok(())
}
