use anyhow::{Context, Result};
use camino::Utf8Path;
use std::fs;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

/// How log output is shaped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogOptions {
    /// Debug level instead of info when `RUST_LOG` is unset
    pub debug: bool,
    /// Also log to the console
    pub console: bool,
    /// Write the log file as one JSON object per line
    pub json: bool,
}

fn default_filter(debug: bool) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "info" }))
}

/// Setup logging with a daily rotating file appender in `log_dir`.
///
/// # Arguments
/// * `log_dir` - Directory for log files, created if missing
/// * `log_prefix` - Prefix for log files (e.g., "catalog-sync")
/// * `options` - Level, console echo and file format
///
/// # Returns
/// A guard that must be held for the duration of the program to keep logging active
pub fn setup_logging(log_dir: &Utf8Path, log_prefix: &str, options: LogOptions) -> Result<WorkerGuard> {
    if !log_dir.exists() {
        fs::create_dir_all(log_dir)
            .with_context(|| format!("Failed to create log directory: {}", log_dir))?;
    }

    let file_appender = rolling::daily(log_dir, log_prefix);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false) // No ANSI codes in log files
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);
    let file_layer = if options.json {
        file_layer.json().boxed()
    } else {
        file_layer.boxed()
    };

    let console_layer = options
        .console
        .then(|| tracing_subscriber::fmt::layer().with_ansi(true).with_target(false));

    tracing_subscriber::registry()
        .with(default_filter(options.debug))
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .context("A global tracing subscriber is already installed")?;

    tracing::info!(
        "Logging initialized: dir={}, prefix={}, debug={}, console={}, json={}",
        log_dir,
        log_prefix,
        options.debug,
        options.console,
        options.json
    );

    Ok(guard)
}
