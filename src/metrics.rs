// Sync metrics module
//
// Lightweight counters for how the engine has been doing since startup

use crate::models::{ErrorKind, SyncJob};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Engine-wide sync metrics
///
/// Uses atomic operations for thread-safe tracking without locks.
/// Logged on shutdown.
#[derive(Debug)]
pub struct Metrics {
    pub jobs_succeeded: AtomicUsize,

    pub jobs_failed: AtomicUsize,

    /// Failed jobs whose kind was `Cancelled`. Also counted in `jobs_failed`.
    pub jobs_cancelled: AtomicUsize,

    /// Trigger requests that joined an in-flight run instead of starting one
    pub coalesced_requests: AtomicU64,

    pub emergency_triggers: AtomicU64,

    /// Stores closed, deleted and flagged for resync
    pub recoveries: AtomicU64,

    /// Recoveries that ended in the fatal state
    pub fatal_recoveries: AtomicU64,

    /// Entities inserted or updated by successful merges
    pub entities_merged: AtomicU64,

    /// Wall time of finished jobs in milliseconds
    pub total_sync_time_ms: AtomicU64,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            jobs_succeeded: AtomicUsize::new(0),
            jobs_failed: AtomicUsize::new(0),
            jobs_cancelled: AtomicUsize::new(0),
            coalesced_requests: AtomicU64::new(0),
            emergency_triggers: AtomicU64::new(0),
            recoveries: AtomicU64::new(0),
            fatal_recoveries: AtomicU64::new(0),
            entities_merged: AtomicU64::new(0),
            total_sync_time_ms: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a job that reached its terminal state
    pub fn record_job(&self, job: &SyncJob) {
        if job.succeeded() {
            self.jobs_succeeded.fetch_add(1, Ordering::Relaxed);
            if let Some(stats) = job.merge_stats {
                self.entities_merged
                    .fetch_add(stats.total() as u64, Ordering::Relaxed);
            }
        } else {
            self.jobs_failed.fetch_add(1, Ordering::Relaxed);
            if job.error_kind == Some(ErrorKind::Cancelled) {
                self.jobs_cancelled.fetch_add(1, Ordering::Relaxed);
            }
        }
        if let Some(duration) = job.duration() {
            self.record_sync_time(duration);
        }
    }

    pub fn record_sync_time(&self, duration: Duration) {
        self.total_sync_time_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_coalesced(&self) {
        self.coalesced_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_emergency_trigger(&self) {
        self.emergency_triggers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recovery(&self, fatal: bool) {
        self.recoveries.fetch_add(1, Ordering::Relaxed);
        if fatal {
            self.fatal_recoveries.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Average wall time per finished job in milliseconds
    pub fn avg_sync_time_ms(&self) -> f64 {
        let total = self.total_sync_time_ms.load(Ordering::Relaxed);
        let count = self.jobs_succeeded.load(Ordering::Relaxed) + self.jobs_failed.load(Ordering::Relaxed);
        if count > 0 {
            total as f64 / count as f64
        } else {
            0.0
        }
    }

    pub fn log_summary(&self) {
        tracing::info!("=== Sync Metrics Summary ===");
        tracing::info!("Uptime: {:.2}s", self.uptime().as_secs_f64());
        tracing::info!(
            "Jobs: {} succeeded, {} failed ({} cancelled), {} coalesced requests",
            self.jobs_succeeded.load(Ordering::Relaxed),
            self.jobs_failed.load(Ordering::Relaxed),
            self.jobs_cancelled.load(Ordering::Relaxed),
            self.coalesced_requests.load(Ordering::Relaxed)
        );
        tracing::info!(
            "Total sync time: {:.2}s (avg: {:.2}ms per job), {} entities merged",
            self.total_sync_time_ms.load(Ordering::Relaxed) as f64 / 1000.0,
            self.avg_sync_time_ms(),
            self.entities_merged.load(Ordering::Relaxed)
        );
        tracing::info!(
            "Recoveries: {} ({} fatal), emergency triggers: {}",
            self.recoveries.load(Ordering::Relaxed),
            self.fatal_recoveries.load(Ordering::Relaxed),
            self.emergency_triggers.load(Ordering::Relaxed)
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
