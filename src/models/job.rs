use super::catalog::MergeStats;
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;

/// What caused a sync job to be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncTrigger {
    Periodic,
    Manual,
    Emergency,
}

impl fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Periodic => "periodic",
            Self::Manual => "manual",
            Self::Emergency => "emergency",
        };
        f.write_str(s)
    }
}

/// Lifecycle of a [`SyncJob`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Recorded reason for a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Transport failure; retried on the next scheduled tick.
    NetworkError,
    /// The remote answered with something we could not decode. Not retried automatically.
    ParseError,
    /// The remote is reachable but not serving the catalog.
    RemoteUnavailable,
    /// Fetcher failure that fits none of the above.
    UnknownFetchError,
    /// Local store write or read failed; escalated to recovery.
    StorageError,
    /// The run was cancelled (source switched away, or shutdown).
    Cancelled,
    /// The run targeted a source that is not the active one.
    SourceInactive,
    /// The source cannot be synced over the network.
    UnsupportedOperation,
}

impl ErrorKind {
    /// Whether the next periodic tick is expected to succeed without intervention.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NetworkError | Self::RemoteUnavailable | Self::Cancelled | Self::SourceInactive
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NetworkError => "network_error",
            Self::ParseError => "parse_error",
            Self::RemoteUnavailable => "remote_unavailable",
            Self::UnknownFetchError => "unknown_fetch_error",
            Self::StorageError => "storage_error",
            Self::Cancelled => "cancelled",
            Self::SourceInactive => "source_inactive",
            Self::UnsupportedOperation => "unsupported_operation",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One attempt to synchronize one source.
///
/// Only the latest job per source is retained (see [`crate::state::SyncState`]).
/// Transitions are one-way: `Pending -> Running -> {Succeeded, Failed}`; the
/// transition methods return `false` and leave the job untouched when called
/// out of order.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncJob {
    pub source_id: &'static str,
    pub trigger: SyncTrigger,
    pub state: JobState,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub merge_stats: Option<MergeStats>,
}

impl SyncJob {
    pub fn pending(source_id: &'static str, trigger: SyncTrigger) -> Self {
        Self {
            source_id,
            trigger,
            state: JobState::Pending,
            started_at: None,
            completed_at: None,
            error_kind: None,
            error_message: None,
            merge_stats: None,
        }
    }

    pub fn start(&mut self) -> bool {
        if self.state != JobState::Pending {
            return false;
        }
        self.state = JobState::Running;
        self.started_at = Some(Utc::now());
        true
    }

    pub fn succeed(&mut self, stats: MergeStats) -> bool {
        if self.state != JobState::Running {
            return false;
        }
        self.state = JobState::Succeeded;
        self.completed_at = Some(Utc::now());
        self.merge_stats = Some(stats);
        true
    }

    pub fn fail(&mut self, kind: ErrorKind, message: impl Into<String>) -> bool {
        if self.state != JobState::Running {
            return false;
        }
        self.state = JobState::Failed;
        self.completed_at = Some(Utc::now());
        self.error_kind = Some(kind);
        self.error_message = Some(message.into());
        true
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn succeeded(&self) -> bool {
        self.state == JobState::Succeeded
    }

    /// Wall time between start and completion, if both happened.
    pub fn duration(&self) -> Option<Duration> {
        let (start, end) = (self.started_at?, self.completed_at?);
        (end - start).to_std().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions_happen_once() {
        let mut job = SyncJob::pending("farsiland", SyncTrigger::Manual);
        assert!(job.start());
        assert!(!job.start());
        assert!(job.succeed(MergeStats::default()));
        assert!(!job.fail(ErrorKind::NetworkError, "late"));
        assert_eq!(job.state, JobState::Succeeded);
        assert!(job.error_kind.is_none());
        assert!(job.duration().is_some());
    }

    #[test]
    fn test_cannot_finish_pending_job() {
        let mut job = SyncJob::pending("farsiland", SyncTrigger::Periodic);
        assert!(!job.succeed(MergeStats::default()));
        assert!(!job.fail(ErrorKind::Cancelled, "cancelled"));
        assert_eq!(job.state, JobState::Pending);
    }

    #[test]
    fn test_fail_records_kind() {
        let mut job = SyncJob::pending("farsiplex", SyncTrigger::Emergency);
        job.start();
        job.fail(ErrorKind::ParseError, "bad json");
        assert_eq!(job.error_kind, Some(ErrorKind::ParseError));
        assert_eq!(job.error_message.as_deref(), Some("bad json"));
        assert!(job.is_terminal());
    }

    #[test]
    fn test_transient_kinds() {
        assert!(ErrorKind::NetworkError.is_transient());
        assert!(!ErrorKind::ParseError.is_transient());
        assert!(!ErrorKind::StorageError.is_transient());
    }
}
