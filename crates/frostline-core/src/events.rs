use crate::reconcile::FileFailure;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanOutcome {
    Completed,
    /// Stopped between files by a cancel request.
    Cancelled,
    /// Stopped between files after the configured ceiling.
    TimedOut,
    /// Halted by a configuration problem; the root is in its error state.
    ConfigError,
    /// Fatal-per-scan failure (inventory unreachable, root unreadable).
    Aborted,
}

impl ScanOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanOutcome::Completed => "completed",
            ScanOutcome::Cancelled => "cancelled",
            ScanOutcome::TimedOut => "timed_out",
            ScanOutcome::ConfigError => "config_error",
            ScanOutcome::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for ScanOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one scan: counts and byte totals only.
#[derive(Debug, Clone, Serialize)]
pub struct ScanSummary {
    pub root_id: i64,
    pub outcome: ScanOutcome,
    pub started_at: i64,
    pub duration_ms: u64,
    pub scanned: usize,
    pub moved: usize,
    pub skipped_already_placed: usize,
    pub pinned: usize,
    pub discovered: usize,
    pub missing: usize,
    pub recovered: usize,
    pub reappeared: usize,
    pub conflicts: usize,
    pub busy: usize,
    pub bytes_moved: u64,
    /// Files waiting on a location that was unavailable or full.
    pub pending_by_location: BTreeMap<String, usize>,
    pub failures: Vec<FileFailure>,
    /// Why the scan stopped early, when it did.
    pub error: Option<String>,
}

impl ScanSummary {
    pub fn new(root_id: i64, started_at: i64) -> Self {
        Self {
            root_id,
            outcome: ScanOutcome::Completed,
            started_at,
            duration_ms: 0,
            scanned: 0,
            moved: 0,
            skipped_already_placed: 0,
            pinned: 0,
            discovered: 0,
            missing: 0,
            recovered: 0,
            reappeared: 0,
            conflicts: 0,
            busy: 0,
            bytes_moved: 0,
            pending_by_location: BTreeMap::new(),
            failures: Vec::new(),
            error: None,
        }
    }

    pub fn errors(&self) -> usize {
        self.failures.len()
    }
}

/// Consumer of scan summaries (notifications, statistics).
pub trait ScanEventSink: Send + Sync {
    fn on_summary(&self, summary: &ScanSummary);
}

/// Default sink: one log line per scan.
pub struct LogSink;

impl ScanEventSink for LogSink {
    fn on_summary(&self, s: &ScanSummary) {
        if s.outcome == ScanOutcome::Completed {
            info!(
                "Scan of root {} completed in {}ms: {} scanned, {} moved ({} bytes), {} already placed, {} pinned, {} errors",
                s.root_id,
                s.duration_ms,
                s.scanned,
                s.moved,
                s.bytes_moved,
                s.skipped_already_placed,
                s.pinned,
                s.errors()
            );
        } else {
            warn!(
                "Scan of root {} ended {}: {} ({} scanned, {} moved, {} errors)",
                s.root_id,
                s.outcome,
                s.error.as_deref().unwrap_or("no detail"),
                s.scanned,
                s.moved,
                s.errors()
            );
        }
    }
}
