use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

/// Stage of a running scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanPhase {
    Idle,
    Recovering,
    Reconciling,
    Evaluating,
    Transferring,
    Finished,
}

impl ScanPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanPhase::Idle => "idle",
            ScanPhase::Recovering => "recovering",
            ScanPhase::Reconciling => "reconciling",
            ScanPhase::Evaluating => "evaluating",
            ScanPhase::Transferring => "transferring",
            ScanPhase::Finished => "finished",
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ScanPhase::Recovering,
            2 => ScanPhase::Reconciling,
            3 => ScanPhase::Evaluating,
            4 => ScanPhase::Transferring,
            5 => ScanPhase::Finished,
            _ => ScanPhase::Idle,
        }
    }
}

impl std::fmt::Display for ScanPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live counters of one scan, shared between the worker and readers.
#[derive(Debug, Default)]
pub struct ScanProgress {
    files_processed: AtomicU64,
    total_estimate: AtomicU64,
    phase: AtomicU8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub files_processed: u64,
    pub total_estimate: u64,
    pub phase: ScanPhase,
}

impl ScanProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_phase(&self, phase: ScanPhase) {
        self.phase.store(phase as u8, Ordering::SeqCst);
    }

    pub fn set_total(&self, total: u64) {
        self.total_estimate.store(total, Ordering::SeqCst);
    }

    pub fn add_total(&self, n: u64) {
        self.total_estimate.fetch_add(n, Ordering::SeqCst);
    }

    pub fn file_done(&self) {
        self.files_processed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            files_processed: self.files_processed.load(Ordering::SeqCst),
            total_estimate: self.total_estimate.load(Ordering::SeqCst),
            phase: ScanPhase::from_u8(self.phase.load(Ordering::SeqCst)),
        }
    }
}

/// Trait for reporting scan progress.
///
/// The CLI implements it with indicatif bars. All methods have default no-op
/// implementations.
pub trait ProgressReporter: Send + Sync {
    fn on_scan_start(&self, _root_id: i64, _root_path: &str) {}
    fn on_phase(&self, _root_id: i64, _phase: ScanPhase) {}
    fn on_file(&self, _root_id: i64, _processed: u64, _total: u64) {}
    fn on_transfer(&self, _root_id: i64, _rel_path: &str, _bytes: u64) {}
    fn on_scan_complete(&self, _root_id: i64, _duration_secs: f64) {}
}

/// No-op progress reporter for silent operation.
pub struct SilentReporter;

impl ProgressReporter for SilentReporter {}
