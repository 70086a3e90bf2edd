//! Scan orchestration: per monitored root, Reconciler -> Criteria Evaluator
//! -> File Operator under the root's exclusive lock, plus the manual entry
//! operations (freeze, thaw, pin) under per-entry locks.

use crate::cancel::CancellationToken;
use crate::clock::{Clock, SystemClock};
use crate::config::AppConfig;
use crate::criteria::{self, Criterion, Decision};
use crate::error::{Error, ErrorClass};
use crate::events::{LogSink, ScanEventSink, ScanOutcome, ScanSummary};
use crate::fileop::FileOperator;
use crate::inventory::{Inventory, RootSnapshot};
use crate::locks::LockTable;
use crate::probe::{FileMetadata, FsProber, MetadataProber};
use crate::progress::{ProgressReporter, ScanPhase, ScanProgress, SilentReporter};
use crate::reconcile::{FileFailure, Reconciler};
use crate::scanner;
use crate::storage::models::*;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Result of `undo_root`.
#[derive(Debug, Default)]
pub struct UndoSummary {
    pub restored: usize,
    pub failures: Vec<FileFailure>,
    /// Configuration rows were deleted (only when every file came back).
    pub removed: bool,
}

pub struct ScanOrchestrator {
    pub(crate) inventory: Arc<Inventory>,
    pub(crate) prober: Arc<dyn MetadataProber>,
    pub(crate) operator: FileOperator,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) root_locks: LockTable<i64>,
    pub(crate) entry_locks: LockTable<i64>,
    sink: Arc<dyn ScanEventSink>,
    reporter: Arc<dyn ProgressReporter>,
    scan_timeout: Option<Duration>,
    reconcile_passes: AtomicU64,
}

impl ScanOrchestrator {
    pub fn new(inventory: Arc<Inventory>, config: &AppConfig) -> Self {
        Self {
            inventory,
            prober: Arc::new(FsProber),
            operator: FileOperator::new(config.link_rewrites.clone()),
            clock: Arc::new(SystemClock),
            root_locks: LockTable::new(),
            entry_locks: LockTable::new(),
            sink: Arc::new(LogSink),
            reporter: Arc::new(SilentReporter),
            scan_timeout: config.scan_timeout_secs.map(Duration::from_secs),
            reconcile_passes: AtomicU64::new(0),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_prober(mut self, prober: Arc<dyn MetadataProber>) -> Self {
        self.prober = prober;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ScanEventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_scan_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.scan_timeout = timeout;
        self
    }

    pub fn inventory(&self) -> &Arc<Inventory> {
        &self.inventory
    }

    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    /// Number of reconciliation passes run so far.
    pub fn reconcile_passes(&self) -> u64 {
        self.reconcile_passes.load(Ordering::SeqCst)
    }

    pub fn is_scanning(&self, root_id: i64) -> bool {
        self.root_locks.is_held(&root_id)
    }

    // ── Scans ────────────────────────────────────────────────────

    /// Run one scan of `root_id`. Never blocks on the root lock: a scan
    /// already holding it yields `Error::ScanInProgress`. Every other outcome,
    /// including configuration and fatal-per-scan failures, is reported in
    /// the returned summary.
    pub fn run_scan(
        &self,
        root_id: i64,
        cancel: &CancellationToken,
        progress: &ScanProgress,
    ) -> Result<ScanSummary, Error> {
        let Some(_root_guard) = self.root_locks.try_acquire(root_id) else {
            info!("Scan of root {} already in progress, skipping", root_id);
            return Err(Error::ScanInProgress(root_id));
        };
        let root = self.inventory.root(root_id)?;

        let started = Instant::now();
        let now = self.clock.now();
        let mut summary = ScanSummary::new(root_id, now);
        info!("Scanning root {} ({})", root_id, root.path);
        self.reporter.on_scan_start(root_id, &root.path);

        let run_id = match self.inventory.begin_scan_run(root_id) {
            Ok(id) => Some(id),
            Err(e) => {
                error!("Could not record scan run for root {}: {}", root_id, e);
                None
            }
        };

        if let Err(err) = self.scan_locked(root_id, now, started, cancel, progress, &mut summary) {
            summary.error = Some(err.to_string());
            summary.outcome = match err.class() {
                _ if matches!(err, Error::Cancelled) => ScanOutcome::Cancelled,
                ErrorClass::Configuration => {
                    if !matches!(err, Error::RootInErrorState(..)) {
                        if let Err(e) = self.inventory.set_root_error(root_id, &err.to_string()) {
                            error!("Could not flag root {}: {}", root_id, e);
                        }
                    }
                    ScanOutcome::ConfigError
                }
                _ => {
                    error!("Scan of root {} aborted: {}", root_id, err);
                    ScanOutcome::Aborted
                }
            };
        }

        progress.set_phase(ScanPhase::Finished);
        self.reporter.on_phase(root_id, ScanPhase::Finished);
        summary.duration_ms = started.elapsed().as_millis() as u64;

        if let Some(run_id) = run_id {
            let detail = serde_json::to_string(&summary).unwrap_or_default();
            if let Err(e) = self.inventory.write(|db| {
                db.complete_scan_run(
                    run_id,
                    summary.outcome.as_str(),
                    summary.scanned as i64,
                    summary.moved as i64,
                    summary.skipped_already_placed as i64,
                    summary.errors() as i64,
                    summary.bytes_moved as i64,
                    &detail,
                )
            }) {
                error!("Could not persist scan run {}: {}", run_id, e);
            }
        }

        self.sink.on_summary(&summary);
        self.reporter
            .on_scan_complete(root_id, started.elapsed().as_secs_f64());
        Ok(summary)
    }

    fn scan_locked(
        &self,
        root_id: i64,
        now: i64,
        started: Instant,
        cancel: &CancellationToken,
        progress: &ScanProgress,
        summary: &mut ScanSummary,
    ) -> Result<(), Error> {
        let snap = self.inventory.root_snapshot(root_id)?;
        if let Some(reason) = &snap.root.error_state {
            return Err(Error::RootInErrorState(root_id, reason.clone()));
        }
        // Fail closed: one malformed criterion halts the whole root.
        let criteria = criteria::compile(&snap.criteria)?;
        if snap.locations.is_empty() {
            return Err(Error::Misconfigured(format!(
                "root {} has no storage locations",
                root_id
            )));
        }

        let reconciler = Reconciler::new(
            &self.inventory,
            self.prober.as_ref(),
            &self.operator,
            &self.entry_locks,
        );

        self.enter_phase(root_id, progress, ScanPhase::Recovering);
        summary.recovered = reconciler.recover_interrupted(&snap, now)?;

        let deadline = self.scan_timeout.map(|t| started + t);
        self.enter_phase(root_id, progress, ScanPhase::Reconciling);
        let report = reconciler.reconcile(&snap, now, cancel, deadline, progress)?;
        self.reconcile_passes.fetch_add(1, Ordering::SeqCst);

        summary.discovered = report.discovered;
        summary.missing = report.missing;
        summary.reappeared = report.reappeared;
        summary.conflicts = report.conflicts;
        summary.busy = report.busy;
        summary.failures.extend(report.failures);
        summary.scanned = report.moved_in_place;
        // EVICT on an entry already MOVED: nothing to do.
        summary.skipped_already_placed = report.moved_in_place;
        if report.timed_out {
            self.time_limit_reached(root_id, summary);
            return Ok(());
        }

        self.enter_phase(root_id, progress, ScanPhase::Evaluating);
        let pinned = self.inventory.pinned_paths(root_id)?;
        let total = report.candidates.len() as u64;
        progress.add_total(total);

        for (i, (entry, meta)) in report.candidates.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                self.time_limit_reached(root_id, summary);
                return Ok(());
            }

            progress.file_done();
            self.reporter.on_file(root_id, i as u64 + 1, total);
            summary.scanned += 1;

            if pinned.contains(&entry.rel_path) {
                debug!("{} is pinned", entry.rel_path);
                summary.pinned += 1;
                continue;
            }

            match criteria::evaluate(meta, &criteria, now) {
                Decision::Keep => {
                    // KEEP on an ACTIVE entry: already placed.
                    summary.skipped_already_placed += 1;
                }
                Decision::Evict => {
                    log_unmet(entry, meta, &criteria, now);
                    self.enter_phase(root_id, progress, ScanPhase::Transferring);
                    self.evict(&snap, entry, now, summary)?;
                    self.enter_phase(root_id, progress, ScanPhase::Evaluating);
                }
            }
        }

        Ok(())
    }

    fn time_limit_reached(&self, root_id: i64, summary: &mut ScanSummary) {
        warn!("Scan of root {} hit its time limit", root_id);
        summary.outcome = ScanOutcome::TimedOut;
        summary.error = Some("scan time limit reached".to_string());
    }

    fn enter_phase(&self, root_id: i64, progress: &ScanProgress, phase: ScanPhase) {
        progress.set_phase(phase);
        self.reporter.on_phase(root_id, phase);
    }

    /// Move one ACTIVE entry to the first location that accepts it. Per-file
    /// failures land in the summary; only fatal-per-scan errors propagate.
    fn evict(
        &self,
        snap: &RootSnapshot,
        entry: &InventoryEntry,
        now: i64,
        summary: &mut ScanSummary,
    ) -> Result<(), Error> {
        let Some(_guard) = self.entry_locks.try_acquire(entry.id) else {
            summary.busy += 1;
            return Ok(());
        };

        let mut failure = None;
        for location in &snap.locations {
            match self.transfer(&snap.root, entry, location, now) {
                Ok((_, bytes)) => {
                    summary.moved += 1;
                    summary.bytes_moved += bytes;
                    self.reporter.on_transfer(snap.root.id, &entry.rel_path, bytes);
                    return Ok(());
                }
                Err(err @ (Error::DestinationUnavailable(_) | Error::InsufficientSpace { .. })) => {
                    *summary
                        .pending_by_location
                        .entry(location.name.clone())
                        .or_insert(0) += 1;
                    failure = Some(err);
                }
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        let Some(err) = failure else {
            return Ok(());
        };
        if err.class() == ErrorClass::FatalPerScan {
            return Err(err);
        }
        match err.class() {
            ErrorClass::Transient => warn!("Deferring {}: {}", entry.rel_path, err),
            _ => error!("Failed to move {}: {}", entry.rel_path, err),
        }
        self.inventory
            .set_entry_error(entry.id, Some(&err.to_string()))?;
        summary.failures.push(FileFailure::new(&entry.rel_path, &err));
        Ok(())
    }

    /// ACTIVE -> MIGRATING -> MOVED around one physical transfer. On failure
    /// the entry is settled from what is actually on disk. The location is
    /// re-read first so a flag flipped mid-scan is honoured.
    fn transfer(
        &self,
        root: &MonitoredRoot,
        entry: &InventoryEntry,
        location: &StorageLocation,
        now: i64,
    ) -> Result<(InventoryEntry, u64), Error> {
        let location = &self.inventory.location(location.id)?;
        self.operator
            .check_space(location, entry.size.max(0) as u64)?;

        let hot = entry.hot_path(root);
        let cold = entry.cold_path(location);
        let migrating = self.inventory.transition(
            entry,
            FileStatus::Migrating,
            Tier::Hot,
            Some(location.id),
            None,
            now,
        )?;

        match self.operator.apply(root.mode, &hot, location, &cold) {
            Ok(transfer) => {
                let moved = self.inventory.transition(
                    &migrating,
                    FileStatus::Moved,
                    Tier::Cold,
                    Some(location.id),
                    None,
                    now,
                )?;
                debug!("{} -> {}", hot.display(), transfer.destination.display());
                Ok((moved, transfer.bytes))
            }
            Err(err) => {
                self.settle(&migrating, &hot, &cold, location, &err, now)?;
                Err(err)
            }
        }
    }

    fn settle(
        &self,
        migrating: &InventoryEntry,
        hot: &Path,
        cold: &Path,
        location: &StorageLocation,
        err: &Error,
        now: i64,
    ) -> Result<(), Error> {
        let message = err.to_string();
        let hot_is_file = fs::symlink_metadata(hot)
            .map(|m| m.file_type().is_file())
            .unwrap_or(false);
        let cold_is_file = fs::symlink_metadata(cold)
            .map(|m| m.file_type().is_file())
            .unwrap_or(false);

        let (status, tier, location_id) = if hot_is_file {
            (FileStatus::Active, Tier::Hot, None)
        } else if cold_is_file {
            (FileStatus::Moved, Tier::Cold, Some(location.id))
        } else {
            (FileStatus::Missing, Tier::Hot, None)
        };
        self.inventory
            .transition(migrating, status, tier, location_id, Some(&message), now)?;
        Ok(())
    }

    // ── Manual operations ────────────────────────────────────────

    /// Move an ACTIVE entry to an explicit location, optionally pinning it.
    pub fn freeze(&self, entry_id: i64, location_id: i64, pin: bool) -> Result<InventoryEntry, Error> {
        let _guard = self
            .entry_locks
            .try_acquire(entry_id)
            .ok_or(Error::EntryBusy(entry_id))?;
        let entry = self.inventory.entry(entry_id)?;
        let root = self.inventory.root(entry.root_id)?;
        let location = self.inventory.location(location_id)?;
        let now = self.clock.now();

        let frozen = match entry.status {
            FileStatus::Active => {
                let (moved, bytes) = self.transfer(&root, &entry, &location, now)?;
                info!(
                    "Froze {} to '{}' ({} bytes)",
                    entry.rel_path, location.name, bytes
                );
                moved
            }
            FileStatus::Moved if entry.location_id == Some(location_id) => entry,
            other => {
                return Err(Error::InvalidTransition {
                    entry_id,
                    from: other.to_string(),
                    to: FileStatus::Moved.to_string(),
                })
            }
        };

        if pin {
            self.inventory.pin(frozen.root_id, &frozen.rel_path)?;
        }
        Ok(frozen)
    }

    /// Bring a MOVED entry back to the hot tier, optionally pinning it so the
    /// next scan does not evict it again.
    pub fn thaw(&self, entry_id: i64, pin: bool) -> Result<InventoryEntry, Error> {
        let _guard = self
            .entry_locks
            .try_acquire(entry_id)
            .ok_or(Error::EntryBusy(entry_id))?;
        self.thaw_locked(entry_id, pin)
    }

    fn thaw_locked(&self, entry_id: i64, pin: bool) -> Result<InventoryEntry, Error> {
        let entry = self.inventory.entry(entry_id)?;
        match entry.status {
            FileStatus::Moved => {}
            FileStatus::Active => {
                if pin {
                    self.inventory.pin(entry.root_id, &entry.rel_path)?;
                }
                return Ok(entry);
            }
            other => {
                return Err(Error::InvalidTransition {
                    entry_id,
                    from: other.to_string(),
                    to: FileStatus::Active.to_string(),
                })
            }
        }

        let root = self.inventory.root(entry.root_id)?;
        let location_id = entry.location_id.ok_or_else(|| {
            Error::Misconfigured(format!("entry {} is cold without a location", entry_id))
        })?;
        let location = self.inventory.location(location_id)?;
        if !location.is_reachable() {
            return Err(Error::DestinationUnavailable(location.name));
        }

        let hot = entry.hot_path(&root);
        let bytes = match self
            .operator
            .restore(root.mode, &entry.cold_path(&location), &hot)
        {
            Ok(bytes) => bytes,
            Err(err @ Error::Conflict { .. }) => {
                warn!("Not thawing {}: {}", entry.rel_path, err);
                self.inventory
                    .set_entry_error(entry_id, Some(&err.to_string()))?;
                return Err(err);
            }
            Err(err) => return Err(err),
        };
        let now = self.clock.now();
        self.inventory
            .transition(&entry, FileStatus::Active, Tier::Hot, None, None, now)?;
        match self.prober.probe(&hot) {
            Ok(meta) => self.inventory.refresh(entry_id, &meta.snapshot(), now)?,
            Err(e) => warn!("Could not probe thawed {}: {}", hot.display(), e),
        }
        if pin {
            self.inventory.pin(entry.root_id, &entry.rel_path)?;
        }
        info!("Thawed {} ({} bytes)", entry.rel_path, bytes);
        self.inventory.entry(entry_id)
    }

    pub fn pin_entry(&self, entry_id: i64) -> Result<(), Error> {
        let entry = self.inventory.entry(entry_id)?;
        self.inventory.pin(entry.root_id, &entry.rel_path)
    }

    pub fn unpin_entry(&self, entry_id: i64) -> Result<(), Error> {
        let entry = self.inventory.entry(entry_id)?;
        self.inventory.unpin(entry.root_id, &entry.rel_path)
    }

    /// Stop tracking an entry (DELETED is terminal).
    pub fn forget(&self, entry_id: i64) -> Result<InventoryEntry, Error> {
        let _guard = self
            .entry_locks
            .try_acquire(entry_id)
            .ok_or(Error::EntryBusy(entry_id))?;
        self.inventory.forget(entry_id, self.clock.now())
    }

    /// Delete MISSING/DELETED rows not seen within `retention_days`.
    pub fn purge(&self, retention_days: u64) -> Result<usize, Error> {
        let retention = retention_days.saturating_mul(86_400).min(i64::MAX as u64) as i64;
        self.inventory.purge_stale(retention, self.clock.now())
    }

    /// Resolve a caller-supplied path to its inventory entry. Containment in
    /// the root is checked lexically before anything else is consulted, and a
    /// path outside the root fails exactly like an unknown one.
    pub fn lookup_path(&self, root_id: i64, path: &Path) -> Result<InventoryEntry, Error> {
        let not_found = || Error::NotFound(format!("no inventory entry for {}", path.display()));
        let root = self.inventory.root(root_id)?;
        let rel_path = contained_relative(&root.root_path(), path).ok_or_else(not_found)?;
        self.inventory
            .entry_by_path(root_id, &rel_path)?
            .ok_or_else(not_found)
    }

    /// Thaw every MOVED entry of a root, then drop the root's configuration,
    /// inventory and pins. The root stays configured if anything could not be
    /// brought back.
    pub fn undo_root(&self, root_id: i64) -> Result<UndoSummary, Error> {
        let _root_guard = self
            .root_locks
            .try_acquire(root_id)
            .ok_or(Error::ScanInProgress(root_id))?;

        let mut summary = UndoSummary::default();
        for entry in self.inventory.entries_with_status(root_id, FileStatus::Moved)? {
            let Some(_guard) = self.entry_locks.try_acquire(entry.id) else {
                summary
                    .failures
                    .push(FileFailure::new(&entry.rel_path, &Error::EntryBusy(entry.id)));
                continue;
            };
            match self.thaw_locked(entry.id, false) {
                Ok(_) => summary.restored += 1,
                Err(err) => {
                    warn!("Could not restore {}: {}", entry.rel_path, err);
                    summary.failures.push(FileFailure::new(&entry.rel_path, &err));
                }
            }
        }

        if summary.failures.is_empty() {
            self.inventory.remove_root(root_id)?;
            summary.removed = true;
            info!(
                "Undid root {}: {} files restored, configuration removed",
                root_id, summary.restored
            );
        } else {
            warn!(
                "Root {} kept: {} files could not be restored",
                root_id,
                summary.failures.len()
            );
        }
        Ok(summary)
    }
}

fn log_unmet(entry: &InventoryEntry, meta: &FileMetadata, criteria: &[Criterion], now: i64) {
    match criteria::first_unmet(meta, criteria, now) {
        Some(unmet) => debug!("Evicting {}: {} not met", entry.rel_path, unmet.kind()),
        None => debug!("Evicting {}: no criteria enabled", entry.rel_path),
    }
}

/// Lexically normalise `candidate` (relative paths are taken from `root`) and
/// return its `/`-separated path below `root`, or `None` when it escapes.
fn contained_relative(root: &Path, candidate: &Path) -> Option<String> {
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        root.join(candidate)
    };
    let normalized = lexical_normalize(&joined)?;
    let root = lexical_normalize(root)?;
    let rel = scanner::relative_path(&root, &normalized)?;
    Some(rel)
}

fn lexical_normalize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            Component::Normal(part) => out.push(part),
        }
    }
    Some(out)
}
