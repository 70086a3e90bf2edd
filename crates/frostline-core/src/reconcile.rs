//! Reconciler: diffs a fresh listing of a monitored root against the
//! inventory and resolves rows left MIGRATING by an interrupted run.

use crate::cancel::CancellationToken;
use crate::error::{Error, ErrorClass};
use crate::fileop::{self, FileOperator};
use crate::inventory::{Inventory, RootSnapshot};
use crate::locks::LockTable;
use crate::probe::{FileKind, FileMetadata, MetadataProber};
use crate::progress::ScanProgress;
use crate::scanner;
use crate::storage::models::*;
use ahash::AHashMap;
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, warn};

/// A per-file failure kept for the scan summary.
#[derive(Debug, Clone, Serialize)]
pub struct FileFailure {
    pub rel_path: String,
    pub class: ErrorClass,
    pub message: String,
}

impl FileFailure {
    pub fn new(rel_path: &str, err: &Error) -> Self {
        Self {
            rel_path: rel_path.to_string(),
            class: err.class(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub listed: usize,
    pub discovered: usize,
    pub missing: usize,
    pub refreshed: usize,
    /// MOVED entries confirmed in place.
    pub moved_in_place: usize,
    pub reappeared: usize,
    /// Hot file and cold copy both present for a MOVED entry.
    pub conflicts: usize,
    /// The scan deadline passed before the listing was fully reconciled.
    pub timed_out: bool,
    /// Entries skipped because another operation holds them.
    pub busy: usize,
    /// ACTIVE entries with fresh metadata, ready for evaluation.
    pub candidates: Vec<(InventoryEntry, FileMetadata)>,
    pub failures: Vec<FileFailure>,
}

/// What sits at one path, read with `symlink_metadata` only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Presence {
    Absent,
    File(u64),
    Link,
    Other,
}

fn presence(path: &Path) -> Presence {
    match fs::symlink_metadata(path) {
        Ok(m) if m.file_type().is_symlink() => Presence::Link,
        Ok(m) if m.file_type().is_file() => Presence::File(m.len()),
        Ok(_) => Presence::Other,
        Err(_) => Presence::Absent,
    }
}

pub struct Reconciler<'a> {
    inventory: &'a Inventory,
    prober: &'a dyn MetadataProber,
    operator: &'a FileOperator,
    entry_locks: &'a LockTable<i64>,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        inventory: &'a Inventory,
        prober: &'a dyn MetadataProber,
        operator: &'a FileOperator,
        entry_locks: &'a LockTable<i64>,
    ) -> Self {
        Self {
            inventory,
            prober,
            operator,
            entry_locks,
        }
    }

    /// Resolve every MIGRATING row of the root by re-probing both possible
    /// locations. Returns the number of rows resolved.
    pub fn recover_interrupted(&self, snap: &RootSnapshot, now: i64) -> Result<usize, Error> {
        let stuck = self
            .inventory
            .entries_with_status(snap.root.id, FileStatus::Migrating)?;
        let mut resolved = 0;

        for entry in stuck {
            // A held lock means the transfer is live, not interrupted.
            let Some(_guard) = self.entry_locks.try_acquire(entry.id) else {
                continue;
            };
            self.recover_entry(snap, &entry, now)?;
            resolved += 1;
        }

        if resolved > 0 {
            info!(
                "Resolved {} interrupted transfers under {}",
                resolved, snap.root.path
            );
        }
        Ok(resolved)
    }

    fn recover_entry(
        &self,
        snap: &RootSnapshot,
        entry: &InventoryEntry,
        now: i64,
    ) -> Result<(), Error> {
        let hot = entry.hot_path(&snap.root);
        let location = match entry.location_id {
            Some(id) => self.inventory.read(|db| db.get_location(id))?,
            None => None,
        };

        let Some(location) = location.filter(|l| l.is_reachable()) else {
            return if matches!(presence(&hot), Presence::File(_)) {
                warn!(
                    "Rolling back interrupted transfer of {}: destination unreachable",
                    hot.display()
                );
                self.inventory
                    .transition(
                        entry,
                        FileStatus::Active,
                        Tier::Hot,
                        None,
                        Some("interrupted transfer rolled back"),
                        now,
                    )
                    .map(|_| ())
            } else {
                // The cold copy may still surface once the location returns.
                self.inventory
                    .transition(
                        entry,
                        FileStatus::Missing,
                        Tier::Cold,
                        entry.location_id,
                        Some("interrupted transfer, destination unreachable"),
                        now,
                    )
                    .map(|_| ())
            };
        };

        let cold = entry.cold_path(&location);
        fileop::discard(&fileop::staging_path(&cold));

        match (presence(&hot), presence(&cold)) {
            (Presence::File(hot_size), Presence::File(cold_size))
                if hot_size == cold_size && fileop::same_content(&hot, &cold)? =>
            {
                info!("Rolling forward interrupted transfer of {}", hot.display());
                match snap.root.mode {
                    OperationMode::Copy => {}
                    OperationMode::Move => {
                        fs::remove_file(&hot).map_err(|e| Error::from_io(e, &hot))?
                    }
                    OperationMode::MoveWithLink => self.operator.link(&hot, &cold)?,
                }
                self.to_moved(entry, &location, now)
            }
            (Presence::File(_), Presence::File(_)) => {
                info!(
                    "Rolling back partial transfer of {}: copies differ",
                    hot.display()
                );
                fs::remove_file(&cold).map_err(|e| Error::from_io(e, &cold))?;
                self.to_active(entry, now)
            }
            (Presence::File(_), _) => self.to_active(entry, now),
            (Presence::Link, Presence::File(_)) => self.to_moved(entry, &location, now),
            (Presence::Absent, Presence::File(_)) => {
                if snap.root.mode == OperationMode::MoveWithLink {
                    self.operator.link(&hot, &cold)?;
                }
                self.to_moved(entry, &location, now)
            }
            _ => {
                warn!(
                    "Neither copy of {} found after interrupted transfer",
                    hot.display()
                );
                self.inventory
                    .transition(
                        entry,
                        FileStatus::Missing,
                        Tier::Hot,
                        None,
                        Some("lost during interrupted transfer"),
                        now,
                    )
                    .map(|_| ())
            }
        }
    }

    fn to_moved(
        &self,
        entry: &InventoryEntry,
        location: &StorageLocation,
        now: i64,
    ) -> Result<(), Error> {
        self.inventory
            .transition(
                entry,
                FileStatus::Moved,
                Tier::Cold,
                Some(location.id),
                None,
                now,
            )
            .map(|_| ())
    }

    fn to_active(&self, entry: &InventoryEntry, now: i64) -> Result<(), Error> {
        self.inventory
            .transition(entry, FileStatus::Active, Tier::Hot, None, None, now)
            .map(|_| ())
    }

    /// Diff the fresh listing against the inventory. Checks `cancel` and
    /// `deadline` between files; a passed deadline ends the pass early with
    /// `timed_out` set.
    pub fn reconcile(
        &self,
        snap: &RootSnapshot,
        now: i64,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
        progress: &ScanProgress,
    ) -> Result<ReconcileReport, Error> {
        let expired = || deadline.is_some_and(|d| Instant::now() >= d);
        let root_path = snap.root.root_path();
        let listing = scanner::list_files(&root_path).map_err(|e| Error::from_io(e, &root_path))?;
        let listed: AHashMap<String, bool> = listing
            .into_iter()
            .map(|f| (f.rel_path, f.is_symlink))
            .collect();

        let entries = self.inventory.entries(snap.root.id)?;
        let known: AHashMap<&str, &InventoryEntry> =
            entries.iter().map(|e| (e.rel_path.as_str(), e)).collect();

        let mut report = ReconcileReport {
            listed: listed.len(),
            ..Default::default()
        };
        progress.add_total((entries.len() + listed.len()) as u64);

        for entry in &entries {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if expired() {
                report.timed_out = true;
                return Ok(report);
            }
            progress.file_done();

            let Some(_guard) = self.entry_locks.try_acquire(entry.id) else {
                debug!("Entry {} busy, skipping reconciliation", entry.id);
                report.busy += 1;
                continue;
            };
            let result = match entry.status {
                FileStatus::Active => self.reconcile_active(snap, entry, &listed, now, &mut report),
                FileStatus::Moved => self.reconcile_moved(snap, entry, &listed, now, &mut report),
                FileStatus::Missing => self.reconcile_missing(snap, entry, &listed, now, &mut report),
                FileStatus::Migrating | FileStatus::Deleted => Ok(()),
            };
            if let Err(err) = result {
                if err.class() == ErrorClass::FatalPerScan {
                    return Err(err);
                }
                warn!("Reconciling {}: {}", entry.rel_path, err);
                report.failures.push(FileFailure::new(&entry.rel_path, &err));
            }
        }

        for (rel_path, is_symlink) in &listed {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if expired() {
                report.timed_out = true;
                return Ok(report);
            }
            progress.file_done();

            // Foreign symlinks are never inventoried.
            if known.contains_key(rel_path.as_str()) || *is_symlink {
                continue;
            }
            let path = scanner::join_relative(&root_path, rel_path);
            match self.prober.probe(&path) {
                Ok(meta) if meta.kind == FileKind::File => {
                    let id = self
                        .inventory
                        .record_new(snap.root.id, rel_path, &meta.snapshot(), now)?;
                    report.discovered += 1;
                    report.candidates.push((self.inventory.entry(id)?, meta));
                }
                Ok(_) => {}
                Err(Error::NotFound(_)) => debug!("{} vanished during listing", path.display()),
                Err(err) => {
                    warn!("Probing {}: {}", path.display(), err);
                    report.failures.push(FileFailure::new(rel_path, &err));
                }
            }
        }

        debug!(
            "Reconciled {}: {} listed, {} new, {} missing, {} refreshed",
            snap.root.path, report.listed, report.discovered, report.missing, report.refreshed
        );
        Ok(report)
    }

    fn reconcile_active(
        &self,
        snap: &RootSnapshot,
        entry: &InventoryEntry,
        listed: &AHashMap<String, bool>,
        now: i64,
        report: &mut ReconcileReport,
    ) -> Result<(), Error> {
        if listed.get(&entry.rel_path) != Some(&false) {
            return self.mark_missing(entry, Tier::Hot, None, now, report);
        }
        let hot = entry.hot_path(&snap.root);
        match self.prober.probe(&hot) {
            Ok(meta) => {
                self.inventory.refresh(entry.id, &meta.snapshot(), now)?;
                report.refreshed += 1;
                report.candidates.push((entry.clone(), meta));
                Ok(())
            }
            Err(Error::NotFound(_)) => self.mark_missing(entry, Tier::Hot, None, now, report),
            Err(err) => Err(err),
        }
    }

    fn reconcile_moved(
        &self,
        snap: &RootSnapshot,
        entry: &InventoryEntry,
        listed: &AHashMap<String, bool>,
        now: i64,
        report: &mut ReconcileReport,
    ) -> Result<(), Error> {
        let location = match entry.location_id {
            Some(id) => self.inventory.read(|db| db.get_location(id))?,
            None => None,
        };
        let Some(location) = location else {
            return self.mark_missing(entry, Tier::Hot, None, now, report);
        };
        if !location.is_reachable() {
            debug!(
                "Location '{}' unreachable, leaving entry {} as is",
                location.name, entry.id
            );
            return Ok(());
        }

        let hot = entry.hot_path(&snap.root);
        let cold = entry.cold_path(&location);
        let hot_is_file = listed.get(&entry.rel_path) == Some(&false);

        match presence(&cold) {
            Presence::File(cold_size) => {
                if hot_is_file && snap.root.mode != OperationMode::Copy {
                    return self.resolve_conflict(entry, &hot, &cold, cold_size, now, report);
                }
                let meta = self.prober.probe(&cold)?;
                self.inventory.refresh(entry.id, &meta.snapshot(), now)?;
                report.refreshed += 1;
                report.moved_in_place += 1;
                Ok(())
            }
            _ if hot_is_file => {
                // Cold copy gone but the file is back in the hot tier.
                let meta = self.prober.probe(&hot)?;
                let updated = self.inventory.transition(
                    entry,
                    FileStatus::Active,
                    Tier::Hot,
                    None,
                    None,
                    now,
                )?;
                self.inventory.refresh(entry.id, &meta.snapshot(), now)?;
                report.reappeared += 1;
                report.candidates.push((updated, meta));
                Ok(())
            }
            _ => self.mark_missing(entry, Tier::Cold, entry.location_id, now, report),
        }
    }

    /// A regular file stands where the placeholder (or nothing) should be
    /// while the cold copy still exists. Identical bytes converge on the hot
    /// file; otherwise both are kept and the entry is flagged.
    fn resolve_conflict(
        &self,
        entry: &InventoryEntry,
        hot: &Path,
        cold: &Path,
        cold_size: u64,
        now: i64,
        report: &mut ReconcileReport,
    ) -> Result<(), Error> {
        let meta = self.prober.probe(hot)?;
        report.conflicts += 1;

        let note = if meta.size == cold_size && fileop::same_content(hot, cold)? {
            info!(
                "Dropping redundant cold copy {} of {}",
                cold.display(),
                hot.display()
            );
            fs::remove_file(cold).map_err(|e| Error::from_io(e, cold))?;
            None
        } else {
            warn!(
                "{} differs from its cold copy {}, keeping both",
                hot.display(),
                cold.display()
            );
            Some(format!("stale cold copy left at {}", cold.display()))
        };

        let updated = self.inventory.transition(
            entry,
            FileStatus::Active,
            Tier::Hot,
            None,
            note.as_deref(),
            now,
        )?;
        self.inventory.refresh(entry.id, &meta.snapshot(), now)?;
        report.reappeared += 1;
        report.candidates.push((updated, meta));
        Ok(())
    }

    fn reconcile_missing(
        &self,
        snap: &RootSnapshot,
        entry: &InventoryEntry,
        listed: &AHashMap<String, bool>,
        now: i64,
        report: &mut ReconcileReport,
    ) -> Result<(), Error> {
        if listed.get(&entry.rel_path) == Some(&false) {
            let meta = self.prober.probe(&entry.hot_path(&snap.root))?;
            self.inventory
                .transition(entry, FileStatus::Active, Tier::Hot, None, None, now)?;
            self.inventory.refresh(entry.id, &meta.snapshot(), now)?;
            report.reappeared += 1;
            return Ok(());
        }

        if let Some(location_id) = entry.location_id {
            if let Some(location) = self.inventory.read(|db| db.get_location(location_id))? {
                let cold = entry.cold_path(&location);
                if location.is_reachable() && matches!(presence(&cold), Presence::File(_)) {
                    let meta = self.prober.probe(&cold)?;
                    self.inventory.transition(
                        entry,
                        FileStatus::Moved,
                        Tier::Cold,
                        Some(location_id),
                        None,
                        now,
                    )?;
                    self.inventory.refresh(entry.id, &meta.snapshot(), now)?;
                    report.reappeared += 1;
                }
            }
        }
        Ok(())
    }

    fn mark_missing(
        &self,
        entry: &InventoryEntry,
        tier: Tier,
        location_id: Option<i64>,
        now: i64,
        report: &mut ReconcileReport,
    ) -> Result<(), Error> {
        debug!("Entry {} ({}) is missing", entry.id, entry.rel_path);
        self.inventory
            .transition(entry, FileStatus::Missing, tier, location_id, None, now)?;
        report.missing += 1;
        Ok(())
    }
}
