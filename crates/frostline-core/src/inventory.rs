//! Inventory store: the single source of truth for what the system believes
//! exists, and the only place lifecycle transitions are written.

use crate::config::{AppConfig, CriterionConfig};
use crate::criteria::Criterion;
use crate::error::Error;
use crate::storage::models::*;
use crate::storage::{Database, Snapshot};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Configuration of one root as read at the start of a scan.
#[derive(Debug, Clone)]
pub struct RootSnapshot {
    pub root: MonitoredRoot,
    /// Destinations in priority order.
    pub locations: Vec<StorageLocation>,
    pub criteria: Vec<CriterionRow>,
}

impl RootSnapshot {
    pub fn location(&self, id: i64) -> Option<&StorageLocation> {
        self.locations.iter().find(|l| l.id == id)
    }
}

pub struct Inventory {
    db: Mutex<Database>,
    mutations: AtomicU64,
}

impl Inventory {
    pub fn new(db: Database) -> Self {
        Self {
            db: Mutex::new(db),
            mutations: AtomicU64::new(0),
        }
    }

    pub fn open(path: &str) -> Result<Self, Error> {
        Ok(Self::new(Database::open(path)?))
    }

    pub fn open_in_memory() -> Result<Self, Error> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    fn lock(&self) -> Result<MutexGuard<'_, Database>, Error> {
        self.db
            .lock()
            .map_err(|e| Error::Other(format!("Failed to lock inventory: {}", e)))
    }

    /// Run a read against the database.
    pub fn read<F, R>(&self, f: F) -> Result<R, Error>
    where
        F: FnOnce(&Database) -> rusqlite::Result<R>,
    {
        let db = self.lock()?;
        Ok(f(&db)?)
    }

    /// Run a write against the database and count it.
    pub fn write<F, R>(&self, f: F) -> Result<R, Error>
    where
        F: FnOnce(&Database) -> rusqlite::Result<R>,
    {
        let db = self.lock()?;
        let result = f(&db)?;
        self.mutations.fetch_add(1, Ordering::SeqCst);
        Ok(result)
    }

    /// Number of writes performed through this inventory.
    pub fn mutation_count(&self) -> u64 {
        self.mutations.load(Ordering::SeqCst)
    }

    // ── Configuration ────────────────────────────────────────────

    pub fn register_location(
        &self,
        name: &str,
        path: &str,
        caution_threshold_pct: u8,
        critical_threshold_pct: u8,
    ) -> Result<i64, Error> {
        if critical_threshold_pct > 100 || caution_threshold_pct > 100 {
            return Err(Error::Other(format!(
                "thresholds for location '{}' must be percentages",
                name
            )));
        }
        self.write(|db| db.upsert_location(name, path, caution_threshold_pct, critical_threshold_pct))
    }

    pub fn register_root(
        &self,
        path: &str,
        mode: OperationMode,
        scan_interval_secs: u64,
        enabled: bool,
        location_ids: &[i64],
    ) -> Result<i64, Error> {
        let interval = crate::config::effective_scan_interval(scan_interval_secs);
        if interval != scan_interval_secs {
            warn!(
                "Scan interval {}s for '{}' raised to the {}s minimum",
                scan_interval_secs, path, interval
            );
        }
        let existing: Vec<String> = self
            .read(|db| db.list_roots())?
            .into_iter()
            .map(|r| r.path)
            .filter(|p| p != path)
            .collect();
        let mut candidate = existing;
        candidate.push(path.to_string());
        if let Some((outer, inner)) = crate::config::nested_directories(&candidate).into_iter().next() {
            return Err(Error::Other(format!(
                "monitored root '{}' is nested inside '{}'",
                inner, outer
            )));
        }

        let root_id = self.write(|db| db.upsert_root(path, mode, interval, enabled))?;
        self.write(|db| db.set_root_locations(root_id, location_ids))?;
        Ok(root_id)
    }

    /// Validate then store one criterion. Malformed operands never reach the
    /// database.
    pub fn add_criterion(
        &self,
        root_id: i64,
        kind: &str,
        op: &str,
        value: &str,
        enabled: bool,
    ) -> Result<i64, Error> {
        Criterion::parse(kind, op, value)?;
        self.write(|db| db.insert_criterion(root_id, kind, op, value, enabled))
    }

    /// Validate every criterion, then replace the root's set atomically.
    pub fn replace_criteria(&self, root_id: i64, criteria: &[CriterionConfig]) -> Result<usize, Error> {
        let mut rows = Vec::with_capacity(criteria.len());
        for c in criteria {
            Criterion::parse(&c.kind, &c.op, &c.value)?;
            rows.push((c.kind.clone(), c.op.clone(), c.value.clone(), c.enabled));
        }
        self.write(|db| db.replace_criteria(root_id, &rows))
    }

    /// Write declared locations, roots and criteria from configuration.
    pub fn sync_config(&self, config: &AppConfig) -> Result<Vec<i64>, Error> {
        crate::config::validate(config)?;

        for location in &config.locations {
            self.register_location(
                &location.name,
                &location.path,
                location.caution_threshold_pct,
                location.critical_threshold_pct,
            )?;
        }

        let mut root_ids = Vec::new();
        for root in &config.roots {
            let mut location_ids = Vec::new();
            for name in &root.locations {
                let location = self
                    .read(|db| db.get_location_by_name(name))?
                    .ok_or_else(|| Error::NotFound(format!("storage location '{}'", name)))?;
                location_ids.push(location.id);
            }
            let root_id = self.register_root(
                &root.path,
                root.mode,
                root.scan_interval_secs,
                root.enabled,
                &location_ids,
            )?;
            self.replace_criteria(root_id, &root.criteria)?;
            root_ids.push(root_id);
        }

        info!(
            "Synced {} storage locations and {} monitored roots",
            config.locations.len(),
            root_ids.len()
        );
        Ok(root_ids)
    }

    pub fn roots(&self) -> Result<Vec<MonitoredRoot>, Error> {
        self.read(|db| db.list_roots())
    }

    pub fn locations(&self) -> Result<Vec<StorageLocation>, Error> {
        self.read(|db| db.list_locations())
    }

    /// Drop a root's configuration rows together with its inventory.
    pub fn remove_root(&self, root_id: i64) -> Result<(), Error> {
        self.write(|db| db.delete_root(root_id))
    }

    pub fn root(&self, root_id: i64) -> Result<MonitoredRoot, Error> {
        self.read(|db| db.get_root(root_id))?
            .ok_or_else(|| Error::NotFound(format!("monitored root {}", root_id)))
    }

    pub fn location(&self, location_id: i64) -> Result<StorageLocation, Error> {
        self.read(|db| db.get_location(location_id))?
            .ok_or_else(|| Error::NotFound(format!("storage location {}", location_id)))
    }

    /// Read the root's configuration. A dangling location reference is a
    /// configuration error.
    pub fn root_snapshot(&self, root_id: i64) -> Result<RootSnapshot, Error> {
        let root = self.root(root_id)?;
        let mut locations = Vec::with_capacity(root.location_ids.len());
        for id in &root.location_ids {
            match self.read(|db| db.get_location(*id))? {
                Some(location) => locations.push(location),
                None => {
                    return Err(Error::Misconfigured(format!(
                        "root {} references missing storage location {}",
                        root_id, id
                    )))
                }
            }
        }
        let criteria = self.read(|db| db.list_criteria(root_id))?;
        Ok(RootSnapshot {
            root,
            locations,
            criteria,
        })
    }

    pub fn set_root_error(&self, root_id: i64, message: &str) -> Result<(), Error> {
        warn!("Root {} entering error state: {}", root_id, message);
        self.write(|db| db.set_root_error(root_id, Some(message)))
    }

    pub fn clear_root_error(&self, root_id: i64) -> Result<(), Error> {
        info!("Clearing error state of root {}", root_id);
        self.write(|db| db.set_root_error(root_id, None))
    }

    /// Refresh each location's availability flag from the filesystem.
    pub fn refresh_location_availability(&self) -> Result<Vec<StorageLocation>, Error> {
        let locations = self.read(|db| db.list_locations())?;
        let mut refreshed = Vec::with_capacity(locations.len());
        for mut location in locations {
            let present = std::path::Path::new(&location.path).is_dir();
            if present != location.available {
                info!(
                    "Storage location '{}' is now {}",
                    location.name,
                    if present { "available" } else { "unavailable" }
                );
                self.write(|db| db.set_location_available(location.id, present))?;
                location.available = present;
            }
            refreshed.push(location);
        }
        Ok(refreshed)
    }

    // ── Entries ──────────────────────────────────────────────────

    pub fn entry(&self, entry_id: i64) -> Result<InventoryEntry, Error> {
        self.read(|db| db.get_entry(entry_id))?
            .ok_or_else(|| Error::NotFound(format!("inventory entry {}", entry_id)))
    }

    pub fn entries(&self, root_id: i64) -> Result<Vec<InventoryEntry>, Error> {
        self.read(|db| db.list_entries(root_id))
    }

    pub fn entries_with_status(
        &self,
        root_id: i64,
        status: FileStatus,
    ) -> Result<Vec<InventoryEntry>, Error> {
        self.read(|db| db.list_entries_with_status(root_id, status))
    }

    pub fn entry_by_path(&self, root_id: i64, rel_path: &str) -> Result<Option<InventoryEntry>, Error> {
        self.read(|db| db.get_entry_by_path(root_id, rel_path))
    }

    pub fn live_entries(&self) -> Result<Vec<InventoryEntry>, Error> {
        self.read(|db| db.list_live_entries())
    }

    /// `(status, count, bytes)` per status for one root.
    pub fn status_counts(&self, root_id: i64) -> Result<Vec<(String, i64, i64)>, Error> {
        self.read(|db| db.count_entries_by_status(root_id))
    }

    pub fn record_new(
        &self,
        root_id: i64,
        rel_path: &str,
        snapshot: &Snapshot,
        now: i64,
    ) -> Result<i64, Error> {
        let id = self.write(|db| db.insert_entry(root_id, rel_path, snapshot, now))?;
        debug!("New entry {} for '{}' under root {}", id, rel_path, root_id);
        Ok(id)
    }

    pub fn refresh(&self, entry_id: i64, snapshot: &Snapshot, now: i64) -> Result<(), Error> {
        self.write(|db| db.update_snapshot(entry_id, snapshot, now))
    }

    /// Move an entry along a lifecycle edge. Illegal edges and lost races
    /// (the row is no longer in `entry.status`) are errors.
    pub fn transition(
        &self,
        entry: &InventoryEntry,
        to: FileStatus,
        tier: Tier,
        location_id: Option<i64>,
        last_error: Option<&str>,
        now: i64,
    ) -> Result<InventoryEntry, Error> {
        if !entry.status.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                entry_id: entry.id,
                from: entry.status.to_string(),
                to: to.to_string(),
            });
        }

        let applied = self.write(|db| {
            db.transition_entry(entry.id, entry.status, to, tier, location_id, last_error, now)
        })?;
        if !applied {
            let current = self.entry(entry.id)?;
            return Err(Error::InvalidTransition {
                entry_id: entry.id,
                from: current.status.to_string(),
                to: to.to_string(),
            });
        }

        debug!("Entry {}: {} -> {}", entry.id, entry.status, to);
        let mut updated = entry.clone();
        updated.status = to;
        updated.tier = tier;
        updated.location_id = location_id;
        updated.last_error = last_error.map(|s| s.to_string());
        updated.last_seen = now;
        Ok(updated)
    }

    pub fn set_entry_error(&self, entry_id: i64, message: Option<&str>) -> Result<(), Error> {
        self.write(|db| db.set_entry_error(entry_id, message))
    }

    /// Repoint a MOVED entry at another location after a relocation.
    pub fn set_entry_location(&self, entry_id: i64, location_id: i64) -> Result<(), Error> {
        self.write(|db| db.set_entry_location(entry_id, location_id))
    }

    pub fn set_checksum(&self, entry_id: i64, checksum: u64) -> Result<(), Error> {
        self.write(|db| db.set_checksum(entry_id, checksum as i64))
    }

    /// Mark an entry DELETED; it stops being tracked.
    pub fn forget(&self, entry_id: i64, now: i64) -> Result<InventoryEntry, Error> {
        let entry = self.entry(entry_id)?;
        self.transition(&entry, FileStatus::Deleted, entry.tier, entry.location_id, None, now)
    }

    /// Physically remove MISSING/DELETED rows last seen before the window.
    pub fn purge_stale(&self, retention_secs: i64, now: i64) -> Result<usize, Error> {
        let cutoff = now.saturating_sub(retention_secs);
        let removed = self.write(|db| db.purge_stale_entries(cutoff))?;
        info!("Purged {} stale inventory rows", removed);
        Ok(removed)
    }

    // ── Scan runs ────────────────────────────────────────────────

    pub fn begin_scan_run(&self, root_id: i64) -> Result<i64, Error> {
        self.write(|db| db.create_scan_run(root_id))
    }

    pub fn scan_runs(&self, root_id: i64, limit: i64) -> Result<Vec<ScanRun>, Error> {
        self.read(|db| db.list_scan_runs(root_id, limit))
    }

    // ── Pins ─────────────────────────────────────────────────────

    pub fn pin(&self, root_id: i64, rel_path: &str) -> Result<(), Error> {
        self.write(|db| db.pin(root_id, rel_path))
    }

    pub fn unpin(&self, root_id: i64, rel_path: &str) -> Result<(), Error> {
        self.write(|db| db.unpin(root_id, rel_path))
    }

    pub fn is_pinned(&self, root_id: i64, rel_path: &str) -> Result<bool, Error> {
        self.read(|db| db.is_pinned(root_id, rel_path))
    }

    pub fn pinned_paths(&self, root_id: i64) -> Result<HashSet<String>, Error> {
        self.read(|db| db.pinned_paths(root_id))
    }
}
