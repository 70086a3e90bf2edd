use super::models::*;
use super::sqlite::Database;
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Result, Row};
use std::collections::HashSet;
use std::str::FromStr;
use tracing::debug;

const ENTRY_COLUMNS: &str = "id, root_id, rel_path, tier, location_id, size, mtime, atime, ctime, \
                             checksum, status, last_seen, last_error";

/// Snapshot of probed metadata written alongside an entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct Snapshot {
    pub size: i64,
    pub mtime: i64,
    pub atime: i64,
    pub ctime: i64,
}

fn parse_column<T: FromStr>(row: &Row, idx: usize) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn entry_from_row(row: &Row) -> Result<InventoryEntry> {
    Ok(InventoryEntry {
        id: row.get(0)?,
        root_id: row.get(1)?,
        rel_path: row.get(2)?,
        tier: parse_column(row, 3)?,
        location_id: row.get(4)?,
        size: row.get(5)?,
        mtime: row.get(6)?,
        atime: row.get(7)?,
        ctime: row.get(8)?,
        checksum: row.get(9)?,
        status: parse_column(row, 10)?,
        last_seen: row.get(11)?,
        last_error: row.get(12)?,
    })
}

fn location_from_row(row: &Row) -> Result<StorageLocation> {
    Ok(StorageLocation {
        id: row.get(0)?,
        name: row.get(1)?,
        path: row.get(2)?,
        caution_threshold_pct: row.get(3)?,
        critical_threshold_pct: row.get(4)?,
        available: row.get(5)?,
    })
}

impl Database {
    // ── Storage Locations ────────────────────────────────────────

    pub fn upsert_location(
        &self,
        name: &str,
        path: &str,
        caution_threshold_pct: u8,
        critical_threshold_pct: u8,
    ) -> Result<i64> {
        self.connection().execute(
            "INSERT INTO storage_location (name, path, caution_threshold_pct, critical_threshold_pct) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(name) DO UPDATE SET \
                 path = excluded.path, \
                 caution_threshold_pct = excluded.caution_threshold_pct, \
                 critical_threshold_pct = excluded.critical_threshold_pct",
            params![name, path, caution_threshold_pct, critical_threshold_pct],
        )?;
        self.connection().query_row(
            "SELECT id FROM storage_location WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )
    }

    pub fn get_location(&self, id: i64) -> Result<Option<StorageLocation>> {
        self.connection()
            .query_row(
                "SELECT id, name, path, caution_threshold_pct, critical_threshold_pct, available \
                 FROM storage_location WHERE id = ?1",
                params![id],
                location_from_row,
            )
            .optional()
    }

    pub fn get_location_by_name(&self, name: &str) -> Result<Option<StorageLocation>> {
        self.connection()
            .query_row(
                "SELECT id, name, path, caution_threshold_pct, critical_threshold_pct, available \
                 FROM storage_location WHERE name = ?1",
                params![name],
                location_from_row,
            )
            .optional()
    }

    pub fn list_locations(&self) -> Result<Vec<StorageLocation>> {
        let mut stmt = self.connection().prepare(
            "SELECT id, name, path, caution_threshold_pct, critical_threshold_pct, available \
             FROM storage_location ORDER BY id",
        )?;
        let locations = stmt
            .query_map([], location_from_row)?
            .collect::<Result<Vec<_>>>()?;
        Ok(locations)
    }

    pub fn set_location_available(&self, id: i64, available: bool) -> Result<()> {
        self.connection().execute(
            "UPDATE storage_location SET available = ?1 WHERE id = ?2",
            params![available, id],
        )?;
        Ok(())
    }

    // ── Monitored Roots ──────────────────────────────────────────

    pub fn upsert_root(
        &self,
        path: &str,
        mode: OperationMode,
        scan_interval_secs: u64,
        enabled: bool,
    ) -> Result<i64> {
        self.connection().execute(
            "INSERT INTO monitored_root (path, mode, scan_interval_secs, enabled) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(path) DO UPDATE SET \
                 mode = excluded.mode, \
                 scan_interval_secs = excluded.scan_interval_secs, \
                 enabled = excluded.enabled",
            params![path, mode.as_str(), scan_interval_secs as i64, enabled],
        )?;
        self.connection().query_row(
            "SELECT id FROM monitored_root WHERE path = ?1",
            params![path],
            |row| row.get(0),
        )
    }

    pub fn get_root(&self, id: i64) -> Result<Option<MonitoredRoot>> {
        let root = self
            .connection()
            .query_row(
                "SELECT id, path, mode, scan_interval_secs, enabled, error_state \
                 FROM monitored_root WHERE id = ?1",
                params![id],
                |row| {
                    Ok(MonitoredRoot {
                        id: row.get(0)?,
                        path: row.get(1)?,
                        mode: parse_column(row, 2)?,
                        scan_interval_secs: row.get::<_, i64>(3)? as u64,
                        enabled: row.get(4)?,
                        error_state: row.get(5)?,
                        location_ids: Vec::new(),
                    })
                },
            )
            .optional()?;

        match root {
            Some(mut root) => {
                root.location_ids = self.get_root_location_ids(root.id)?;
                Ok(Some(root))
            }
            None => Ok(None),
        }
    }

    pub fn list_roots(&self) -> Result<Vec<MonitoredRoot>> {
        let ids: Vec<i64> = self
            .connection()
            .prepare("SELECT id FROM monitored_root ORDER BY id")?
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<_>>>()?;

        let mut roots = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(root) = self.get_root(id)? {
                roots.push(root);
            }
        }
        Ok(roots)
    }

    fn get_root_location_ids(&self, root_id: i64) -> Result<Vec<i64>> {
        let mut stmt = self.connection().prepare_cached(
            "SELECT location_id FROM root_location WHERE root_id = ?1 ORDER BY priority, location_id",
        )?;
        let ids = stmt
            .query_map(params![root_id], |row| row.get(0))?
            .collect::<Result<Vec<_>>>()?;
        Ok(ids)
    }

    /// Replace the root's destinations; order is priority.
    pub fn set_root_locations(&self, root_id: i64, location_ids: &[i64]) -> Result<()> {
        let tx = self.connection().unchecked_transaction()?;
        tx.execute(
            "DELETE FROM root_location WHERE root_id = ?1",
            params![root_id],
        )?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO root_location (root_id, location_id, priority) VALUES (?1, ?2, ?3)",
            )?;
            for (priority, location_id) in location_ids.iter().enumerate() {
                stmt.execute(params![root_id, location_id, priority as i64])?;
            }
        }
        tx.commit()
    }

    pub fn set_root_error(&self, root_id: i64, error: Option<&str>) -> Result<()> {
        self.connection().execute(
            "UPDATE monitored_root SET error_state = ?1 WHERE id = ?2",
            params![error, root_id],
        )?;
        Ok(())
    }

    /// Delete a root; criteria, pins and inventory rows cascade.
    pub fn delete_root(&self, root_id: i64) -> Result<()> {
        self.connection().execute(
            "DELETE FROM monitored_root WHERE id = ?1",
            params![root_id],
        )?;
        Ok(())
    }

    // ── Criteria ─────────────────────────────────────────────────

    pub fn replace_criteria(
        &self,
        root_id: i64,
        criteria: &[(String, String, String, bool)],
    ) -> Result<usize> {
        let tx = self.connection().unchecked_transaction()?;
        tx.execute("DELETE FROM criterion WHERE root_id = ?1", params![root_id])?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO criterion (root_id, kind, op, value, enabled) VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for (kind, op, value, enabled) in criteria {
                stmt.execute(params![root_id, kind, op, value, enabled])?;
            }
        }
        tx.commit()?;
        Ok(criteria.len())
    }

    pub fn insert_criterion(
        &self,
        root_id: i64,
        kind: &str,
        op: &str,
        value: &str,
        enabled: bool,
    ) -> Result<i64> {
        self.connection().execute(
            "INSERT INTO criterion (root_id, kind, op, value, enabled) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![root_id, kind, op, value, enabled],
        )?;
        Ok(self.connection().last_insert_rowid())
    }

    pub fn list_criteria(&self, root_id: i64) -> Result<Vec<CriterionRow>> {
        let mut stmt = self.connection().prepare(
            "SELECT id, root_id, kind, op, value, enabled FROM criterion \
             WHERE root_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![root_id], |row| {
                Ok(CriterionRow {
                    id: row.get(0)?,
                    root_id: row.get(1)?,
                    kind: row.get(2)?,
                    op: row.get(3)?,
                    value: row.get(4)?,
                    enabled: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ── Inventory Entries ────────────────────────────────────────

    pub fn insert_entry(
        &self,
        root_id: i64,
        rel_path: &str,
        snapshot: &Snapshot,
        now: i64,
    ) -> Result<i64> {
        self.connection().execute(
            "INSERT INTO inventory_entry \
             (root_id, rel_path, tier, size, mtime, atime, ctime, status, last_seen) \
             VALUES (?1, ?2, 'HOT', ?3, ?4, ?5, ?6, 'ACTIVE', ?7)",
            params![
                root_id,
                rel_path,
                snapshot.size,
                snapshot.mtime,
                snapshot.atime,
                snapshot.ctime,
                now
            ],
        )?;
        Ok(self.connection().last_insert_rowid())
    }

    pub fn get_entry(&self, id: i64) -> Result<Option<InventoryEntry>> {
        self.connection()
            .query_row(
                &format!("SELECT {} FROM inventory_entry WHERE id = ?1", ENTRY_COLUMNS),
                params![id],
                entry_from_row,
            )
            .optional()
    }

    pub fn get_entry_by_path(&self, root_id: i64, rel_path: &str) -> Result<Option<InventoryEntry>> {
        self.connection()
            .query_row(
                &format!(
                    "SELECT {} FROM inventory_entry WHERE root_id = ?1 AND rel_path = ?2",
                    ENTRY_COLUMNS
                ),
                params![root_id, rel_path],
                entry_from_row,
            )
            .optional()
    }

    pub fn list_entries(&self, root_id: i64) -> Result<Vec<InventoryEntry>> {
        let mut stmt = self.connection().prepare(&format!(
            "SELECT {} FROM inventory_entry WHERE root_id = ?1 ORDER BY rel_path",
            ENTRY_COLUMNS
        ))?;
        let entries = stmt
            .query_map(params![root_id], entry_from_row)?
            .collect::<Result<Vec<_>>>()?;
        Ok(entries)
    }

    pub fn list_entries_with_status(
        &self,
        root_id: i64,
        status: FileStatus,
    ) -> Result<Vec<InventoryEntry>> {
        let mut stmt = self.connection().prepare(&format!(
            "SELECT {} FROM inventory_entry WHERE root_id = ?1 AND status = ?2 ORDER BY rel_path",
            ENTRY_COLUMNS
        ))?;
        let entries = stmt
            .query_map(params![root_id, status.as_str()], entry_from_row)?
            .collect::<Result<Vec<_>>>()?;
        Ok(entries)
    }

    /// Refresh the metadata snapshot. A content change (size or mtime)
    /// invalidates the stored checksum.
    pub fn update_snapshot(&self, id: i64, snapshot: &Snapshot, now: i64) -> Result<()> {
        self.connection().execute(
            "UPDATE inventory_entry SET \
             checksum = CASE WHEN size = ?1 AND mtime = ?2 THEN checksum ELSE NULL END, \
             size = ?1, mtime = ?2, atime = ?3, ctime = ?4, last_seen = ?5 \
             WHERE id = ?6",
            params![
                snapshot.size,
                snapshot.mtime,
                snapshot.atime,
                snapshot.ctime,
                now,
                id
            ],
        )?;
        Ok(())
    }

    /// Compare-and-set status change. Returns false when the row was not in
    /// `from` (someone else moved it on).
    #[allow(clippy::too_many_arguments)]
    pub fn transition_entry(
        &self,
        id: i64,
        from: FileStatus,
        to: FileStatus,
        tier: Tier,
        location_id: Option<i64>,
        last_error: Option<&str>,
        now: i64,
    ) -> Result<bool> {
        let changed = self.connection().execute(
            "UPDATE inventory_entry SET status = ?1, tier = ?2, location_id = ?3, last_error = ?4, \
             last_seen = ?5 WHERE id = ?6 AND status = ?7",
            params![
                to.as_str(),
                tier.as_str(),
                location_id,
                last_error,
                now,
                id,
                from.as_str()
            ],
        )?;
        Ok(changed == 1)
    }

    pub fn set_entry_error(&self, id: i64, last_error: Option<&str>) -> Result<()> {
        self.connection().execute(
            "UPDATE inventory_entry SET last_error = ?1 WHERE id = ?2",
            params![last_error, id],
        )?;
        Ok(())
    }

    pub fn set_entry_location(&self, id: i64, location_id: i64) -> Result<()> {
        self.connection().execute(
            "UPDATE inventory_entry SET location_id = ?1 WHERE id = ?2",
            params![location_id, id],
        )?;
        Ok(())
    }

    pub fn set_checksum(&self, id: i64, checksum: i64) -> Result<()> {
        self.connection().execute(
            "UPDATE inventory_entry SET checksum = ?1 WHERE id = ?2",
            params![checksum, id],
        )?;
        Ok(())
    }

    /// Entries still present somewhere (ACTIVE or MOVED).
    pub fn list_live_entries(&self) -> Result<Vec<InventoryEntry>> {
        let mut stmt = self.connection().prepare(&format!(
            "SELECT {} FROM inventory_entry WHERE status IN ('ACTIVE', 'MOVED') ORDER BY id",
            ENTRY_COLUMNS
        ))?;
        let entries = stmt
            .query_map([], entry_from_row)?
            .collect::<Result<Vec<_>>>()?;
        Ok(entries)
    }

    /// Physically remove MISSING/DELETED rows last seen before `cutoff`.
    pub fn purge_stale_entries(&self, cutoff: i64) -> Result<usize> {
        let removed = self.connection().execute(
            "DELETE FROM inventory_entry WHERE status IN ('MISSING', 'DELETED') AND last_seen < ?1",
            params![cutoff],
        )?;
        debug!("Purged {} stale inventory rows", removed);
        Ok(removed)
    }

    pub fn count_entries_by_status(&self, root_id: i64) -> Result<Vec<(String, i64, i64)>> {
        let mut stmt = self.connection().prepare(
            "SELECT status, COUNT(*), COALESCE(SUM(size), 0) FROM inventory_entry \
             WHERE root_id = ?1 GROUP BY status ORDER BY status",
        )?;
        let counts = stmt
            .query_map(params![root_id], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<Result<Vec<_>>>()?;
        Ok(counts)
    }

    // ── Pinned Markers ───────────────────────────────────────────

    pub fn pin(&self, root_id: i64, rel_path: &str) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        self.connection().execute(
            "INSERT OR IGNORE INTO pinned_marker (root_id, rel_path, pinned_at) VALUES (?1, ?2, ?3)",
            params![root_id, rel_path, now],
        )?;
        Ok(())
    }

    pub fn unpin(&self, root_id: i64, rel_path: &str) -> Result<()> {
        self.connection().execute(
            "DELETE FROM pinned_marker WHERE root_id = ?1 AND rel_path = ?2",
            params![root_id, rel_path],
        )?;
        Ok(())
    }

    pub fn is_pinned(&self, root_id: i64, rel_path: &str) -> Result<bool> {
        let count: i64 = self.connection().query_row(
            "SELECT COUNT(*) FROM pinned_marker WHERE root_id = ?1 AND rel_path = ?2",
            params![root_id, rel_path],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn pinned_paths(&self, root_id: i64) -> Result<HashSet<String>> {
        let mut stmt = self
            .connection()
            .prepare("SELECT rel_path FROM pinned_marker WHERE root_id = ?1")?;
        let paths = stmt
            .query_map(params![root_id], |row| row.get(0))?
            .collect::<Result<HashSet<String>>>()?;
        Ok(paths)
    }

    // ── Scan Runs ────────────────────────────────────────────────

    pub fn create_scan_run(&self, root_id: i64) -> Result<i64> {
        let now = chrono::Utc::now().to_rfc3339();
        self.connection().execute(
            "INSERT INTO scan_run (root_id, started_at, outcome) VALUES (?1, ?2, 'running')",
            params![root_id, now],
        )?;
        Ok(self.connection().last_insert_rowid())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn complete_scan_run(
        &self,
        run_id: i64,
        outcome: &str,
        scanned: i64,
        moved: i64,
        skipped_already_placed: i64,
        errors: i64,
        bytes_moved: i64,
        detail: &str,
    ) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        self.connection().execute(
            "UPDATE scan_run SET completed_at = ?1, outcome = ?2, scanned = ?3, moved = ?4, \
             skipped_already_placed = ?5, errors = ?6, bytes_moved = ?7, detail = ?8 WHERE id = ?9",
            params![
                now,
                outcome,
                scanned,
                moved,
                skipped_already_placed,
                errors,
                bytes_moved,
                detail,
                run_id
            ],
        )?;
        Ok(())
    }

    pub fn list_scan_runs(&self, root_id: i64, limit: i64) -> Result<Vec<ScanRun>> {
        let mut stmt = self.connection().prepare(
            "SELECT id, root_id, started_at, completed_at, outcome, scanned, moved, \
                    skipped_already_placed, errors, bytes_moved \
             FROM scan_run WHERE root_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let runs = stmt
            .query_map(params![root_id, limit], |row| {
                Ok(ScanRun {
                    id: row.get(0)?,
                    root_id: row.get(1)?,
                    started_at: row.get(2)?,
                    completed_at: row.get(3)?,
                    outcome: row.get(4)?,
                    scanned: row.get(5)?,
                    moved: row.get(6)?,
                    skipped_already_placed: row.get(7)?,
                    errors: row.get(8)?,
                    bytes_moved: row.get(9)?,
                })
            })?
            .collect::<Result<Vec<_>>>()?;
        Ok(runs)
    }
}
