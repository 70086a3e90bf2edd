mod common;

use common::{Fixture, T0};
use frostline_core::checksum::find_duplicates;
use frostline_core::error::Error;
use frostline_core::storage::models::{FileStatus, OperationMode, Tier};
use frostline_core::storage::{Database, Snapshot};
use frostline_core::{AppConfig, Inventory};
use rusqlite::params;

fn snapshot(size: i64, mtime: i64) -> Snapshot {
    Snapshot {
        size,
        mtime,
        atime: mtime,
        ctime: mtime,
    }
}

#[test]
fn test_schema_creates_tables() {
    let db = Database::open_in_memory().unwrap();
    let count: i64 = db
        .connection()
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN \
             ('storage_location', 'monitored_root', 'root_location', 'criterion', \
              'inventory_entry', 'pinned_marker', 'scan_run')",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(count, 7);
}

#[test]
fn test_root_locations_keep_priority_order() {
    let db = Database::open_in_memory().unwrap();
    let a = db.upsert_location("a", "/mnt/a", 20, 10).unwrap();
    let b = db.upsert_location("b", "/mnt/b", 20, 10).unwrap();
    let c = db.upsert_location("c", "/mnt/c", 20, 10).unwrap();
    let root = db
        .upsert_root("/data", OperationMode::MoveWithLink, 300, true)
        .unwrap();

    db.set_root_locations(root, &[c, a, b]).unwrap();
    let loaded = db.get_root(root).unwrap().unwrap();
    assert_eq!(loaded.location_ids, vec![c, a, b]);
    assert_eq!(loaded.mode, OperationMode::MoveWithLink);
    assert_eq!(loaded.scan_interval_secs, 300);

    db.set_root_locations(root, &[b]).unwrap();
    assert_eq!(db.get_root(root).unwrap().unwrap().location_ids, vec![b]);
}

#[test]
fn test_upsert_location_is_idempotent_by_name() {
    let db = Database::open_in_memory().unwrap();
    let first = db.upsert_location("archive", "/mnt/old", 20, 10).unwrap();
    let second = db.upsert_location("archive", "/mnt/new", 30, 5).unwrap();
    assert_eq!(first, second);

    let location = db.get_location(first).unwrap().unwrap();
    assert_eq!(location.path, "/mnt/new");
    assert_eq!(location.critical_threshold_pct, 5);
    assert!(location.available);
    assert_eq!(db.list_locations().unwrap().len(), 1);
}

#[test]
fn test_transition_is_compare_and_set() {
    let db = Database::open_in_memory().unwrap();
    let loc = db.upsert_location("cold", "/mnt/cold", 20, 10).unwrap();
    let root = db.upsert_root("/data", OperationMode::Move, 3600, true).unwrap();
    let id = db.insert_entry(root, "a.txt", &snapshot(10, T0), T0).unwrap();

    assert!(db
        .transition_entry(id, FileStatus::Active, FileStatus::Migrating, Tier::Hot, Some(loc), None, T0)
        .unwrap());
    // A second writer still believing ACTIVE loses.
    assert!(!db
        .transition_entry(id, FileStatus::Active, FileStatus::Migrating, Tier::Hot, Some(loc), None, T0)
        .unwrap());

    let entry = db.get_entry(id).unwrap().unwrap();
    assert_eq!(entry.status, FileStatus::Migrating);
    assert_eq!(entry.location_id, Some(loc));
}

#[test]
fn test_inventory_rejects_illegal_edges() {
    let inventory = Inventory::open_in_memory().unwrap();
    let root = inventory
        .write(|db| db.upsert_root("/data", OperationMode::Move, 3600, true))
        .unwrap();
    let id = inventory
        .record_new(root, "a.txt", &snapshot(1, T0), T0)
        .unwrap();
    let entry = inventory.entry(id).unwrap();
    let writes = inventory.mutation_count();

    let deleted = inventory
        .transition(&entry, FileStatus::Deleted, Tier::Hot, None, None, T0)
        .unwrap();
    let err = inventory
        .transition(&deleted, FileStatus::Active, Tier::Hot, None, None, T0)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { .. }));
    // Only the DELETED write reached the database.
    assert_eq!(inventory.mutation_count(), writes + 1);

    // Stale view of the row: the CAS misses and reports the real state.
    let err = inventory
        .transition(&entry, FileStatus::Missing, Tier::Hot, None, None, T0)
        .unwrap_err();
    match err {
        Error::InvalidTransition { from, .. } => assert_eq!(from, "DELETED"),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_snapshot_change_clears_checksum() {
    let db = Database::open_in_memory().unwrap();
    let root = db.upsert_root("/data", OperationMode::Move, 3600, true).unwrap();
    let id = db.insert_entry(root, "a.txt", &snapshot(10, T0), T0).unwrap();
    db.set_checksum(id, 42).unwrap();

    // Same size and mtime: only atime moved.
    let touched = Snapshot {
        atime: T0 + 50,
        ..snapshot(10, T0)
    };
    db.update_snapshot(id, &touched, T0 + 50).unwrap();
    assert_eq!(db.get_entry(id).unwrap().unwrap().checksum, Some(42));

    db.update_snapshot(id, &snapshot(11, T0 + 60), T0 + 60).unwrap();
    let entry = db.get_entry(id).unwrap().unwrap();
    assert_eq!(entry.checksum, None);
    assert_eq!(entry.size, 11);
}

#[test]
fn test_purge_only_drops_stale_missing_and_deleted() {
    let inventory = Inventory::open_in_memory().unwrap();
    let root = inventory
        .write(|db| db.upsert_root("/data", OperationMode::Move, 3600, true))
        .unwrap();
    let mut ids = Vec::new();
    for name in ["active", "missing-old", "missing-new", "deleted-old"] {
        ids.push(inventory.record_new(root, name, &snapshot(1, T0), T0).unwrap());
    }

    let old = T0 - 40 * 86_400;
    let missing_old = inventory.entry(ids[1]).unwrap();
    inventory
        .transition(&missing_old, FileStatus::Missing, Tier::Hot, None, None, old)
        .unwrap();
    let missing_new = inventory.entry(ids[2]).unwrap();
    inventory
        .transition(&missing_new, FileStatus::Missing, Tier::Hot, None, None, T0)
        .unwrap();
    inventory.forget(ids[3], old).unwrap();
    inventory
        .write(|db| {
            db.connection().execute(
                "UPDATE inventory_entry SET last_seen = ?1 WHERE id = ?2",
                params![old, ids[0]],
            )
        })
        .unwrap();

    let removed = inventory.purge_stale(30 * 86_400, T0).unwrap();
    assert_eq!(removed, 2);
    let left: Vec<String> = inventory
        .entries(root)
        .unwrap()
        .into_iter()
        .map(|e| e.rel_path)
        .collect();
    assert_eq!(left, vec!["active", "missing-new"]);
}

#[test]
fn test_pins_are_per_root_and_cascade() {
    let inventory = Inventory::open_in_memory().unwrap();
    let (a, b) = inventory
        .write(|db| {
            Ok((
                db.upsert_root("/a", OperationMode::Move, 3600, true)?,
                db.upsert_root("/b", OperationMode::Move, 3600, true)?,
            ))
        })
        .unwrap();

    inventory.pin(a, "x/y.txt").unwrap();
    inventory.pin(a, "x/y.txt").unwrap();
    assert!(inventory.is_pinned(a, "x/y.txt").unwrap());
    assert!(!inventory.is_pinned(b, "x/y.txt").unwrap());
    assert_eq!(inventory.pinned_paths(a).unwrap().len(), 1);

    inventory.remove_root(a).unwrap();
    let pins: i64 = inventory
        .read(|db| {
            db.connection()
                .query_row("SELECT COUNT(*) FROM pinned_marker", [], |row| row.get(0))
        })
        .unwrap();
    assert_eq!(pins, 0);
}

#[test]
fn test_register_root_rejects_nesting() {
    let inventory = Inventory::open_in_memory().unwrap();
    inventory
        .register_root("/srv/data", OperationMode::Move, 3600, true, &[])
        .unwrap();
    assert!(inventory
        .register_root("/srv/data/sub", OperationMode::Move, 3600, true, &[])
        .is_err());
    assert!(inventory
        .register_root("/srv/database", OperationMode::Move, 3600, true, &[])
        .is_ok());
}

#[test]
fn test_status_counts_group_by_status() {
    let fx = Fixture::new(OperationMode::Move, &[("name", "=", "*.keep")]);
    fx.write_file("a.keep", b"aaaa", T0);
    fx.write_file("b.bin", b"bb", T0);
    fx.write_file("c.bin", b"c", T0);
    fx.scan();

    let counts = fx.inventory.status_counts(fx.root_id).unwrap();
    assert!(counts.contains(&("ACTIVE".to_string(), 1, 4)));
    assert!(counts.contains(&("MOVED".to_string(), 2, 3)));
}

#[test]
fn test_find_duplicates_across_tiers() {
    let fx = Fixture::new(OperationMode::Move, &[("name", "=", "*.hot")]);
    let payload = vec![0xABu8; 10_000];
    fx.write_file("one.hot", &payload, T0);
    fx.write_file("nested/two.cold", &payload, T0);
    let mut different = payload.clone();
    different[9_999] = 0;
    fx.write_file("three.hot", &different, T0);
    fx.write_file("unique.hot", b"short", T0);
    assert_eq!(fx.scan().moved, 1);

    let disabled = find_duplicates(&fx.inventory, &AppConfig::default()).unwrap_err();
    assert!(matches!(disabled, Error::Misconfigured(_)));
    assert!(fx.entry("one.hot").checksum.is_none());

    let config = AppConfig {
        checksums_enabled: true,
        ..AppConfig::default()
    };
    let groups = find_duplicates(&fx.inventory, &config).unwrap();
    assert_eq!(groups.len(), 1);
    let group = &groups[0];
    assert_eq!(group.size, 10_000);
    assert_eq!(group.wasted_bytes, 10_000);
    let mut paths: Vec<&str> = group.entries.iter().map(|e| e.rel_path.as_str()).collect();
    paths.sort();
    assert_eq!(paths, vec!["nested/two.cold", "one.hot"]);

    // Checksums were stored for the full-hash tier only.
    assert!(fx.entry("one.hot").checksum.is_some());
    assert!(fx.entry("unique.hot").checksum.is_none());
}
