mod common;

use common::{Fixture, T0};
use frostline_core::storage::models::{FileStatus, InventoryEntry, OperationMode, Tier};
use std::fs;

const KEEP_ALL: &[(&str, &str, &str)] = &[("size", ">=", "0")];

/// Record `rel_path` as ACTIVE, then mark it MIGRATING toward the fixture's
/// location as a crashed transfer would have left it.
fn interrupted(fx: &Fixture, rel_path: &str, contents: &[u8]) -> InventoryEntry {
    fx.write_file(rel_path, contents, T0);
    fx.scan();
    let entry = fx.entry(rel_path);
    assert_eq!(entry.status, FileStatus::Active);
    fx.inventory
        .transition(
            &entry,
            FileStatus::Migrating,
            Tier::Hot,
            Some(fx.location_id),
            None,
            T0,
        )
        .unwrap()
}

fn write_cold(fx: &Fixture, rel_path: &str, contents: &[u8]) {
    let path = fx.cold_path(rel_path);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}

#[test]
fn test_complete_copy_rolls_forward() {
    let fx = Fixture::new(OperationMode::Move, KEEP_ALL);
    interrupted(&fx, "a.txt", b"complete");
    write_cold(&fx, "a.txt", b"complete");

    let s = fx.scan_at(T0 + 60);
    assert_eq!(s.recovered, 1);
    let entry = fx.entry("a.txt");
    assert_eq!(entry.status, FileStatus::Moved);
    assert_eq!(entry.tier, Tier::Cold);
    assert!(!fx.hot.join("a.txt").exists());
    assert_eq!(fs::read(fx.cold_path("a.txt")).unwrap(), b"complete");
}

#[test]
fn test_partial_copy_rolls_back() {
    let fx = Fixture::new(OperationMode::Move, KEEP_ALL);
    interrupted(&fx, "b.txt", b"the whole thing");
    write_cold(&fx, "b.txt", b"the wh");

    let s = fx.scan_at(T0 + 60);
    assert_eq!(s.recovered, 1);
    let entry = fx.entry("b.txt");
    assert_eq!(entry.status, FileStatus::Active);
    assert_eq!(entry.tier, Tier::Hot);
    assert_eq!(entry.location_id, None);
    assert!(!fx.cold_path("b.txt").exists());
    assert_eq!(fs::read(fx.hot.join("b.txt")).unwrap(), b"the whole thing");
}

#[test]
fn test_same_length_rewrite_rolls_back_to_hot() {
    let fx = Fixture::new(OperationMode::Move, KEEP_ALL);
    interrupted(&fx, "rec.dat", b"AAAA");
    write_cold(&fx, "rec.dat", b"AAAA");
    // Rewritten in place after the copy landed.
    fx.write_file("rec.dat", b"BBBB", T0 + 30);

    let s = fx.scan_at(T0 + 60);
    assert_eq!(s.recovered, 1);
    let entry = fx.entry("rec.dat");
    assert_eq!(entry.status, FileStatus::Active);
    assert_eq!(fs::read(fx.hot.join("rec.dat")).unwrap(), b"BBBB");
    assert!(!fx.cold_path("rec.dat").exists());
}

#[test]
fn test_cold_only_completes_move() {
    let fx = Fixture::new(OperationMode::Move, KEEP_ALL);
    interrupted(&fx, "c.txt", b"moved");
    write_cold(&fx, "c.txt", b"moved");
    fs::remove_file(fx.hot.join("c.txt")).unwrap();

    fx.scan_at(T0 + 60);
    let entry = fx.entry("c.txt");
    assert_eq!(entry.status, FileStatus::Moved);
    assert_eq!(entry.location_id, Some(fx.location_id));
}

#[cfg(unix)]
#[test]
fn test_cold_only_relinks_in_link_mode() {
    let fx = Fixture::new(OperationMode::MoveWithLink, KEEP_ALL);
    interrupted(&fx, "d.txt", b"linked");
    write_cold(&fx, "d.txt", b"linked");
    fs::remove_file(fx.hot.join("d.txt")).unwrap();

    fx.scan_at(T0 + 60);
    assert_eq!(fx.entry("d.txt").status, FileStatus::Moved);
    let link = fx.hot.join("d.txt");
    assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
    assert_eq!(fs::read(&link).unwrap(), b"linked");
}

#[test]
fn test_neither_copy_marks_missing() {
    let fx = Fixture::new(OperationMode::Move, KEEP_ALL);
    interrupted(&fx, "e.txt", b"lost");
    fs::remove_file(fx.hot.join("e.txt")).unwrap();

    let s = fx.scan_at(T0 + 60);
    assert_eq!(s.recovered, 1);
    let entry = fx.entry("e.txt");
    assert_eq!(entry.status, FileStatus::Missing);
    assert!(entry.last_error.is_some());
}

#[test]
fn test_staging_leftover_is_removed() {
    let fx = Fixture::new(OperationMode::Move, KEEP_ALL);
    interrupted(&fx, "dir/f.txt", b"original");
    let staging = fx.cold_path("dir/.frostline-f.txt.part");
    fs::create_dir_all(staging.parent().unwrap()).unwrap();
    fs::write(&staging, b"orig").unwrap();

    fx.scan_at(T0 + 60);
    assert!(!staging.exists());
    assert_eq!(fx.entry("dir/f.txt").status, FileStatus::Active);
    assert!(fx.hot.join("dir/f.txt").exists());
}

#[test]
fn test_unreachable_destination_rolls_back_to_hot() {
    let fx = Fixture::new(OperationMode::Move, KEEP_ALL);
    interrupted(&fx, "g.txt", b"stay");
    fx.inventory
        .write(|db| db.set_location_available(fx.location_id, false))
        .unwrap();

    fx.scan_at(T0 + 60);
    let entry = fx.entry("g.txt");
    assert_eq!(entry.status, FileStatus::Active);
    assert!(entry.last_error.unwrap().contains("rolled back"));
}

#[test]
fn test_recovered_entry_is_not_evicted_twice() {
    let fx = Fixture::new(OperationMode::Move, &[]);
    fx.write_file("h.txt", b"once", T0);
    // Evict once, then fake a crash that left the row MIGRATING after the
    // rename had already happened.
    assert_eq!(fx.scan().moved, 1);
    let moved = fx.entry("h.txt");
    fx.inventory
        .transition(
            &moved,
            FileStatus::Migrating,
            Tier::Hot,
            Some(fx.location_id),
            None,
            T0,
        )
        .unwrap();

    let s = fx.scan_at(T0 + 60);
    assert_eq!(s.recovered, 1);
    assert_eq!(s.moved, 0);
    assert_eq!(fx.entry("h.txt").status, FileStatus::Moved);
    assert_eq!(fs::read(fx.cold_path("h.txt")).unwrap(), b"once");
}
