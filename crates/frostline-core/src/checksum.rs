//! Duplicate maintenance pass.
//!
//! Runs outside the scan hot path. Two-tier hashing: entries are grouped by
//! size, size collisions are narrowed by a hash of their first 1KB, and only
//! prefix collisions are hashed in full. Full checksums are stored on the
//! entry and reused until its size or mtime changes.

use crate::config::AppConfig;
use crate::error::Error;
use crate::inventory::Inventory;
use crate::storage::models::{FileStatus, InventoryEntry, MonitoredRoot, StorageLocation};
use ahash::AHashMap;
use dashmap::DashMap;
use rayon::prelude::*;
use std::fs::File;
use std::hash::Hasher as _;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};
use twox_hash::XxHash64;

const PARTIAL_HASH_LENGTH: usize = 1024;
const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct DuplicateGroup {
    pub size: u64,
    pub checksum: u64,
    pub entries: Vec<InventoryEntry>,
    /// Bytes reclaimable by keeping a single copy.
    pub wasted_bytes: u64,
}

/// Streamed XxHash64 of the whole file.
pub fn content_checksum(path: &Path) -> io::Result<u64> {
    let mut file = File::open(path)?;
    let mut hasher = XxHash64::with_seed(0);
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.write(&buf[..n]);
    }
    Ok(hasher.finish())
}

fn partial_checksum(path: &Path) -> io::Result<u64> {
    let mut file = File::open(path)?;
    let mut buf = vec![0u8; PARTIAL_HASH_LENGTH];
    let n = file.read(&mut buf)?;
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(&buf[..n]);
    Ok(hasher.finish())
}

/// Where an entry's authoritative bytes live right now.
fn physical_path(
    entry: &InventoryEntry,
    roots: &AHashMap<i64, MonitoredRoot>,
    locations: &AHashMap<i64, StorageLocation>,
) -> Option<PathBuf> {
    match entry.status {
        FileStatus::Active => roots.get(&entry.root_id).map(|r| entry.hot_path(r)),
        FileStatus::Moved => entry
            .location_id
            .and_then(|id| locations.get(&id))
            .map(|l| entry.cold_path(l)),
        _ => None,
    }
}

/// Group live entries by (size, checksum). Empty files are ignored. Refused
/// unless `checksums_enabled` is set.
pub fn find_duplicates(
    inventory: &Inventory,
    config: &AppConfig,
) -> Result<Vec<DuplicateGroup>, Error> {
    if !config.checksums_enabled {
        return Err(Error::Misconfigured(
            "checksums are disabled; set checksums_enabled to run duplicate detection"
                .to_string(),
        ));
    }
    let roots: AHashMap<i64, MonitoredRoot> = inventory
        .roots()?
        .into_iter()
        .map(|r| (r.id, r))
        .collect();
    let locations: AHashMap<i64, StorageLocation> = inventory
        .locations()?
        .into_iter()
        .map(|l| (l.id, l))
        .collect();

    let mut by_size: AHashMap<i64, Vec<InventoryEntry>> = AHashMap::new();
    for entry in inventory.live_entries()? {
        if entry.size > 0 {
            by_size.entry(entry.size).or_default().push(entry);
        }
    }
    let candidates: Vec<Vec<InventoryEntry>> =
        by_size.into_iter().map(|(_, v)| v).filter(|v| v.len() > 1).collect();
    info!("Checking {} size collisions for duplicates", candidates.len());

    let confirmed: DashMap<(u64, u64), Vec<InventoryEntry>> = DashMap::new();
    let fresh: DashMap<i64, u64> = DashMap::new();

    candidates.par_iter().for_each(|same_size| {
        let by_prefix: DashMap<u64, Vec<&InventoryEntry>> = DashMap::new();
        same_size.par_iter().for_each(|entry| {
            let Some(path) = physical_path(entry, &roots, &locations) else {
                return;
            };
            match partial_checksum(&path) {
                Ok(hash) => by_prefix.entry(hash).or_default().push(entry),
                Err(e) => error!("Error hashing '{}': {}", path.display(), e),
            }
        });

        let prefix_groups: Vec<Vec<&InventoryEntry>> = by_prefix
            .into_iter()
            .map(|(_, group)| group)
            .filter(|group| group.len() > 1)
            .collect();
        prefix_groups.par_iter().for_each(|group| {
            group.par_iter().for_each(|entry| {
                let checksum = match entry.checksum {
                    Some(stored) => stored as u64,
                    None => {
                        let Some(path) = physical_path(entry, &roots, &locations) else {
                            return;
                        };
                        match content_checksum(&path) {
                            Ok(hash) => {
                                fresh.insert(entry.id, hash);
                                hash
                            }
                            Err(e) => {
                                error!("Error hashing '{}': {}", path.display(), e);
                                return;
                            }
                        }
                    }
                };
                confirmed
                    .entry((entry.size as u64, checksum))
                    .or_default()
                    .push((*entry).clone());
            });
        });
    });

    for item in fresh.iter() {
        inventory.set_checksum(*item.key(), *item.value())?;
    }
    debug!("Stored {} new checksums", fresh.len());

    let mut groups: Vec<DuplicateGroup> = confirmed
        .into_iter()
        .filter(|(_, entries)| entries.len() > 1)
        .map(|((size, checksum), mut entries)| {
            entries.sort_by_key(|e| e.id);
            DuplicateGroup {
                size,
                checksum,
                wasted_bytes: size * (entries.len() as u64 - 1),
                entries,
            }
        })
        .collect();
    groups.sort_by(|a, b| b.wasted_bytes.cmp(&a.wasted_bytes));

    info!(
        "Found {} duplicate groups ({} bytes reclaimable)",
        groups.len(),
        groups.iter().map(|g| g.wasted_bytes).sum::<u64>()
    );
    Ok(groups)
}
