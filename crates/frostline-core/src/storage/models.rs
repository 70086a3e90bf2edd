use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// How evicted files leave the hot tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationMode {
    #[default]
    Move,
    Copy,
    MoveWithLink,
}

impl OperationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationMode::Move => "MOVE",
            OperationMode::Copy => "COPY",
            OperationMode::MoveWithLink => "MOVE_WITH_LINK",
        }
    }
}

impl FromStr for OperationMode {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MOVE" => Ok(OperationMode::Move),
            "COPY" => Ok(OperationMode::Copy),
            "MOVE_WITH_LINK" => Ok(OperationMode::MoveWithLink),
            other => Err(crate::Error::Other(format!("unknown operation mode '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Hot,
    Cold,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Hot => "HOT",
            Tier::Cold => "COLD",
        }
    }
}

impl FromStr for Tier {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "HOT" => Ok(Tier::Hot),
            "COLD" => Ok(Tier::Cold),
            other => Err(crate::Error::Other(format!("unknown tier '{}'", other))),
        }
    }
}

/// File lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileStatus {
    Active,
    Migrating,
    Moved,
    Missing,
    Deleted,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Active => "ACTIVE",
            FileStatus::Migrating => "MIGRATING",
            FileStatus::Moved => "MOVED",
            FileStatus::Missing => "MISSING",
            FileStatus::Deleted => "DELETED",
        }
    }

    /// Legal edges of the lifecycle state machine.
    pub fn can_transition_to(self, to: FileStatus) -> bool {
        use FileStatus::*;
        match (self, to) {
            (Deleted, _) => false,
            (_, Deleted) => true,
            (Active, Migrating) | (Moved, Migrating) => true,
            (Migrating, Active) | (Migrating, Moved) | (Migrating, Missing) => true,
            (Moved, Active) => true,
            (Active, Missing) | (Moved, Missing) => true,
            (Missing, Active) | (Missing, Moved) => true,
            (a, b) => a == b,
        }
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(FileStatus::Active),
            "MIGRATING" => Ok(FileStatus::Migrating),
            "MOVED" => Ok(FileStatus::Moved),
            "MISSING" => Ok(FileStatus::Missing),
            "DELETED" => Ok(FileStatus::Deleted),
            other => Err(crate::Error::Other(format!("unknown status '{}'", other))),
        }
    }
}

/// A physical cold-storage destination.
#[derive(Debug, Clone)]
pub struct StorageLocation {
    pub id: i64,
    pub name: String,
    pub path: String,
    pub caution_threshold_pct: u8,
    pub critical_threshold_pct: u8,
    pub available: bool,
}

impl StorageLocation {
    /// Flagged available and the mount point is actually present.
    pub fn is_reachable(&self) -> bool {
        self.available && Path::new(&self.path).is_dir()
    }

    pub fn root_path(&self) -> PathBuf {
        PathBuf::from(&self.path)
    }
}

/// A source directory under automatic management.
#[derive(Debug, Clone)]
pub struct MonitoredRoot {
    pub id: i64,
    pub path: String,
    pub mode: OperationMode,
    pub scan_interval_secs: u64,
    pub enabled: bool,
    pub error_state: Option<String>,
    /// Destination ids in priority order.
    pub location_ids: Vec<i64>,
}

impl MonitoredRoot {
    pub fn root_path(&self) -> PathBuf {
        PathBuf::from(&self.path)
    }
}

/// A criterion as stored; compiled by `criteria::Criterion::parse`.
#[derive(Debug, Clone)]
pub struct CriterionRow {
    pub id: i64,
    pub root_id: i64,
    pub kind: String,
    pub op: String,
    pub value: String,
    pub enabled: bool,
}

/// One known file under a monitored root.
#[derive(Debug, Clone)]
pub struct InventoryEntry {
    pub id: i64,
    pub root_id: i64,
    /// Path relative to the monitored root.
    pub rel_path: String,
    pub tier: Tier,
    pub location_id: Option<i64>,
    pub size: i64,
    pub mtime: i64,
    pub atime: i64,
    pub ctime: i64,
    pub checksum: Option<i64>,
    pub status: FileStatus,
    pub last_seen: i64,
    pub last_error: Option<String>,
}

impl InventoryEntry {
    pub fn hot_path(&self, root: &MonitoredRoot) -> PathBuf {
        root.root_path().join(&self.rel_path)
    }

    /// Where the cold copy lives: `<location>/<root id>/<relative path>`.
    pub fn cold_path(&self, location: &StorageLocation) -> PathBuf {
        cold_path_for(location, self.root_id, &self.rel_path)
    }
}

pub fn cold_path_for(location: &StorageLocation, root_id: i64, rel_path: &str) -> PathBuf {
    location
        .root_path()
        .join(format!("root-{}", root_id))
        .join(rel_path)
}

/// Persisted scan summary (counts and byte totals only).
#[derive(Debug, Clone)]
pub struct ScanRun {
    pub id: i64,
    pub root_id: i64,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub outcome: String,
    pub scanned: i64,
    pub moved: i64,
    pub skipped_already_placed: i64,
    pub errors: i64,
    pub bytes_moved: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_edges() {
        use FileStatus::*;
        assert!(Active.can_transition_to(Migrating));
        assert!(Migrating.can_transition_to(Moved));
        assert!(Moved.can_transition_to(Active));
        assert!(Moved.can_transition_to(Missing));
        assert!(Missing.can_transition_to(Active));
        assert!(!Active.can_transition_to(Moved));
        assert!(!Deleted.can_transition_to(Active));
        assert!(Active.can_transition_to(Deleted));
    }

    #[test]
    fn test_status_round_trip_names() {
        for status in [
            FileStatus::Active,
            FileStatus::Migrating,
            FileStatus::Moved,
            FileStatus::Missing,
            FileStatus::Deleted,
        ] {
            assert_eq!(status.as_str().parse::<FileStatus>().unwrap(), status);
        }
    }
}
