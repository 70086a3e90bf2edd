#![allow(dead_code)]

use filetime::FileTime;
use frostline_core::storage::models::{InventoryEntry, OperationMode};
use frostline_core::{
    AppConfig, CancellationToken, Inventory, ManualClock, ScanOrchestrator, ScanSummary,
};
use frostline_core::progress::ScanProgress;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::{tempdir, TempDir};

pub const T0: i64 = 1_700_000_000;

/// One monitored root (`hot/`) with one storage location (`cold/`), an
/// in-memory inventory and a manual clock set to `T0`.
pub struct Fixture {
    pub tmp: TempDir,
    pub hot: PathBuf,
    pub cold: PathBuf,
    pub inventory: Arc<Inventory>,
    pub clock: Arc<ManualClock>,
    pub orchestrator: Arc<ScanOrchestrator>,
    pub root_id: i64,
    pub location_id: i64,
}

impl Fixture {
    pub fn new(mode: OperationMode, criteria: &[(&str, &str, &str)]) -> Self {
        Self::build(mode, criteria, 0, |o| o)
    }

    pub fn build<F>(
        mode: OperationMode,
        criteria: &[(&str, &str, &str)],
        critical_pct: u8,
        customize: F,
    ) -> Self
    where
        F: FnOnce(ScanOrchestrator) -> ScanOrchestrator,
    {
        let tmp = tempdir().unwrap();
        let hot = tmp.path().join("hot");
        let cold = tmp.path().join("cold");
        fs::create_dir_all(&hot).unwrap();
        fs::create_dir_all(&cold).unwrap();

        let inventory = Arc::new(Inventory::open_in_memory().unwrap());
        let location_id = inventory
            .register_location("cold", cold.to_str().unwrap(), 0, critical_pct)
            .unwrap();
        let root_id = inventory
            .register_root(hot.to_str().unwrap(), mode, 60, true, &[location_id])
            .unwrap();
        for (kind, op, value) in criteria {
            inventory
                .add_criterion(root_id, kind, op, value, true)
                .unwrap();
        }

        let clock = Arc::new(ManualClock::new(T0));
        let orchestrator = ScanOrchestrator::new(Arc::clone(&inventory), &AppConfig::default())
            .with_clock(clock.clone());
        let orchestrator = Arc::new(customize(orchestrator));

        Fixture {
            tmp,
            hot,
            cold,
            inventory,
            clock,
            orchestrator,
            root_id,
            location_id,
        }
    }

    /// Add a second storage location after `cold`.
    pub fn add_location(&self, name: &str) -> (i64, PathBuf) {
        let path = self.tmp.path().join(name);
        fs::create_dir_all(&path).unwrap();
        let id = self
            .inventory
            .register_location(name, path.to_str().unwrap(), 0, 0)
            .unwrap();
        (id, path)
    }

    /// Write a file under the hot root with atime and mtime set to `at`.
    pub fn write_file(&self, rel_path: &str, contents: &[u8], at: i64) -> PathBuf {
        let path = self.hot.join(rel_path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, contents).unwrap();
        set_times(&path, at);
        path
    }

    pub fn cold_path(&self, rel_path: &str) -> PathBuf {
        cold_file(&self.cold, self.root_id, rel_path)
    }

    pub fn scan(&self) -> ScanSummary {
        self.orchestrator
            .run_scan(self.root_id, &CancellationToken::new(), &ScanProgress::new())
            .unwrap()
    }

    pub fn scan_at(&self, at: i64) -> ScanSummary {
        self.clock.set(at);
        self.scan()
    }

    pub fn entry(&self, rel_path: &str) -> InventoryEntry {
        self.inventory
            .entry_by_path(self.root_id, rel_path)
            .unwrap()
            .unwrap_or_else(|| panic!("no entry for {}", rel_path))
    }
}

pub fn cold_file(location: &Path, root_id: i64, rel_path: &str) -> PathBuf {
    location.join(format!("root-{}", root_id)).join(rel_path)
}

pub fn set_times(path: &Path, at: i64) {
    let t = FileTime::from_unix_time(at, 0);
    filetime::set_file_times(path, t, t).unwrap();
}
