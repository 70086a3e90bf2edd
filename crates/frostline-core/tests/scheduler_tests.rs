mod common;

use common::{Fixture, T0};
use frostline_core::error::Error;
use frostline_core::probe::{FileMetadata, FsProber, MetadataProber};
use frostline_core::progress::{ScanPhase, ScanProgress};
use frostline_core::storage::models::{FileStatus, OperationMode};
use frostline_core::{CancellationToken, JobState, RunResult, ScanOutcome, Scheduler};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(30);

/// Prober that parks the first probe until released, so a scan can be held
/// open mid-reconciliation.
#[derive(Default)]
struct GatedProber {
    state: Mutex<(bool, bool)>,
    changed: Condvar,
}

impl GatedProber {
    fn wait_entered(&self) {
        let state = self.state.lock().unwrap();
        let (state, timeout) = self
            .changed
            .wait_timeout_while(state, WAIT, |(entered, _)| !*entered)
            .unwrap();
        assert!(!timeout.timed_out(), "scan never reached the prober");
        drop(state);
    }

    fn release(&self) {
        self.state.lock().unwrap().1 = true;
        self.changed.notify_all();
    }
}

impl MetadataProber for GatedProber {
    fn probe(&self, path: &Path) -> Result<FileMetadata, Error> {
        let mut state = self.state.lock().unwrap();
        state.0 = true;
        self.changed.notify_all();
        while !state.1 {
            state = self.changed.wait(state).unwrap();
        }
        drop(state);
        FsProber.probe(path)
    }
}

fn finished(result: Option<RunResult>) -> frostline_core::ScanSummary {
    match result {
        Some(RunResult::Finished(summary)) => summary,
        other => panic!("run did not finish: {:?}", other),
    }
}

#[test]
fn test_concurrent_triggers_share_one_run() {
    let gate = Arc::new(GatedProber::default());
    let prober = Arc::clone(&gate);
    let fx = Fixture::build(OperationMode::Move, &[], 0, move |o| o.with_prober(prober));
    fx.write_file("a.txt", b"a", T0);
    let scheduler = Scheduler::new(Arc::clone(&fx.orchestrator), 2, Duration::from_millis(10)).unwrap();

    let first = scheduler.trigger_scan(fx.root_id).unwrap();
    assert!(!first.already_running);
    gate.wait_entered();

    let second = scheduler.trigger_scan(fx.root_id).unwrap();
    assert!(second.already_running);
    assert!(fx.orchestrator.is_scanning(fx.root_id));
    let live = scheduler.progress(fx.root_id).unwrap();
    assert_eq!(live.phase, ScanPhase::Reconciling);
    assert_eq!(live.total_estimate, 1);
    assert_eq!(second.progress(), live);
    let direct = fx
        .orchestrator
        .run_scan(fx.root_id, &CancellationToken::new(), &ScanProgress::new());
    assert!(matches!(direct, Err(Error::ScanInProgress(_))));
    assert_eq!(scheduler.tick().unwrap(), 0);

    gate.release();
    let summary = finished(first.wait_timeout(WAIT));
    assert_eq!(summary.outcome, ScanOutcome::Completed);
    assert_eq!(summary.moved, 1);
    assert_eq!(finished(second.wait_timeout(WAIT)).moved, 1);
    assert_eq!(fx.orchestrator.reconcile_passes(), 1);
}

#[test]
fn test_tick_respects_interval() {
    let fx = Fixture::new(OperationMode::Move, &[("size", ">=", "0")]);
    fx.write_file("a.txt", b"a", T0);
    let scheduler = Scheduler::new(Arc::clone(&fx.orchestrator), 1, Duration::from_millis(10)).unwrap();

    assert_eq!(scheduler.tick().unwrap(), 1);
    finished(scheduler.handle(fx.root_id).unwrap().wait_timeout(WAIT));

    fx.clock.advance(30);
    assert_eq!(scheduler.tick().unwrap(), 0);

    fx.clock.advance(30);
    assert_eq!(scheduler.tick().unwrap(), 1);
    finished(scheduler.handle(fx.root_id).unwrap().wait_timeout(WAIT));
    assert_eq!(fx.orchestrator.reconcile_passes(), 2);
}

#[test]
fn test_tick_skips_disabled_and_halted_roots() {
    let fx = Fixture::new(OperationMode::Move, &[]);
    fx.inventory
        .set_root_error(fx.root_id, "bad criterion")
        .unwrap();
    let scheduler = Scheduler::new(Arc::clone(&fx.orchestrator), 1, Duration::from_millis(10)).unwrap();

    assert_eq!(scheduler.tick().unwrap(), 0);
    assert!(scheduler.handle(fx.root_id).is_none());

    fx.inventory.clear_root_error(fx.root_id).unwrap();
    assert_eq!(scheduler.tick().unwrap(), 1);
    finished(scheduler.handle(fx.root_id).unwrap().wait_timeout(WAIT));
}

#[test]
fn test_trigger_unknown_root_fails() {
    let fx = Fixture::new(OperationMode::Move, &[]);
    let scheduler = Scheduler::new(Arc::clone(&fx.orchestrator), 1, Duration::from_millis(10)).unwrap();
    assert!(matches!(
        scheduler.trigger_scan(fx.root_id + 100),
        Err(Error::NotFound(_))
    ));
}

#[test]
fn test_started_scheduler_scans_and_stops() {
    let fx = Fixture::new(OperationMode::Move, &[]);
    fx.write_file("a.txt", b"a", T0);
    let scheduler = Arc::new(
        Scheduler::new(Arc::clone(&fx.orchestrator), 1, Duration::from_millis(10)).unwrap(),
    );
    scheduler.start().unwrap();

    let mut handle = None;
    for _ in 0..3000 {
        if let Some(h) = scheduler.handle(fx.root_id) {
            handle = Some(h);
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    let summary = finished(handle.expect("no run scheduled").wait_timeout(WAIT));
    scheduler.stop();

    assert_eq!(summary.moved, 1);
    assert_eq!(fx.entry("a.txt").status, FileStatus::Moved);
}

#[test]
fn test_relocation_moves_between_locations() {
    let fx = Fixture::new(OperationMode::Move, &[]);
    fx.write_file("archive/data.bin", &[7u8; 4096], T0);
    assert_eq!(fx.scan().moved, 1);
    let (spare_id, spare) = fx.add_location("spare");
    let id = fx.entry("archive/data.bin").id;

    let job = fx.orchestrator.relocate(id, spare_id).unwrap();
    assert_eq!(job.wait(), JobState::Completed);
    let status = job.status();
    assert_eq!(status.bytes_copied, 4096);
    assert_eq!(status.total_bytes, 4096);

    let entry = fx.entry("archive/data.bin");
    assert_eq!(entry.status, FileStatus::Moved);
    assert_eq!(entry.location_id, Some(spare_id));
    assert!(!fx.cold_path("archive/data.bin").exists());
    let moved = common::cold_file(&spare, fx.root_id, "archive/data.bin");
    assert_eq!(fs::read(moved).unwrap(), vec![7u8; 4096]);
}

#[test]
fn test_cancelled_relocation_leaves_source_authoritative() {
    let fx = Fixture::new(OperationMode::Move, &[]);
    fx.write_file("keep.bin", &[1u8; 2048], T0);
    fx.scan();
    let (spare_id, spare) = fx.add_location("spare");
    let id = fx.entry("keep.bin").id;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let job = fx
        .orchestrator
        .relocate_with_token(id, spare_id, cancel)
        .unwrap();
    assert_eq!(job.wait(), JobState::Cancelled);

    assert_eq!(fx.entry("keep.bin").location_id, Some(fx.location_id));
    assert!(fx.cold_path("keep.bin").exists());
    let target = common::cold_file(&spare, fx.root_id, "keep.bin");
    assert!(!target.exists());
    let leftovers: Vec<_> = fs::read_dir(target.parent().unwrap())
        .unwrap()
        .collect();
    assert!(leftovers.is_empty());
}

#[cfg(unix)]
#[test]
fn test_relocation_repoints_placeholder_link() {
    let fx = Fixture::new(OperationMode::MoveWithLink, &[]);
    let hot = fx.write_file("l.txt", b"linked", T0);
    fx.scan();
    let (spare_id, spare) = fx.add_location("spare");
    let id = fx.entry("l.txt").id;

    assert_eq!(fx.orchestrator.relocate(id, spare_id).unwrap().wait(), JobState::Completed);
    assert_eq!(
        fs::read_link(&hot).unwrap(),
        common::cold_file(&spare, fx.root_id, "l.txt")
    );
    assert_eq!(fs::read(&hot).unwrap(), b"linked");
}

#[test]
fn test_relocation_requires_moved_entry() {
    let fx = Fixture::new(OperationMode::Move, &[("size", ">=", "0")]);
    fx.write_file("hot.txt", b"h", T0);
    fx.scan();
    let (spare_id, _) = fx.add_location("spare");
    let id = fx.entry("hot.txt").id;

    assert!(matches!(
        fx.orchestrator.relocate(id, spare_id),
        Err(Error::InvalidTransition { .. })
    ));
}
