//! Per-root timers on a fixed worker pool. Manual and timed triggers share
//! one run registry, so a trigger for a root that is already scanning gets
//! the running handle back instead of a second run.

use crate::cancel::CancellationToken;
use crate::config::effective_scan_interval;
use crate::error::Error;
use crate::events::ScanSummary;
use crate::orchestrator::ScanOrchestrator;
use crate::progress::{ProgressSnapshot, ScanProgress};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub enum RunResult {
    Finished(ScanSummary),
    /// The run never got going (lock held elsewhere, root vanished).
    Failed(String),
}

#[derive(Debug, Default)]
struct RunState {
    progress: ScanProgress,
    cancel: CancellationToken,
    result: Mutex<Option<RunResult>>,
    done: Condvar,
}

impl RunState {
    fn finish(&self, result: RunResult) {
        match self.result.lock() {
            Ok(mut slot) => *slot = Some(result),
            Err(poisoned) => *poisoned.into_inner() = Some(result),
        }
        self.done.notify_all();
    }

    fn is_finished(&self) -> bool {
        self.result.lock().map(|r| r.is_some()).unwrap_or(true)
    }
}

/// Handle to a scan run.
#[derive(Debug, Clone)]
pub struct ScanHandle {
    pub root_id: i64,
    /// The trigger coalesced onto a run that was already in progress.
    pub already_running: bool,
    run: Arc<RunState>,
}

impl ScanHandle {
    pub fn progress(&self) -> ProgressSnapshot {
        self.run.progress.snapshot()
    }

    pub fn cancel(&self) {
        self.run.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.run.is_finished()
    }

    /// Block until the run ends.
    pub fn wait(&self) -> RunResult {
        let mut slot = match self.run.result.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        loop {
            if let Some(result) = slot.as_ref() {
                return result.clone();
            }
            slot = match self.run.done.wait(slot) {
                Ok(slot) => slot,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    /// Like `wait`, giving up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<RunResult> {
        let slot = match self.run.result.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        let (slot, _) = match self
            .run
            .done
            .wait_timeout_while(slot, timeout, |r| r.is_none())
        {
            Ok(pair) => pair,
            Err(poisoned) => poisoned.into_inner(),
        };
        slot.clone()
    }
}

pub struct Scheduler {
    orchestrator: Arc<ScanOrchestrator>,
    pool: rayon::ThreadPool,
    /// Latest run per root, running or finished.
    runs: DashMap<i64, Arc<RunState>>,
    /// Unix second at which each root is next due.
    next_due: DashMap<i64, i64>,
    tick: Duration,
    stop: CancellationToken,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        orchestrator: Arc<ScanOrchestrator>,
        worker_threads: usize,
        tick: Duration,
    ) -> Result<Self, Error> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(worker_threads.max(1))
            .thread_name(|i| format!("frostline-worker-{}", i))
            .build()
            .map_err(|e| Error::Other(format!("Failed to build worker pool: {}", e)))?;

        Ok(Self {
            orchestrator,
            pool,
            runs: DashMap::new(),
            next_due: DashMap::new(),
            tick,
            stop: CancellationToken::new(),
            ticker: Mutex::new(None),
        })
    }

    pub fn orchestrator(&self) -> &Arc<ScanOrchestrator> {
        &self.orchestrator
    }

    /// Start a scan of `root_id` on the pool, or return the handle of the one
    /// already running.
    pub fn trigger_scan(&self, root_id: i64) -> Result<ScanHandle, Error> {
        self.orchestrator.inventory().root(root_id)?;

        let run = match self.runs.entry(root_id) {
            Entry::Occupied(existing) if !existing.get().is_finished() => {
                info!("Scan of root {} already in progress", root_id);
                return Ok(ScanHandle {
                    root_id,
                    already_running: true,
                    run: Arc::clone(existing.get()),
                });
            }
            Entry::Occupied(mut finished) => {
                let run = Arc::new(RunState::default());
                finished.insert(Arc::clone(&run));
                run
            }
            Entry::Vacant(slot) => {
                let run = Arc::new(RunState::default());
                slot.insert(Arc::clone(&run));
                run
            }
        };

        let orchestrator = Arc::clone(&self.orchestrator);
        let job = Arc::clone(&run);
        self.pool.spawn(move || {
            let result = match orchestrator.run_scan(root_id, &job.cancel, &job.progress) {
                Ok(summary) => RunResult::Finished(summary),
                Err(e) => {
                    warn!("Scan of root {} did not run: {}", root_id, e);
                    RunResult::Failed(e.to_string())
                }
            };
            job.finish(result);
        });

        Ok(ScanHandle {
            root_id,
            already_running: false,
            run,
        })
    }

    /// Handle to the current (or last) run of `root_id`.
    pub fn handle(&self, root_id: i64) -> Option<ScanHandle> {
        self.runs.get(&root_id).map(|run| ScanHandle {
            root_id,
            already_running: !run.is_finished(),
            run: Arc::clone(run.value()),
        })
    }

    /// Progress of the current (or last) run of `root_id`.
    pub fn progress(&self, root_id: i64) -> Option<ProgressSnapshot> {
        self.runs.get(&root_id).map(|run| run.progress.snapshot())
    }

    pub fn cancel(&self, root_id: i64) -> bool {
        match self.runs.get(&root_id) {
            Some(run) if !run.is_finished() => {
                run.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Trigger every enabled, healthy root whose interval has elapsed.
    /// Returns the number of new runs started.
    pub fn tick(&self) -> Result<usize, Error> {
        let now = self.orchestrator.now();
        let mut started = 0;
        self.orchestrator.inventory().refresh_location_availability()?;

        for root in self.orchestrator.inventory().roots()? {
            if !root.enabled || root.error_state.is_some() {
                continue;
            }
            let due = self.next_due.get(&root.id).map(|d| *d).unwrap_or(i64::MIN);
            if now < due {
                continue;
            }
            let interval = effective_scan_interval(root.scan_interval_secs) as i64;
            self.next_due.insert(root.id, now.saturating_add(interval));

            match self.trigger_scan(root.id) {
                Ok(handle) if !handle.already_running => started += 1,
                Ok(_) => debug!("Root {} still scanning at its next slot", root.id),
                Err(e) => error!("Could not schedule root {}: {}", root.id, e),
            }
        }
        Ok(started)
    }

    /// Run `tick` on a background thread every tick interval until `stop`.
    pub fn start(self: &Arc<Self>) -> Result<(), Error> {
        let mut ticker = self
            .ticker
            .lock()
            .map_err(|e| Error::Other(format!("Failed to lock ticker: {}", e)))?;
        if ticker.is_some() {
            return Ok(());
        }

        let scheduler = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("frostline-ticker".to_string())
            .spawn(move || {
                info!("Scheduler started (tick {:?})", scheduler.tick);
                while !scheduler.stop.is_cancelled() {
                    if let Err(e) = scheduler.tick() {
                        error!("Scheduler tick failed: {}", e);
                    }
                    std::thread::sleep(scheduler.tick);
                }
                info!("Scheduler stopped");
            })?;
        *ticker = Some(handle);
        Ok(())
    }

    /// Stop the ticker and cancel running scans. Running scans stop between
    /// files.
    pub fn stop(&self) {
        self.stop.cancel();
        for run in self.runs.iter() {
            run.cancel.cancel();
        }
        let handle = match self.ticker.lock() {
            Ok(mut ticker) => ticker.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Scheduler ticker panicked");
            }
        }
    }
}
