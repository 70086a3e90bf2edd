//! Moving an already-cold file between storage locations as a background
//! job. Holds only the entry's lock, so it runs alongside the root's scans.

use crate::cancel::CancellationToken;
use crate::error::Error;
use crate::fileop::{copy_cancellable, discard};
use crate::locks::LockGuard;
use crate::orchestrator::ScanOrchestrator;
use crate::storage::models::*;
use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Running,
    Completed,
    /// Stopped mid-copy; the entry still points at its original location.
    Cancelled,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    pub state: JobState,
    pub bytes_copied: u64,
    pub total_bytes: u64,
}

#[derive(Debug, Default)]
struct JobShared {
    state: Mutex<Option<JobState>>,
    bytes_copied: AtomicU64,
    total_bytes: AtomicU64,
}

/// Polled handle to a relocation job.
pub struct JobHandle {
    pub entry_id: i64,
    cancel: CancellationToken,
    shared: Arc<JobShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl JobHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn status(&self) -> JobStatus {
        let state = match self.shared.state.lock() {
            Ok(s) => s.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        JobStatus {
            state: state.unwrap_or(JobState::Running),
            bytes_copied: self.shared.bytes_copied.load(Ordering::SeqCst),
            total_bytes: self.shared.total_bytes.load(Ordering::SeqCst),
        }
    }

    /// Block until the job ends and return its final state.
    pub fn wait(&self) -> JobState {
        let handle = match self.thread.lock() {
            Ok(mut t) => t.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Relocation job for entry {} panicked", self.entry_id);
                return JobState::Failed("relocation job panicked".to_string());
            }
        }
        self.status().state
    }
}

impl ScanOrchestrator {
    /// Start moving a MOVED entry to `target_location_id`. Validation and
    /// the entry lock happen before returning; the copy runs in the
    /// background.
    pub fn relocate(
        self: &Arc<Self>,
        entry_id: i64,
        target_location_id: i64,
    ) -> Result<JobHandle, Error> {
        self.relocate_with_token(entry_id, target_location_id, CancellationToken::new())
    }

    /// `relocate` driven by a caller-owned cancellation token.
    pub fn relocate_with_token(
        self: &Arc<Self>,
        entry_id: i64,
        target_location_id: i64,
        cancel: CancellationToken,
    ) -> Result<JobHandle, Error> {
        let guard = self
            .entry_locks
            .try_acquire(entry_id)
            .ok_or(Error::EntryBusy(entry_id))?;
        let entry = self.inventory.entry(entry_id)?;
        if entry.status != FileStatus::Moved {
            return Err(Error::InvalidTransition {
                entry_id,
                from: entry.status.to_string(),
                to: FileStatus::Moved.to_string(),
            });
        }
        let source_id = entry.location_id.ok_or_else(|| {
            Error::Misconfigured(format!("entry {} is cold without a location", entry_id))
        })?;
        let source = self.inventory.location(source_id)?;
        let target = self.inventory.location(target_location_id)?;
        if !source.is_reachable() {
            return Err(Error::DestinationUnavailable(source.name));
        }
        self.operator
            .check_space(&target, entry.size.max(0) as u64)?;

        let shared = Arc::new(JobShared::default());
        shared
            .total_bytes
            .store(entry.size.max(0) as u64, Ordering::SeqCst);

        let thread = if source.id == target.id {
            finish(&shared, JobState::Completed);
            None
        } else {
            let orchestrator = Arc::clone(self);
            let job_cancel = cancel.clone();
            let job_shared = Arc::clone(&shared);
            Some(
                std::thread::Builder::new()
                    .name(format!("frostline-relocate-{}", entry_id))
                    .spawn(move || {
                        let state = match orchestrator.run_relocation(
                            guard,
                            &entry,
                            &source,
                            &target,
                            &job_cancel,
                            &job_shared,
                        ) {
                            Ok(()) => JobState::Completed,
                            Err(Error::Cancelled) => {
                                info!("Relocation of entry {} cancelled", entry.id);
                                JobState::Cancelled
                            }
                            Err(e) => {
                                error!("Relocation of entry {} failed: {}", entry.id, e);
                                JobState::Failed(e.to_string())
                            }
                        };
                        finish(&job_shared, state);
                    })?,
            )
        };

        Ok(JobHandle {
            entry_id,
            cancel,
            shared,
            thread: Mutex::new(thread),
        })
    }

    /// Copy to the target, repoint the entry, relink, then drop the source
    /// copy. Until the entry is repointed the source copy stays
    /// authoritative.
    fn run_relocation(
        &self,
        _guard: LockGuard<i64>,
        entry: &InventoryEntry,
        source: &StorageLocation,
        target: &StorageLocation,
        cancel: &CancellationToken,
        shared: &JobShared,
    ) -> Result<(), Error> {
        let root = self.inventory.root(entry.root_id)?;
        let from = entry.cold_path(source);
        let to = entry.cold_path(target);
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::from_io(e, parent))?;
        }

        let bytes = copy_cancellable(&from, &to, cancel, |copied, _| {
            shared.bytes_copied.store(copied, Ordering::SeqCst);
        })?;
        if cancel.is_cancelled() {
            discard(&to);
            return Err(Error::Cancelled);
        }

        self.inventory.set_entry_location(entry.id, target.id)?;
        if root.mode == OperationMode::MoveWithLink {
            self.operator.link(&entry.hot_path(&root), &to)?;
        }
        if let Err(e) = fs::remove_file(&from) {
            warn!(
                "Relocated {} but could not remove {}: {}",
                entry.rel_path,
                from.display(),
                e
            );
        }

        info!(
            "Relocated {} from '{}' to '{}' ({} bytes)",
            entry.rel_path, source.name, target.name, bytes
        );
        Ok(())
    }
}

fn finish(shared: &JobShared, state: JobState) {
    match shared.state.lock() {
        Ok(mut s) => *s = Some(state),
        Err(poisoned) => *poisoned.into_inner() = Some(state),
    }
}
