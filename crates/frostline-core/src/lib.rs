pub mod cancel;
pub mod checksum;
pub mod clock;
pub mod config;
pub mod criteria;
pub mod error;
pub mod events;
pub mod fileop;
pub mod inventory;
pub mod locks;
pub mod orchestrator;
pub mod platform;
pub mod probe;
pub mod progress;
pub mod reconcile;
pub mod relocate;
pub mod scanner;
pub mod scheduler;
pub mod storage;

pub use cancel::CancellationToken;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::AppConfig;
pub use error::{Error, ErrorClass};
pub use events::{ScanEventSink, ScanOutcome, ScanSummary};
pub use inventory::Inventory;
pub use orchestrator::ScanOrchestrator;
pub use progress::{ProgressReporter, ScanPhase, SilentReporter};
pub use relocate::{JobHandle, JobState};
pub use scheduler::{RunResult, ScanHandle, Scheduler};
