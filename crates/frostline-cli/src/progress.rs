use frostline_core::{ProgressReporter, ScanPhase};
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Mutex;
use std::time::Duration;

const TICK_CHARS: &str = "⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏";

/// CLI progress reporter using indicatif.
///
/// - Recovery and reconciliation: spinner (listing size unknown upfront)
/// - Evaluation and transfers: bar over the candidate files
pub struct CliReporter {
    bar: Mutex<Option<ProgressBar>>,
}

impl CliReporter {
    pub fn new() -> Self {
        Self {
            bar: Mutex::new(None),
        }
    }

    fn spinner(message: String) -> ProgressBar {
        let pb = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        pb.set_style(style.tick_chars(TICK_CHARS));
        pb.set_message(message);
        pb.enable_steady_tick(Duration::from_millis(80));
        pb
    }

    fn counter(total: u64) -> ProgressBar {
        let pb = ProgressBar::new(total);
        let style = ProgressStyle::with_template(
            "  {spinner:.cyan} Evaluating [{bar:30.cyan/dim}] {pos}/{len} files ({eta} remaining)",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar());
        pb.set_style(style.progress_chars("━╸─").tick_chars(TICK_CHARS));
        pb.enable_steady_tick(Duration::from_millis(80));
        pb
    }

    fn with_bar<F: FnOnce(&ProgressBar)>(&self, f: F) {
        if let Ok(guard) = self.bar.lock() {
            if let Some(pb) = guard.as_ref() {
                f(pb);
            }
        }
    }

    fn replace_bar(&self, pb: Option<ProgressBar>) {
        if let Ok(mut guard) = self.bar.lock() {
            if let Some(old) = guard.take() {
                old.finish_and_clear();
            }
            *guard = pb;
        }
    }
}

impl Default for CliReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter for CliReporter {
    fn on_scan_start(&self, root_id: i64, root_path: &str) {
        self.replace_bar(Some(Self::spinner(format!(
            "Scanning root {} ({})...",
            root_id, root_path
        ))));
    }

    fn on_phase(&self, _root_id: i64, phase: ScanPhase) {
        match phase {
            ScanPhase::Recovering | ScanPhase::Reconciling => {
                self.with_bar(|pb| pb.set_message(format!("{}...", phase)));
            }
            // Transfers happen inside the evaluation bar.
            ScanPhase::Evaluating | ScanPhase::Transferring => {}
            ScanPhase::Idle | ScanPhase::Finished => self.replace_bar(None),
        }
    }

    fn on_file(&self, _root_id: i64, processed: u64, total: u64) {
        let needs_bar = self
            .bar
            .lock()
            .map(|guard| guard.as_ref().map_or(true, |pb| pb.length() != Some(total)))
            .unwrap_or(false);
        if needs_bar {
            self.replace_bar(Some(Self::counter(total)));
        }
        self.with_bar(|pb| pb.set_position(processed));
    }

    fn on_transfer(&self, _root_id: i64, rel_path: &str, bytes: u64) {
        self.with_bar(|pb| pb.println(format!("  moved {} ({} bytes)", rel_path, bytes)));
    }

    fn on_scan_complete(&self, root_id: i64, duration_secs: f64) {
        self.replace_bar(None);
        eprintln!(
            "  \x1b[32m✓\x1b[0m Scan of root {} complete in {:.2}s",
            root_id, duration_secs
        );
    }
}
