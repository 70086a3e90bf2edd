mod commands;
mod logging;
mod progress;

use std::io::{self, Write};
use std::process;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use clap::{CommandFactory, Parser};
use colored::*;
use commands::{Cli, Commands};
use dotenv::dotenv;
use frostline_core::checksum::find_duplicates;
use frostline_core::storage::models::FileStatus;
use frostline_core::{AppConfig, Inventory, JobState, ScanOrchestrator, ScanOutcome, Scheduler};
use frostline_core::{CancellationToken, ScanSummary};
use frostline_core::progress::ScanProgress;
use indicatif::{ProgressBar, ProgressStyle};
use progress::CliReporter;
use tracing::{error, info, warn};

const PURGE_EVERY: Duration = Duration::from_secs(24 * 3600);

fn main() -> Result<()> {
    dotenv().ok();

    let _guard = logging::init_logger();

    let config = match frostline_core::config::load_configuration() {
        Ok(config) => config,
        Err(err) => {
            error!("Error loading configuration: {}", err);
            process::exit(1);
        }
    };

    let args = Cli::parse();
    let Some(command) = args.command else {
        let _ = Cli::command().print_long_help();
        return Ok(());
    };

    if let Err(err) = run(command, &config) {
        error!("Error: {:#}", err);
        process::exit(1);
    }
    Ok(())
}

fn run(command: Commands, config: &AppConfig) -> Result<()> {
    match command {
        Commands::PrintConfig => {
            println!("Configuration: {:#?}", config);
            Ok(())
        }
        Commands::TruncateDb => {
            if prompt_confirm(
                "Are you SURE you want to COMPLETELY DELETE the inventory?",
                Some(false),
            )? {
                let inventory = open_inventory(config)?;
                inventory.write(|db| db.truncate_all())?;
                println!("All tables truncated");
            }
            Ok(())
        }
        Commands::SyncConfig => {
            let inventory = open_inventory(config)?;
            let roots = inventory.sync_config(config)?;
            info!(
                "Synced {} storage locations and {} monitored roots",
                config.locations.len().to_string().cyan(),
                roots.len().to_string().cyan()
            );
            Ok(())
        }
        Commands::Scan { root } => run_scan(config, root),
        Commands::Daemon => run_daemon(config),
        Commands::Status => run_status(config),
        Commands::Inventory { root, status } => run_inventory(config, root, status.as_deref()),
        Commands::Lookup { root, path } => {
            let orchestrator = orchestrator(config)?;
            let entry = orchestrator.lookup_path(root, &path)?;
            println!(
                "{} {} {} {} bytes",
                entry.id,
                entry.status,
                entry.rel_path,
                entry.size
            );
            Ok(())
        }
        Commands::Freeze { entry, location, pin } => {
            let orchestrator = orchestrator(config)?;
            let location_id = location_id(orchestrator.inventory(), &location)?;
            let frozen = orchestrator.freeze(entry, location_id, pin)?;
            info!("{} is now {} on '{}'", frozen.rel_path, frozen.status, location);
            Ok(())
        }
        Commands::Thaw { entry, pin } => {
            let orchestrator = orchestrator(config)?;
            let thawed = orchestrator.thaw(entry, pin)?;
            info!("{} is back in hot storage", thawed.rel_path);
            Ok(())
        }
        Commands::Pin { entry } => {
            orchestrator(config)?.pin_entry(entry)?;
            info!("Pinned entry {}", entry);
            Ok(())
        }
        Commands::Unpin { entry } => {
            orchestrator(config)?.unpin_entry(entry)?;
            info!("Unpinned entry {}", entry);
            Ok(())
        }
        Commands::Relocate { entry, location } => run_relocate(config, entry, &location),
        Commands::Duplicates => run_duplicates(config),
        Commands::Purge { days } => {
            let days = days.unwrap_or(config.missing_retention_days);
            let removed = orchestrator(config)?.purge(days)?;
            info!("Purged {} rows older than {} days", removed, days);
            Ok(())
        }
        Commands::ClearError { root } => {
            open_inventory(config)?.clear_root_error(root)?;
            info!("Cleared error state of root {}", root);
            Ok(())
        }
        Commands::UndoRoot { root } => {
            if !prompt_confirm(
                &format!("Restore every moved file of root {} and remove the root?", root),
                Some(false),
            )? {
                return Ok(());
            }
            let undo = orchestrator(config)?.undo_root(root)?;
            info!("{} files restored", undo.restored.to_string().green());
            for failure in &undo.failures {
                warn!("{}: {}", failure.rel_path, failure.message);
            }
            if !undo.removed {
                bail!(
                    "root {} kept: {} files could not be restored",
                    root,
                    undo.failures.len()
                );
            }
            Ok(())
        }
    }
}

fn open_inventory(config: &AppConfig) -> Result<Arc<Inventory>> {
    let inventory = Inventory::open(&config.db_path)
        .with_context(|| format!("opening inventory at {}", config.db_path))?;
    Ok(Arc::new(inventory))
}

fn orchestrator(config: &AppConfig) -> Result<Arc<ScanOrchestrator>> {
    Ok(Arc::new(ScanOrchestrator::new(open_inventory(config)?, config)))
}

fn location_id(inventory: &Inventory, name: &str) -> Result<i64> {
    inventory
        .read(|db| db.get_location_by_name(name))?
        .map(|l| l.id)
        .ok_or_else(|| anyhow!("unknown storage location '{}'", name))
}

fn run_scan(config: &AppConfig, root: i64) -> Result<()> {
    let inventory = open_inventory(config)?;
    inventory.refresh_location_availability()?;
    let orchestrator = ScanOrchestrator::new(inventory, config)
        .with_reporter(Arc::new(CliReporter::new()));

    let summary = orchestrator.run_scan(root, &CancellationToken::new(), &ScanProgress::new())?;
    print_summary(&summary);
    if summary.outcome != ScanOutcome::Completed {
        bail!(
            "scan of root {} ended {}: {}",
            root,
            summary.outcome,
            summary.error.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

fn print_summary(summary: &ScanSummary) {
    println!();
    info!(
        "Root {}: {} in {}",
        summary.root_id,
        summary.outcome.to_string().green(),
        format!("{:.2}s", summary.duration_ms as f64 / 1000.0).green(),
    );
    info!(
        "{} scanned, {} moved ({} bytes), {} already placed, {} pinned",
        summary.scanned.to_string().cyan(),
        summary.moved.to_string().cyan(),
        summary.bytes_moved.to_string().cyan(),
        summary.skipped_already_placed,
        summary.pinned,
    );
    info!(
        "{} discovered, {} missing, {} reappeared, {} recovered, {} conflicts",
        summary.discovered,
        summary.missing,
        summary.reappeared,
        summary.recovered,
        summary.conflicts,
    );
    for (location, pending) in &summary.pending_by_location {
        warn!("{} files waiting on location '{}'", pending, location);
    }
    if summary.errors() > 0 {
        warn!("{} files failed", summary.errors().to_string().red());
        for failure in &summary.failures {
            warn!("  {} ({:?}): {}", failure.rel_path, failure.class, failure.message);
        }
    }
}

fn run_daemon(config: &AppConfig) -> Result<()> {
    let orchestrator = orchestrator(config)?;
    let tick = Duration::from_millis(config.tick_interval_ms.max(1));
    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&orchestrator),
        config.worker_threads,
        tick,
    )?);
    scheduler.start()?;
    info!(
        "Daemon running with {} workers",
        config.worker_threads.to_string().cyan()
    );

    let mut last_purge = Instant::now();
    loop {
        std::thread::sleep(tick.max(Duration::from_secs(1)));
        if last_purge.elapsed() >= PURGE_EVERY {
            match orchestrator.purge(config.missing_retention_days) {
                Ok(n) => info!("Purged {} stale rows", n),
                Err(e) => error!("Purge failed: {}", e),
            }
            last_purge = Instant::now();
        }
    }
}

fn run_status(config: &AppConfig) -> Result<()> {
    let inventory = open_inventory(config)?;

    println!("{}", "Storage locations".bold());
    for location in inventory.refresh_location_availability()? {
        let state = if location.is_reachable() {
            "available".green()
        } else {
            "unavailable".red()
        };
        println!(
            "  [{}] {} {} ({}) critical {}%",
            location.id, location.name, location.path, state, location.critical_threshold_pct
        );
    }

    println!("{}", "Monitored roots".bold());
    for root in inventory.roots()? {
        let state = match (&root.error_state, root.enabled) {
            (Some(reason), _) => format!("error: {}", reason).red(),
            (None, false) => "disabled".yellow(),
            (None, true) => "enabled".green(),
        };
        println!(
            "  [{}] {} {} every {}s ({})",
            root.id, root.path, root.mode.as_str(), root.scan_interval_secs, state
        );
        for (status, count, bytes) in inventory.status_counts(root.id)? {
            println!("      {:<10} {:>8} files {:>14} bytes", status, count, bytes);
        }
        if let Some(run) = inventory.scan_runs(root.id, 1)?.first() {
            println!(
                "      last scan {} {}: {} moved, {} errors",
                run.started_at, run.outcome, run.moved, run.errors
            );
        }
    }
    Ok(())
}

fn run_inventory(config: &AppConfig, root: i64, status: Option<&str>) -> Result<()> {
    let inventory = open_inventory(config)?;
    let entries = match status {
        Some(s) => {
            let status: FileStatus = s
                .to_ascii_uppercase()
                .parse()
                .map_err(|_| anyhow!("unknown status '{}'", s))?;
            inventory.entries_with_status(root, status)?
        }
        None => inventory.entries(root)?,
    };
    for entry in &entries {
        let error = entry.last_error.as_deref().unwrap_or("");
        println!(
            "{:>8} {:<9} {:<4} {:>12} {} {}",
            entry.id,
            entry.status.as_str(),
            entry.tier.as_str(),
            entry.size,
            entry.rel_path,
            error.red()
        );
    }
    info!("{} entries", entries.len());
    Ok(())
}

fn run_relocate(config: &AppConfig, entry: i64, location: &str) -> Result<()> {
    let orchestrator = orchestrator(config)?;
    let target = location_id(orchestrator.inventory(), location)?;
    let job = orchestrator.relocate(entry, target)?;

    let pb = ProgressBar::new(job.status().total_bytes);
    pb.set_style(
        ProgressStyle::with_template("  Relocating [{bar:30.cyan/dim}] {bytes}/{total_bytes}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("━╸─"),
    );
    while job.status().state == JobState::Running {
        pb.set_position(job.status().bytes_copied);
        std::thread::sleep(Duration::from_millis(100));
    }
    pb.finish_and_clear();

    match job.wait() {
        JobState::Completed => {
            info!("Entry {} relocated to '{}'", entry, location);
            Ok(())
        }
        JobState::Cancelled => bail!("relocation of entry {} was cancelled", entry),
        JobState::Failed(reason) => bail!("relocation of entry {} failed: {}", entry, reason),
        JobState::Running => bail!("relocation of entry {} did not finish", entry),
    }
}

fn run_duplicates(config: &AppConfig) -> Result<()> {
    let inventory = open_inventory(config)?;
    let groups = find_duplicates(&inventory, config)?;

    for group in &groups {
        println!(
            "{:016x} {} bytes x{} ({} wasted)",
            group.checksum,
            group.size,
            group.entries.len(),
            group.wasted_bytes.to_string().red()
        );
        for entry in &group.entries {
            println!("    [{}] root {} {} ({})", entry.id, entry.root_id, entry.rel_path, entry.tier.as_str());
        }
    }
    info!(
        "{} duplicate groups, {} bytes wasted",
        groups.len().to_string().red(),
        groups.iter().map(|g| g.wasted_bytes).sum::<u64>().to_string().red()
    );
    Ok(())
}

fn prompt_confirm(prompt: &str, default: Option<bool>) -> io::Result<bool> {
    let mut input = String::new();

    loop {
        input.clear();

        match default {
            Some(true) => print!("{} (Y/n): ", prompt),
            Some(false) | None => print!("{} (y/N): ", prompt),
        }
        io::stdout().flush()?;

        io::stdin().read_line(&mut input)?;

        match input.trim().to_uppercase().as_str() {
            "Y" => return Ok(true),
            "N" => return Ok(false),
            "" => match default {
                Some(default) => return Ok(default),
                None => continue,
            },
            _ => continue,
        }
    }
}
