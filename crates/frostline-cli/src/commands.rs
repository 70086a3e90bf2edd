use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "frostline")]
#[command(about = "Moves cold files off fast storage and keeps track of them", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Write configured locations, roots and criteria into the inventory
    SyncConfig,
    /// Scan one monitored root now
    Scan {
        /// Monitored root id
        root: i64,
    },
    /// Run scheduled scans until interrupted
    Daemon,
    /// Show roots, locations and entry counts
    Status,
    /// List the inventory of a root
    Inventory {
        root: i64,
        /// Only entries in this status (ACTIVE, MOVED, MISSING, ...)
        #[arg(long)]
        status: Option<String>,
    },
    /// Resolve a path under a root to its inventory entry
    Lookup { root: i64, path: PathBuf },
    /// Move an entry to a named storage location now
    Freeze {
        entry: i64,
        location: String,
        /// Keep it there
        #[arg(long)]
        pin: bool,
    },
    /// Bring a moved entry back to hot storage
    Thaw {
        entry: i64,
        /// Keep it hot
        #[arg(long)]
        pin: bool,
    },
    /// Exempt an entry from automatic moves
    Pin { entry: i64 },
    /// Remove an entry's exemption
    Unpin { entry: i64 },
    /// Move a cold entry to another storage location
    Relocate { entry: i64, location: String },
    /// Report duplicate content across all roots
    Duplicates,
    /// Delete MISSING and DELETED rows older than the retention window
    Purge {
        /// Retention in days (defaults to missing_retention_days)
        #[arg(long)]
        days: Option<u64>,
    },
    /// Clear a root's error state so scans resume
    ClearError { root: i64 },
    /// Restore every moved file of a root and drop the root
    UndoRoot { root: i64 },
    /// Print configuration values
    PrintConfig,
    /// Truncate all database tables
    TruncateDb,
}
