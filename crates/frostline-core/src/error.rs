use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Lookup miss. Also returned for paths outside every allowed root so the
    /// two cases are indistinguishable to callers.
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Source vanished: {}", .0.display())]
    SourceVanished(PathBuf),

    #[error("Insufficient space on '{location}': need {required} bytes, {available} available")]
    InsufficientSpace {
        location: String,
        required: u64,
        available: u64,
    },

    #[error("Permission denied: {}", .0.display())]
    PermissionDenied(PathBuf),

    #[error("Storage location unavailable: {0}")]
    DestinationUnavailable(String),

    #[error("{} differs from its cold copy {}", .hot.display(), .cold.display())]
    Conflict { hot: PathBuf, cold: PathBuf },

    #[error("Unsupported file type: {}", .0.display())]
    UnsupportedFileType(PathBuf),

    #[error("Invalid criterion: {0}")]
    InvalidCriterion(String),

    #[error("Misconfiguration: {0}")]
    Misconfigured(String),

    #[error("Monitored root {0} is in error state: {1}")]
    RootInErrorState(i64, String),

    #[error("Scan already in progress for root {0}")]
    ScanInProgress(i64),

    #[error("Entry {0} is busy")]
    EntryBusy(i64),

    #[error("Invalid state transition for entry {entry_id}: {from} -> {to}")]
    InvalidTransition {
        entry_id: i64,
        from: String,
        to: String,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

/// How the orchestrator reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Logged, retried next scan, scan continues.
    Transient,
    /// Owning root enters its error state; scanning halts for that root.
    Configuration,
    /// Logged with the path, scan continues with the remaining files.
    FatalPerFile,
    /// Whole scan aborts; lock released.
    FatalPerScan,
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::InsufficientSpace { .. }
            | Error::DestinationUnavailable(_)
            | Error::SourceVanished(_)
            | Error::EntryBusy(_) => ErrorClass::Transient,
            Error::InvalidCriterion(_)
            | Error::Misconfigured(_)
            | Error::Config(_)
            | Error::RootInErrorState(..) => ErrorClass::Configuration,
            Error::Database(_) | Error::Cancelled | Error::ScanInProgress(_) => {
                ErrorClass::FatalPerScan
            }
            Error::Io(e) if is_transient_io(e) => ErrorClass::Transient,
            _ => ErrorClass::FatalPerFile,
        }
    }

    /// Classify a raw IO error raised while operating on `path`.
    pub fn from_io(err: std::io::Error, path: &std::path::Path) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Error::SourceVanished(path.to_path_buf()),
            std::io::ErrorKind::PermissionDenied => Error::PermissionDenied(path.to_path_buf()),
            _ => Error::Io(err),
        }
    }
}

fn is_transient_io(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::TimedOut
    ) || matches!(err.raw_os_error(), Some(code) if is_busy_os_error(code))
}

#[cfg(unix)]
fn is_busy_os_error(code: i32) -> bool {
    code == libc::EBUSY || code == libc::ETXTBSY || code == libc::ENOSPC
}

#[cfg(not(unix))]
fn is_busy_os_error(code: i32) -> bool {
    // ERROR_SHARING_VIOLATION, ERROR_LOCK_VIOLATION
    code == 32 || code == 33
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::path::Path;

    #[test]
    fn test_missing_source_maps_to_vanished() {
        let err = Error::from_io(io::Error::from(io::ErrorKind::NotFound), Path::new("/a"));
        assert!(matches!(err, Error::SourceVanished(_)));
        assert_eq!(err.class(), ErrorClass::Transient);
    }

    #[test]
    fn test_permission_is_fatal_per_file() {
        let err = Error::from_io(
            io::Error::from(io::ErrorKind::PermissionDenied),
            Path::new("/a"),
        );
        assert_eq!(err.class(), ErrorClass::FatalPerFile);
    }

    #[test]
    fn test_classes() {
        assert_eq!(
            Error::InvalidCriterion("x".into()).class(),
            ErrorClass::Configuration
        );
        assert_eq!(
            Error::DestinationUnavailable("cold".into()).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            Error::Conflict {
                hot: "/hot/a".into(),
                cold: "/cold/a".into(),
            }
            .class(),
            ErrorClass::FatalPerFile
        );
        assert_eq!(
            Error::Database(rusqlite::Error::InvalidQuery).class(),
            ErrorClass::FatalPerScan
        );
    }
}
