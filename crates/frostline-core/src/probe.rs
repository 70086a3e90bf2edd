//! Read-only metadata probing.
//!
//! Only `symlink_metadata` is used: file content is never opened, so probing
//! cannot perturb the access time it reports.

use crate::error::Error;
use crate::platform::{self, LastOpened};
use crate::storage::Snapshot;
use std::fs::{self, Metadata};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Directory,
    Symlink,
    Other,
}

#[derive(Debug, Clone)]
pub struct FileMetadata {
    pub path: PathBuf,
    pub file_name: String,
    pub kind: FileKind,
    pub size: u64,
    pub mtime: i64,
    /// Raw atime as reported by the filesystem.
    pub atime: i64,
    pub ctime: i64,
    /// Access time the evaluator uses (see `effective_access_time`).
    pub effective_atime: i64,
    pub uid: u32,
    pub gid: u32,
    pub owner: Option<String>,
    pub group: Option<String>,
    /// Permission bits (`mode & 0o7777`).
    pub mode: u32,
}

impl FileMetadata {
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            size: self.size as i64,
            mtime: self.mtime,
            atime: self.effective_atime,
            ctime: self.ctime,
        }
    }
}

/// Combine raw atime with the platform "last opened" signal.
///
/// A platform that explicitly says "never opened" yields the oldest
/// representable instant instead of raw atime: creation and copy mechanics
/// can leave raw atime recent on files nobody has used.
pub fn effective_access_time(raw_atime: i64, signal: LastOpened) -> i64 {
    match signal {
        LastOpened::Unsupported => raw_atime,
        LastOpened::Never => i64::MIN,
        LastOpened::At(opened) => raw_atime.max(opened),
    }
}

pub trait MetadataProber: Send + Sync {
    /// `Error::NotFound` when the path vanished since listing.
    fn probe(&self, path: &Path) -> Result<FileMetadata, Error>;
}

/// Prober backed by the host filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsProber;

impl MetadataProber for FsProber {
    fn probe(&self, path: &Path) -> Result<FileMetadata, Error> {
        let metadata = match fs::symlink_metadata(path) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::NotFound(path.display().to_string()))
            }
            Err(e) => return Err(Error::from_io(e, path)),
        };

        let kind = file_kind(&metadata);
        let atime = system_time_secs(metadata.accessed().ok());
        let signal = if kind == FileKind::File {
            platform::last_opened(path)
        } else {
            LastOpened::Unsupported
        };
        let (uid, gid, mode, ctime) = ownership_and_ctime(&metadata);

        Ok(FileMetadata {
            path: path.to_path_buf(),
            file_name: path
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_default(),
            kind,
            size: metadata.len(),
            mtime: system_time_secs(metadata.modified().ok()),
            atime,
            ctime,
            effective_atime: effective_access_time(atime, signal),
            uid,
            gid,
            owner: platform::user_name(uid),
            group: platform::group_name(gid),
            mode,
        })
    }
}

fn file_kind(metadata: &Metadata) -> FileKind {
    let file_type = metadata.file_type();
    if file_type.is_symlink() {
        FileKind::Symlink
    } else if file_type.is_dir() {
        FileKind::Directory
    } else if file_type.is_file() {
        FileKind::File
    } else {
        FileKind::Other
    }
}

pub(crate) fn system_time_secs(time: Option<SystemTime>) -> i64 {
    time.and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(unix)]
fn ownership_and_ctime(metadata: &Metadata) -> (u32, u32, u32, i64) {
    use std::os::unix::fs::MetadataExt;
    (
        metadata.uid(),
        metadata.gid(),
        metadata.mode() & 0o7777,
        metadata.ctime(),
    )
}

#[cfg(not(unix))]
fn ownership_and_ctime(metadata: &Metadata) -> (u32, u32, u32, i64) {
    let mode = if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    };
    let ctime = system_time_secs(metadata.created().ok().or(metadata.modified().ok()));
    (0, 0, mode, ctime)
}
