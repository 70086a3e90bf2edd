//! Physical transfers between the hot tier and storage locations.
//!
//! Ordering: the destination is complete (atomic rename, or copy + fsync +
//! size check + rename into place) before the source is unlinked or replaced
//! by a link. An interruption leaves the file in one place or both, never
//! neither.

use crate::cancel::CancellationToken;
use crate::config::LinkRewrite;
use crate::error::Error;
use crate::scanner::TEMP_PREFIX;
use crate::storage::models::{OperationMode, StorageLocation};
use filetime::FileTime;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const COPY_CHUNK: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub destination: PathBuf,
    pub bytes: u64,
    /// A symlink now stands at the original location.
    pub linked: bool,
}

#[derive(Debug, Default, Clone)]
pub struct FileOperator {
    link_rewrites: Vec<LinkRewrite>,
}

impl FileOperator {
    pub fn new(link_rewrites: Vec<LinkRewrite>) -> Self {
        Self { link_rewrites }
    }

    /// Reject the transfer before any byte is written when the location is
    /// offline, or when landing `size` bytes would leave free space below
    /// the critical threshold.
    pub fn check_space(&self, location: &StorageLocation, size: u64) -> Result<(), Error> {
        if !location.is_reachable() {
            return Err(Error::DestinationUnavailable(location.name.clone()));
        }

        let root = location.root_path();
        let available = fs2::available_space(&root).map_err(|e| Error::from_io(e, &root))?;
        let total = fs2::total_space(&root).map_err(|e| Error::from_io(e, &root))?;
        let reserve = threshold_bytes(total, location.critical_threshold_pct);
        let required = size.saturating_add(reserve);

        if available < required {
            return Err(Error::InsufficientSpace {
                location: location.name.clone(),
                required,
                available,
            });
        }
        Ok(())
    }

    /// Evict `source` into `destination` (inside `location`) per `mode`.
    pub fn apply(
        &self,
        mode: OperationMode,
        source: &Path,
        location: &StorageLocation,
        destination: &Path,
    ) -> Result<Transfer, Error> {
        let metadata = fs::symlink_metadata(source).map_err(|e| Error::from_io(e, source))?;
        if !metadata.file_type().is_file() {
            return Err(Error::UnsupportedFileType(source.to_path_buf()));
        }
        let size = metadata.len();

        self.check_space(location, size)?;
        // Never land on a different file left at the destination.
        let occupied = fs::symlink_metadata(destination)
            .map(|m| m.file_type().is_file())
            .unwrap_or(false);
        if occupied && !same_content(source, destination)? {
            return Err(Error::Conflict {
                hot: source.to_path_buf(),
                cold: destination.to_path_buf(),
            });
        }
        ensure_parent(destination)?;

        let bytes = match mode {
            OperationMode::Copy => copy_verified(source, destination)?,
            OperationMode::Move | OperationMode::MoveWithLink => {
                relocate_file(source, destination)?
            }
        };

        let linked = if mode == OperationMode::MoveWithLink {
            self.link(source, destination)?;
            true
        } else {
            false
        };

        self.warn_on_caution(location);
        debug!(
            "{} {} -> {} ({} bytes)",
            mode.as_str(),
            source.display(),
            destination.display(),
            bytes
        );

        Ok(Transfer {
            destination: destination.to_path_buf(),
            bytes,
            linked,
        })
    }

    /// Bring a cold file back to `hot_path`. A placeholder symlink at
    /// `hot_path` is replaced atomically once the content is in place. A
    /// regular file already there is authoritative in COPY mode, and in the
    /// other modes only when it holds the same bytes; only then is the cold
    /// copy dropped. Any other regular file is a conflict and both copies
    /// stay untouched.
    pub fn restore(
        &self,
        mode: OperationMode,
        cold_path: &Path,
        hot_path: &Path,
    ) -> Result<u64, Error> {
        fs::symlink_metadata(cold_path).map_err(|e| Error::from_io(e, cold_path))?;

        if let Ok(hot_meta) = fs::symlink_metadata(hot_path) {
            if hot_meta.file_type().is_file() {
                if mode != OperationMode::Copy && !same_content(hot_path, cold_path)? {
                    return Err(Error::Conflict {
                        hot: hot_path.to_path_buf(),
                        cold: cold_path.to_path_buf(),
                    });
                }
                remove_file(cold_path)?;
                return Ok(0);
            }
        }

        ensure_parent(hot_path)?;
        let staging = staging_path(hot_path);
        let bytes = transfer_into(cold_path, &staging)?;
        fs::rename(&staging, hot_path).map_err(|e| Error::from_io(e, hot_path))?;
        remove_file(cold_path)?;
        debug!("Restored {} -> {}", cold_path.display(), hot_path.display());
        Ok(bytes)
    }

    /// Write the placeholder link at `original` pointing at `destination`.
    pub fn link(&self, original: &Path, destination: &Path) -> Result<(), Error> {
        let target = rewrite_link_target(destination, &self.link_rewrites);
        if fs::symlink_metadata(original).is_ok() {
            remove_file(original)?;
        }
        make_symlink(&target, original).map_err(|e| Error::from_io(e, original))?;
        Ok(())
    }

    fn warn_on_caution(&self, location: &StorageLocation) {
        let root = location.root_path();
        if let (Ok(available), Ok(total)) = (fs2::available_space(&root), fs2::total_space(&root)) {
            if available < threshold_bytes(total, location.caution_threshold_pct) {
                warn!(
                    "Storage location '{}' is below its caution threshold ({}% free space)",
                    location.name, location.caution_threshold_pct
                );
            }
        }
    }
}

fn threshold_bytes(total: u64, pct: u8) -> u64 {
    ((total as u128 * pct.min(100) as u128) / 100) as u64
}

/// Apply the first matching prefix substitution. Pure path transform, applied
/// once when the link is created.
pub fn rewrite_link_target(target: &Path, rules: &[LinkRewrite]) -> PathBuf {
    for rule in rules {
        if let Ok(rest) = target.strip_prefix(&rule.from) {
            return if rest.as_os_str().is_empty() {
                PathBuf::from(&rule.to)
            } else {
                Path::new(&rule.to).join(rest)
            };
        }
    }
    target.to_path_buf()
}

/// Byte-for-byte comparison of two regular files.
pub(crate) fn same_content(a: &Path, b: &Path) -> Result<bool, Error> {
    let len_a = fs::metadata(a).map_err(|e| Error::from_io(e, a))?.len();
    let len_b = fs::metadata(b).map_err(|e| Error::from_io(e, b))?.len();
    if len_a != len_b {
        return Ok(false);
    }

    let mut left = File::open(a).map_err(|e| Error::from_io(e, a))?;
    let mut right = File::open(b).map_err(|e| Error::from_io(e, b))?;
    let mut buf_a = vec![0u8; COPY_CHUNK];
    let mut buf_b = vec![0u8; COPY_CHUNK];
    loop {
        let n = read_full(&mut left, &mut buf_a).map_err(|e| Error::from_io(e, a))?;
        let m = read_full(&mut right, &mut buf_b).map_err(|e| Error::from_io(e, b))?;
        if n != m || buf_a[..n] != buf_b[..m] {
            return Ok(false);
        }
        if n == 0 {
            return Ok(true);
        }
    }
}

/// Fill `buf` unless the reader hits end of file first.
fn read_full(reader: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Same-filesystem rename, or verified copy then unlink across devices.
pub(crate) fn relocate_file(source: &Path, destination: &Path) -> Result<u64, Error> {
    let size = fs::symlink_metadata(source)
        .map_err(|e| Error::from_io(e, source))?
        .len();
    match fs::rename(source, destination) {
        Ok(()) => Ok(size),
        Err(e) if is_cross_device(&e) => {
            let bytes = copy_verified(source, destination)?;
            remove_file(source)?;
            Ok(bytes)
        }
        Err(e) => Err(Error::from_io(e, source)),
    }
}

/// Copy `source` into a staging path whose parent already exists.
fn transfer_into(source: &Path, staging: &Path) -> Result<u64, Error> {
    match fs::copy(source, staging) {
        Ok(_) => {
            finish_copy(source, staging)?;
            fs::symlink_metadata(staging)
                .map(|m| m.len())
                .map_err(|e| Error::from_io(e, staging))
        }
        Err(e) => {
            discard(staging);
            Err(Error::from_io(e, source))
        }
    }
}

/// Copy through a staging file next to `destination`, fsync, verify the
/// size and carry over timestamps, then rename into place.
pub(crate) fn copy_verified(source: &Path, destination: &Path) -> Result<u64, Error> {
    let staging = staging_path(destination);
    if let Err(e) = fs::copy(source, &staging) {
        discard(&staging);
        return Err(Error::from_io(e, source));
    }
    finish_copy(source, &staging)?;
    fs::rename(&staging, destination).map_err(|e| Error::from_io(e, destination))?;
    fs::symlink_metadata(destination)
        .map(|m| m.len())
        .map_err(|e| Error::from_io(e, destination))
}

/// Chunked copy that checks `cancel` between chunks. On cancellation the
/// partial staging file is removed and `destination` is untouched.
pub(crate) fn copy_cancellable<F>(
    source: &Path,
    destination: &Path,
    cancel: &CancellationToken,
    mut on_progress: F,
) -> Result<u64, Error>
where
    F: FnMut(u64, u64),
{
    let total = fs::symlink_metadata(source)
        .map_err(|e| Error::from_io(e, source))?
        .len();
    let staging = staging_path(destination);

    let result = (|| -> Result<u64, Error> {
        let mut reader = File::open(source).map_err(|e| Error::from_io(e, source))?;
        let mut writer = File::create(&staging).map_err(|e| Error::from_io(e, &staging))?;
        let mut buf = vec![0u8; COPY_CHUNK];
        let mut copied = 0u64;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let n = reader.read(&mut buf).map_err(|e| Error::from_io(e, source))?;
            if n == 0 {
                break;
            }
            writer
                .write_all(&buf[..n])
                .map_err(|e| Error::from_io(e, &staging))?;
            copied += n as u64;
            on_progress(copied, total);
        }
        writer.sync_all().map_err(|e| Error::from_io(e, &staging))?;
        Ok(copied)
    })();

    match result {
        Ok(_) => {
            finish_copy(source, &staging)?;
            fs::rename(&staging, destination).map_err(|e| Error::from_io(e, destination))?;
            Ok(total)
        }
        Err(e) => {
            discard(&staging);
            Err(e)
        }
    }
}

fn finish_copy(source: &Path, staging: &Path) -> Result<(), Error> {
    let source_meta = fs::metadata(source).map_err(|e| Error::from_io(e, source))?;
    let file = File::options()
        .write(true)
        .open(staging)
        .map_err(|e| Error::from_io(e, staging))?;
    file.sync_all().map_err(|e| Error::from_io(e, staging))?;
    let copied = file.metadata().map_err(|e| Error::from_io(e, staging))?.len();
    drop(file);

    if copied != source_meta.len() {
        discard(staging);
        return Err(Error::Other(format!(
            "size mismatch copying {}: {} of {} bytes",
            source.display(),
            copied,
            source_meta.len()
        )));
    }

    filetime::set_file_times(
        staging,
        FileTime::from_last_access_time(&source_meta),
        FileTime::from_last_modification_time(&source_meta),
    )
    .map_err(|e| Error::from_io(e, staging))?;
    Ok(())
}

pub(crate) fn staging_path(destination: &Path) -> PathBuf {
    let name = destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    destination.with_file_name(format!("{}{}.part", TEMP_PREFIX, name))
}

fn ensure_parent(path: &Path) -> Result<(), Error> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::from_io(e, parent))?;
    }
    Ok(())
}

fn remove_file(path: &Path) -> Result<(), Error> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::from_io(e, path)),
    }
}

/// Best-effort removal of a partial or leftover file.
pub(crate) fn discard(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("Removed leftover {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Could not remove leftover {}: {}", path.display(), e),
    }
}

#[cfg(unix)]
fn is_cross_device(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EXDEV)
}

#[cfg(not(unix))]
fn is_cross_device(err: &io::Error) -> bool {
    // ERROR_NOT_SAME_DEVICE
    err.raw_os_error() == Some(17)
}

#[cfg(unix)]
fn make_symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn make_symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_file(target, link)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn location(path: &Path, critical: u8) -> StorageLocation {
        StorageLocation {
            id: 1,
            name: "cold".to_string(),
            path: path.to_string_lossy().into_owned(),
            caution_threshold_pct: 0,
            critical_threshold_pct: critical,
            available: true,
        }
    }

    #[test]
    fn test_rewrite_link_target() {
        let rules = vec![LinkRewrite {
            from: "/data/cold".to_string(),
            to: "/mnt/host/cold".to_string(),
        }];
        assert_eq!(
            rewrite_link_target(Path::new("/data/cold/root-1/a.txt"), &rules),
            PathBuf::from("/mnt/host/cold/root-1/a.txt")
        );
        // Component-wise prefix only
        assert_eq!(
            rewrite_link_target(Path::new("/data/coldish/a.txt"), &rules),
            PathBuf::from("/data/coldish/a.txt")
        );
    }

    #[test]
    fn test_copy_verified_preserves_mtime() {
        let tmp = tempdir().unwrap();
        let src = tmp.path().join("src.bin");
        fs::write(&src, vec![7u8; 10_000]).unwrap();
        let old = FileTime::from_unix_time(1_600_000_000, 0);
        filetime::set_file_times(&src, old, old).unwrap();

        let dst = tmp.path().join("dst.bin");
        let bytes = copy_verified(&src, &dst).unwrap();
        assert_eq!(bytes, 10_000);
        assert!(src.exists(), "copy must not remove the source");
        let meta = fs::metadata(&dst).unwrap();
        assert_eq!(FileTime::from_last_modification_time(&meta), old);
        assert!(!staging_path(&dst).exists());
    }

    #[test]
    fn test_copy_cancellable_cancelled_leaves_no_destination() {
        let tmp = tempdir().unwrap();
        let src = tmp.path().join("src.bin");
        fs::write(&src, vec![1u8; 3 * COPY_CHUNK]).unwrap();
        let dst = tmp.path().join("dst.bin");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        let err = copy_cancellable(&src, &dst, &cancel, |copied, _| {
            if copied >= COPY_CHUNK as u64 {
                trigger.cancel();
            }
        })
        .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(!dst.exists());
        assert!(!staging_path(&dst).exists());
        assert!(src.exists());
    }

    #[test]
    fn test_critical_threshold_rejects_before_write() {
        let tmp = tempdir().unwrap();
        let hot = tmp.path().join("hot");
        let cold = tmp.path().join("cold");
        fs::create_dir_all(&hot).unwrap();
        fs::create_dir_all(&cold).unwrap();
        let src = hot.join("a.txt");
        fs::write(&src, "payload").unwrap();

        let full = location(&cold, 100);
        let dst = cold.join("a.txt");
        let err = FileOperator::default()
            .apply(OperationMode::Move, &src, &full, &dst)
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientSpace { .. }));
        assert!(src.exists());
        assert!(!dst.exists());
    }

    #[test]
    fn test_unavailable_location_rejected() {
        let tmp = tempdir().unwrap();
        let src = tmp.path().join("a.txt");
        fs::write(&src, "payload").unwrap();
        let gone = location(&tmp.path().join("unmounted"), 0);

        let err = FileOperator::default()
            .apply(OperationMode::Move, &src, &gone, &tmp.path().join("unmounted/a.txt"))
            .unwrap_err();
        assert!(matches!(err, Error::DestinationUnavailable(_)));
        assert!(src.exists());
    }

    #[test]
    fn test_same_content_compares_bytes() {
        let tmp = tempdir().unwrap();
        let a = tmp.path().join("a");
        let b = tmp.path().join("b");
        let c = tmp.path().join("c");
        let mut data = vec![3u8; COPY_CHUNK + 17];
        fs::write(&a, &data).unwrap();
        fs::write(&b, &data).unwrap();
        *data.last_mut().unwrap() = 4;
        fs::write(&c, &data).unwrap();

        assert!(same_content(&a, &b).unwrap());
        assert!(!same_content(&a, &c).unwrap());
    }

    #[test]
    fn test_restore_refuses_to_overwrite_different_hot_file() {
        let tmp = tempdir().unwrap();
        let hot = tmp.path().join("a.txt");
        let cold = tmp.path().join("cold-a.txt");
        fs::write(&cold, "AAAA").unwrap();
        fs::write(&hot, "BBBB").unwrap();

        let op = FileOperator::default();
        let err = op.restore(OperationMode::Move, &cold, &hot).unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
        assert_eq!(fs::read_to_string(&cold).unwrap(), "AAAA");
        assert_eq!(fs::read_to_string(&hot).unwrap(), "BBBB");

        // COPY mode: the hot file is the live one.
        assert_eq!(op.restore(OperationMode::Copy, &cold, &hot).unwrap(), 0);
        assert!(!cold.exists());
        assert_eq!(fs::read_to_string(&hot).unwrap(), "BBBB");
    }

    #[test]
    fn test_discard_tolerates_missing_file() {
        let tmp = tempdir().unwrap();
        let leftover = tmp.path().join(".frostline-a.txt.part");
        fs::write(&leftover, "partial").unwrap();

        discard(&leftover);
        assert!(!leftover.exists());
        discard(&leftover);
    }

    #[test]
    fn test_restore_drops_identical_cold_copy() {
        let tmp = tempdir().unwrap();
        let hot = tmp.path().join("a.txt");
        let cold = tmp.path().join("cold-a.txt");
        fs::write(&cold, "same").unwrap();
        fs::write(&hot, "same").unwrap();

        FileOperator::default()
            .restore(OperationMode::Move, &cold, &hot)
            .unwrap();
        assert!(!cold.exists());
        assert_eq!(fs::read_to_string(&hot).unwrap(), "same");
    }

    #[cfg(unix)]
    #[test]
    fn test_move_with_link_and_restore() {
        let tmp = tempdir().unwrap();
        let hot = tmp.path().join("hot");
        let cold = tmp.path().join("cold");
        fs::create_dir_all(&hot).unwrap();
        fs::create_dir_all(&cold).unwrap();
        let src = hot.join("a.txt");
        fs::write(&src, "payload").unwrap();

        let op = FileOperator::default();
        let dst = cold.join("sub/a.txt");
        let transfer = op
            .apply(OperationMode::MoveWithLink, &src, &location(&cold, 0), &dst)
            .unwrap();
        assert!(transfer.linked);
        assert_eq!(fs::read_link(&src).unwrap(), dst);
        assert_eq!(fs::read_to_string(&src).unwrap(), "payload");

        op.restore(OperationMode::MoveWithLink, &dst, &src).unwrap();
        assert!(fs::symlink_metadata(&src).unwrap().file_type().is_file());
        assert_eq!(fs::read_to_string(&src).unwrap(), "payload");
        assert!(!dst.exists());
    }
}
