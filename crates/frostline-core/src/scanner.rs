use std::io;
use std::path::{Path, PathBuf};
use tracing::{error, trace};
use walkdir::WalkDir;

/// Prefix of transient files written by the file operator; never inventoried.
pub const TEMP_PREFIX: &str = ".frostline-";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedFile {
    /// Path relative to the listed root, `/`-separated.
    pub rel_path: String,
    pub is_symlink: bool,
}

/// Metadata-only recursive listing of regular files and symlinks under `root`.
/// Symlinks are reported, never followed. Unreadable subdirectories are
/// logged and skipped; an unreadable root is an error.
pub fn list_files(root: &Path) -> io::Result<Vec<ListedFile>> {
    let mut files = Vec::new();

    for entry in WalkDir::new(root).follow_links(false).min_depth(1) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                if err.depth() == 0 {
                    return Err(err
                        .into_io_error()
                        .unwrap_or_else(|| io::Error::other("walk error at root")));
                }
                if err.io_error().map(|e| e.kind()) == Some(io::ErrorKind::PermissionDenied) {
                    error!("Access denied while listing {}: {}", root.display(), err);
                    continue;
                }
                match err.into_io_error() {
                    Some(e) if e.kind() == io::ErrorKind::NotFound => continue,
                    Some(e) => return Err(e),
                    None => continue,
                }
            }
        };

        let name = entry.file_name().to_string_lossy();
        if name.starts_with(TEMP_PREFIX) {
            trace!("Skipping transient file {}", entry.path().display());
            continue;
        }

        let file_type = entry.file_type();
        if !(file_type.is_file() || file_type.is_symlink()) {
            continue;
        }

        if let Some(rel_path) = relative_path(root, entry.path()) {
            files.push(ListedFile {
                rel_path,
                is_symlink: file_type.is_symlink(),
            });
        }
    }

    Ok(files)
}

/// `/`-separated relative path of `path` under `root`.
pub fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

pub fn join_relative(root: &Path, rel_path: &str) -> PathBuf {
    rel_path
        .split('/')
        .fold(root.to_path_buf(), |acc, part| acc.join(part))
}
