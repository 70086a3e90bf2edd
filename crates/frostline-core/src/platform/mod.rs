#[cfg(target_os = "macos")]
mod macos;
#[cfg(unix)]
mod unix;

use std::path::Path;

/// Platform signal for "last opened by a user application", distinct from
/// raw atime which indexers and backup agents can perturb.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LastOpened {
    /// The platform has no such signal for this file.
    Unsupported,
    /// The platform reports the file was never opened by an application.
    Never,
    /// Unix seconds of the last application open.
    At(i64),
}

#[cfg(target_os = "macos")]
pub fn last_opened(path: &Path) -> LastOpened {
    macos::last_opened(path)
}

#[cfg(not(target_os = "macos"))]
pub fn last_opened(_path: &Path) -> LastOpened {
    LastOpened::Unsupported
}

#[cfg(unix)]
pub fn user_name(uid: u32) -> Option<String> {
    unix::user_name(uid)
}

#[cfg(not(unix))]
pub fn user_name(_uid: u32) -> Option<String> {
    None
}

#[cfg(unix)]
pub fn group_name(gid: u32) -> Option<String> {
    unix::group_name(gid)
}

#[cfg(not(unix))]
pub fn group_name(_gid: u32) -> Option<String> {
    None
}
