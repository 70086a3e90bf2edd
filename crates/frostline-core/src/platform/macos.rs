use super::LastOpened;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

const LAST_USED_XATTR: &[u8] = b"com.apple.lastuseddate#PS\0";

/// Reads the Finder/LaunchServices last-used timestamp, stored as a
/// `struct timespec` in an extended attribute.
pub fn last_opened(path: &Path) -> LastOpened {
    let c_path = match CString::new(path.as_os_str().as_bytes()) {
        Ok(p) => p,
        Err(_) => return LastOpened::Unsupported,
    };

    let mut buf = [0u8; 16];
    // SAFETY: both strings are NUL terminated and `buf` is sized to the
    // length passed in.
    let len = unsafe {
        libc::getxattr(
            c_path.as_ptr(),
            LAST_USED_XATTR.as_ptr() as *const libc::c_char,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            0,
            libc::XATTR_NOFOLLOW,
        )
    };

    if len < 0 {
        let errno = std::io::Error::last_os_error().raw_os_error();
        return match errno {
            Some(libc::ENOATTR) => LastOpened::Never,
            _ => LastOpened::Unsupported,
        };
    }
    if len < 8 {
        return LastOpened::Unsupported;
    }

    let mut secs = [0u8; 8];
    secs.copy_from_slice(&buf[..8]);
    LastOpened::At(i64::from_le_bytes(secs))
}
