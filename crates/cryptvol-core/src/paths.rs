//! Path normalisation for device and mount point arguments.

use std::ffi::OsString;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};

/// Collapse repeated `/` separators and strip a single trailing `/`.
///
/// The root path stays `/`. Non-UTF-8 bytes are preserved as-is.
pub fn normalize_path(path: &Path) -> PathBuf {
    let bytes = path.as_os_str().as_bytes();
    let mut out = Vec::with_capacity(bytes.len());

    for &byte in bytes {
        if byte == b'/' && out.last() == Some(&b'/') {
            continue;
        }
        out.push(byte);
    }

    if out.len() > 1 && out.last() == Some(&b'/') {
        out.pop();
    }

    PathBuf::from(OsString::from_vec(out))
}
