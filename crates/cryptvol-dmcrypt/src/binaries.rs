//! Locating host binaries.

use cryptvol_core::error::{CryptvolError, CryptvolResult};
use std::env;
use std::path::{Path, PathBuf};

pub const DEFAULT_CRYPTSETUP_PATHS: &[&str] = &[
    "/usr/sbin/cryptsetup",
    "/usr/bin/cryptsetup",
    "/sbin/cryptsetup",
    "/bin/cryptsetup",
    "/usr/local/sbin/cryptsetup",
];
pub(crate) const DEFAULT_MKFS_PATHS: &[&str] = &["/usr/sbin/mkfs", "/sbin/mkfs", "/usr/bin/mkfs"];
pub(crate) const DEFAULT_MOUNT_PATHS: &[&str] = &["/usr/bin/mount", "/bin/mount", "/sbin/mount"];
pub(crate) const DEFAULT_UMOUNT_PATHS: &[&str] =
    &["/usr/bin/umount", "/bin/umount", "/sbin/umount"];

/// Resolve `name`: an explicit `configured` path wins (and must exist), then
/// the well-known `candidates`, then `PATH`.
pub fn resolve_binary(
    configured: Option<&str>,
    name: &str,
    candidates: &[&str],
) -> CryptvolResult<PathBuf> {
    if let Some(path) = configured.map(str::trim).filter(|path| !path.is_empty()) {
        let candidate = Path::new(path);
        if !candidate.exists() {
            return Err(CryptvolError::InvalidConfig(format!(
                "{name} binary not found at {}",
                candidate.display()
            )));
        }
        return Ok(candidate.to_path_buf());
    }

    for candidate in candidates {
        let p = Path::new(candidate);
        if p.exists() {
            return Ok(p.to_path_buf());
        }
    }

    find_in_path(name).ok_or_else(|| {
        CryptvolError::InvalidConfig(format!(
            "unable to locate {name} binary; tried {candidates:?} and PATH"
        ))
    })
}

fn find_in_path(binary: &str) -> Option<PathBuf> {
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths).find_map(|dir| {
        let candidate = dir.join(binary);
        if candidate.exists() {
            Some(candidate)
        } else {
            None
        }
    })
}
