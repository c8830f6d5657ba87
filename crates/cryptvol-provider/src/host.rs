//! Contract for host filesystem tooling (`mkfs`, `mount`, `umount`).
//!
//! The lifecycle never trusts these results on their own: success is decided
//! by probing the device and the mount table afterwards. Errors are still
//! surfaced so callers can log what the tool reported.

use std::error::Error;
use std::path::Path;

pub trait HostTools {
    type Error: Error + Send + Sync + 'static;

    /// Create a `fs_type` filesystem on `device`, confirming destructive prompts.
    fn make_filesystem(&self, fs_type: &str, device: &Path) -> Result<(), Self::Error>;

    /// Mount `device` as `fs_type` on `target`.
    fn mount(&self, fs_type: &str, device: &Path, target: &Path) -> Result<(), Self::Error>;

    /// Unmount whatever is mounted at (or from) `target`.
    fn unmount(&self, target: &Path) -> Result<(), Self::Error>;
}
