//! Live mount-table inspection.
//!
//! Matching is a plain substring test against each line of the table: a line
//! counts when it mentions either the mount point or the mapped device. Both
//! paths are expected to be fully qualified, so the coarse match is accepted.

use log::debug;
use std::borrow::Cow;
use std::env;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

/// Mount table of the calling process.
pub const DEFAULT_MOUNT_TABLE: &str = "/proc/self/mounts";
/// Overrides the mount-table location (used by tests and chroot setups).
pub const MOUNTS_OVERRIDE_ENV: &str = "CRYPTVOL_MOUNTS_PATH";

/// Handle on a mount table file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountTable {
    path: PathBuf,
}

impl MountTable {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Use `configured`, unless `CRYPTVOL_MOUNTS_PATH` points somewhere else.
    pub fn resolve(configured: &Path) -> Self {
        match env::var_os(MOUNTS_OVERRIDE_ENV) {
            Some(path) if !path.is_empty() => Self::new(path),
            _ => Self::new(configured),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True when any line of the table mentions `mount_point` or `device`.
    ///
    /// An unreadable table means nothing is mounted.
    pub fn is_mounted(&self, mount_point: &Path, device: &Path) -> bool {
        match File::open(&self.path) {
            Ok(file) => table_mentions(BufReader::new(file), mount_point, device),
            Err(err) => {
                debug!(
                    "mount table {} unreadable ({err}); treating as not mounted",
                    self.path.display()
                );
                false
            }
        }
    }
}

impl Default for MountTable {
    fn default() -> Self {
        Self::resolve(Path::new(DEFAULT_MOUNT_TABLE))
    }
}

/// Scan `reader` line by line for either path, raw or in the kernel's escaped form.
///
/// Lines are compared as bytes; mount points need not be valid UTF-8.
pub fn table_mentions<R: BufRead>(reader: R, mount_point: &Path, device: &Path) -> bool {
    let needles = needles_for(&[mount_point, device]);
    if needles.is_empty() {
        return false;
    }

    for line in reader.split(b'\n') {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                debug!("mount table read stopped early: {err}");
                return false;
            }
        };
        if needles.iter().any(|needle| contains_bytes(&line, needle)) {
            return true;
        }
    }
    false
}

fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

fn needles_for(paths: &[&Path]) -> Vec<Vec<u8>> {
    let mut needles = Vec::new();
    for path in paths {
        let raw = path.as_os_str().as_bytes();
        if raw.is_empty() {
            continue;
        }
        if let Cow::Owned(escaped) = escape_mount_field(raw) {
            needles.push(escaped);
        }
        needles.push(raw.to_vec());
    }
    needles
}

/// Apply the octal escaping the kernel uses for whitespace and backslashes.
fn escape_mount_field(input: &[u8]) -> Cow<'_, [u8]> {
    if !input.iter().any(|b| matches!(b, b' ' | b'\t' | b'\n' | b'\\')) {
        return Cow::Borrowed(input);
    }

    let mut output = Vec::with_capacity(input.len() + 8);
    for &byte in input {
        match byte {
            b' ' => output.extend_from_slice(b"\\040"),
            b'\t' => output.extend_from_slice(b"\\011"),
            b'\n' => output.extend_from_slice(b"\\012"),
            b'\\' => output.extend_from_slice(b"\\134"),
            other => output.push(other),
        }
    }
    Cow::Owned(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;
    use std::fs;
    use std::io::Cursor;
    use tempfile::tempdir;

    const SNAPSHOT: &str = "\
proc /proc proc rw,nosuid,nodev,noexec,relatime 0 0
/dev/sda1 / ext4 rw,relatime 0 0
/dev/mapper/3f2504e0 /tmp/mnt ext3 rw,relatime 0 0
";

    #[test]
    fn matches_mount_point_or_device() {
        let mnt = Path::new("/tmp/mnt");
        let dev = Path::new("/dev/mapper/3f2504e0");
        let other = Path::new("/dev/mapper/other");
        let elsewhere = Path::new("/srv/elsewhere");

        assert!(table_mentions(Cursor::new(SNAPSHOT), mnt, other));
        assert!(table_mentions(Cursor::new(SNAPSHOT), elsewhere, dev));
        assert!(!table_mentions(Cursor::new(SNAPSHOT), elsewhere, other));
    }

    #[test]
    fn escaped_mount_points_are_detected() {
        let snapshot = "/dev/mapper/vault /media/LOCK\\040BOX ext3 rw 0 0\n";
        assert!(table_mentions(
            Cursor::new(snapshot),
            Path::new("/media/LOCK BOX"),
            Path::new("/dev/mapper/none")
        ));
    }

    #[test]
    fn empty_paths_never_match() {
        assert!(!table_mentions(
            Cursor::new(SNAPSHOT),
            Path::new(""),
            Path::new("")
        ));
    }

    #[test]
    fn missing_table_reports_not_mounted() {
        let dir = tempdir().unwrap();
        let table = MountTable::new(dir.path().join("absent"));
        assert!(!table.is_mounted(Path::new("/tmp/mnt"), Path::new("/dev/mapper/x")));
    }

    #[test]
    fn reads_table_from_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mounts");
        fs::write(&path, SNAPSHOT).unwrap();
        let table = MountTable::new(&path);
        assert!(table.is_mounted(Path::new("/tmp/mnt"), Path::new("/dev/mapper/x")));
        assert!(!table.is_mounted(Path::new("/mnt/none"), Path::new("/dev/mapper/x")));
    }

    #[test]
    fn escape_matches_kernel_encoding() {
        assert_eq!(&*escape_mount_field(b"/mnt/keys"), b"/mnt/keys");
        assert_eq!(&*escape_mount_field(b"/a b\\c"), b"/a\\040b\\134c");
    }

    #[test]
    fn lines_after_invalid_utf8_are_still_scanned() {
        let mut snapshot = b"/dev/sdc1 /media/caf\xe9 vfat rw 0 0\n".to_vec();
        snapshot.extend_from_slice(b"/dev/mapper/vault /tmp/mnt ext3 rw 0 0\n");

        assert!(table_mentions(
            Cursor::new(&snapshot),
            Path::new("/tmp/mnt"),
            Path::new("/dev/mapper/none")
        ));
        assert!(table_mentions(
            Cursor::new(&snapshot),
            Path::new("/srv/none"),
            Path::new("/dev/mapper/vault")
        ));
    }

    #[test]
    fn non_utf8_mount_points_match_byte_for_byte() {
        let snapshot = b"/dev/mapper/vault /media/caf\xe9 ext3 rw 0 0\n".to_vec();
        let latin1 = Path::new(OsStr::from_bytes(b"/media/caf\xe9"));
        let utf8 = Path::new("/media/caf\u{e9}");

        assert!(table_mentions(Cursor::new(&snapshot), latin1, Path::new("/dev/mapper/x")));
        assert!(!table_mentions(Cursor::new(&snapshot), utf8, Path::new("/dev/mapper/x")));
    }
}
