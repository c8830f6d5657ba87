//! Fake host binaries used by the integration tests.

#![allow(dead_code)]

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

pub fn write_executable(path: &Path, contents: &str) -> io::Result<()> {
    fs::write(path, contents)?;
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms)?;
    Ok(())
}

/// Paths shared by the fake binaries inside one scratch directory.
pub struct FakeHost {
    pub root: PathBuf,
    pub state: PathBuf,
    pub mapper: PathBuf,
    pub table: PathBuf,
    pub bin: PathBuf,
}

impl FakeHost {
    pub fn new(root: &Path) -> io::Result<Self> {
        let host = Self {
            root: root.to_path_buf(),
            state: root.join("state"),
            mapper: root.join("mapper"),
            table: root.join("mounts"),
            bin: root.join("bin"),
        };
        fs::create_dir_all(&host.state)?;
        fs::create_dir_all(&host.mapper)?;
        fs::create_dir_all(&host.bin)?;
        fs::write(&host.table, "proc /proc proc rw 0 0\n")?;
        Ok(host)
    }

    fn render(&self, script: &str) -> String {
        script
            .replace("@STATE@", &self.state.to_string_lossy())
            .replace("@MAPPER@", &self.mapper.to_string_lossy())
            .replace("@TABLE@", &self.table.to_string_lossy())
    }

    pub fn install(&self, name: &str, script: &str) -> io::Result<PathBuf> {
        let path = self.bin.join(name);
        write_executable(&path, &self.render(script))?;
        Ok(path)
    }

    pub fn cryptsetup(&self) -> io::Result<PathBuf> {
        self.install("cryptsetup", CRYPTSETUP)
    }

    pub fn mkfs(&self) -> io::Result<PathBuf> {
        self.install("mkfs", MKFS)
    }

    pub fn mount(&self) -> io::Result<PathBuf> {
        self.install("mount", MOUNT)
    }

    pub fn umount(&self) -> io::Result<PathBuf> {
        self.install("umount", UMOUNT)
    }

    /// Every invocation recorded by the fake binaries, one per line.
    pub fn calls(&self) -> Vec<String> {
        fs::read_to_string(self.state.join("calls.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    pub fn stored_key(&self, name: &str) -> Option<Vec<u8>> {
        fs::read(self.state.join(format!("{name}.key"))).ok()
    }
}

/// Mimics plain-mode `cryptsetup open` and `close`, including the exit codes
/// for an existing mapping (5), a missing device (4), and a busy mapping (5).
const CRYPTSETUP: &str = r#"#!/bin/sh
STATE="@STATE@"
MAPPER="@MAPPER@"
TABLE="@TABLE@"
echo "cryptsetup $*" >> "$STATE/calls.log"
cmd="$1"
shift
case "$cmd" in
  open)
    dev=""
    name=""
    for arg in "$@"; do
      dev="$name"
      name="$arg"
    done
    if [ ! -e "$dev" ]; then
      echo "Device $dev does not exist or access denied." >&2
      exit 4
    fi
    if [ -e "$STATE/$name.active" ]; then
      echo "Device $name already exists." >&2
      exit 5
    fi
    cat > "$STATE/$name.key"
    touch "$STATE/$name.active"
    ln -s "$dev" "$MAPPER/$name"
    exit 0
    ;;
  close)
    name="$1"
    if grep -q -F "$MAPPER/$name " "$TABLE"; then
      echo "Device $name is still in use." >&2
      exit 5
    fi
    if [ ! -e "$STATE/$name.active" ]; then
      echo "Device $name is not active." >&2
      exit 4
    fi
    rm -f "$STATE/$name.active" "$MAPPER/$name"
    exit 0
    ;;
  *)
    echo "Unknown action." >&2
    exit 1
    ;;
esac
"#;

/// Writes the ext superblock magic at byte 1080 of the target device.
const MKFS: &str = r#"#!/bin/sh
STATE="@STATE@"
echo "mkfs $*" >> "$STATE/calls.log"
cat > "$STATE/mkfs.stdin"
dev=""
for arg in "$@"; do
  dev="$arg"
done
printf '\123\357' | dd of="$dev" bs=1 seek=1080 conv=notrunc 2>/dev/null
"#;

const MOUNT: &str = r#"#!/bin/sh
STATE="@STATE@"
TABLE="@TABLE@"
echo "mount $*" >> "$STATE/calls.log"
echo "$3 $4 $2 rw,relatime 0 0" >> "$TABLE"
"#;

/// Fails with "target is busy" while `$STATE/busy` holds a positive count.
const UMOUNT: &str = r#"#!/bin/sh
STATE="@STATE@"
TABLE="@TABLE@"
echo "umount $*" >> "$STATE/calls.log"
if [ -f "$STATE/busy" ]; then
  left=$(cat "$STATE/busy")
  if [ "$left" -gt 0 ]; then
    echo $((left - 1)) > "$STATE/busy"
    echo "umount: $1: target is busy." >&2
    exit 32
  fi
fi
if ! awk -v t="$1" '$1 == t || $2 == t { found = 1 } END { exit !found }' "$TABLE"; then
  echo "umount: $1: not mounted." >&2
  exit 32
fi
awk -v t="$1" '$1 != t && $2 != t' "$TABLE" > "$TABLE.tmp"
mv "$TABLE.tmp" "$TABLE"
"#;
