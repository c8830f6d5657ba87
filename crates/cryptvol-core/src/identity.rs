//! Sidecar persistence for the volume's mapping name.
//!
//! The mapping name is stored next to the backing device as
//! `<device>.config`, one `field=value` line per field. Only `uuid` is
//! understood today; unknown lines are skipped so later fields can be added
//! without breaking older readers.

use crate::error::{CryptvolError, CryptvolResult};
use log::debug;
use std::ffi::OsString;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

const SIDECAR_SUFFIX: &str = ".config";
const UUID_FIELD: &str = "uuid";

/// Loads and stores the mapping name for one backing device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityStore {
    path: PathBuf,
}

impl IdentityStore {
    /// Store keyed by `device`, persisted at `<device>.config`.
    pub fn for_device(device: &Path) -> Self {
        Self {
            path: sidecar_path(device),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Return the persisted mapping name, or `None` when nothing is stored yet.
    ///
    /// When the `uuid` field appears more than once the last line wins.
    pub fn load(&self) -> CryptvolResult<Option<String>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!("no identity sidecar at {}", self.path.display());
                return Ok(None);
            }
            Err(err) => return Err(CryptvolError::Io(err)),
        };

        let mut value = None;
        for line in BufReader::new(file).lines() {
            let line = line?;
            if let Some(found) = parse_field(&line, UUID_FIELD) {
                value = Some(found.to_string());
            }
        }

        match value {
            Some(name) if !looks_like_mapping_name(&name) => {
                Err(CryptvolError::InvalidConfig(format!(
                    "{} holds an invalid mapping name `{name}`",
                    self.path.display()
                )))
            }
            other => Ok(other),
        }
    }

    /// Create or overwrite the sidecar with `mapping_name`.
    pub fn save(&self, mapping_name: &str) -> CryptvolResult<()> {
        if !looks_like_mapping_name(mapping_name) {
            return Err(CryptvolError::InvalidConfig(format!(
                "refusing to persist invalid mapping name `{mapping_name}`"
            )));
        }

        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        let mut temp = NamedTempFile::new_in(parent)?;
        writeln!(temp.as_file_mut(), "{UUID_FIELD}={mapping_name}")?;
        temp.as_file_mut().flush()?;
        temp.as_file().sync_all()?;
        temp.persist(&self.path)
            .map_err(|err| CryptvolError::Io(err.error))?;

        debug!("persisted mapping name to {}", self.path.display());
        Ok(())
    }
}

/// `<device>.config`, appended to the full device path.
pub fn sidecar_path(device: &Path) -> PathBuf {
    let mut raw = OsString::from(device.as_os_str());
    raw.push(SIDECAR_SUFFIX);
    PathBuf::from(raw)
}

/// Sanity check that `name` is usable as a device-mapper node name.
pub fn looks_like_mapping_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 127
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'))
}

fn parse_field<'a>(line: &'a str, field: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(field)?.strip_prefix('=')?;
    Some(rest.trim())
}
