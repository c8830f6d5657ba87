//! Configuration model and helpers used by cryptvol binaries.

use crate::error::{CryptvolError, CryptvolResult};
use crate::kdf::VOLUME_KEY_LEN;
use crate::mounts::DEFAULT_MOUNT_TABLE;
use cryptvol_provider::{CipherSpec, PlainParams};
use log::info;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/cryptvol.toml";
/// Environment variable that overrides the configuration path for binaries.
pub const CONFIG_PATH_ENV: &str = "CRYPTVOL_CONFIG";
pub const DEFAULT_MAPPER_DIR: &str = "/dev/mapper";
pub const DEFAULT_FILESYSTEM: &str = "ext3";
const EXT_FAMILY: &[&str] = &["ext2", "ext3", "ext4"];

const BOOTSTRAP_TEMPLATE: &str = "\
# Auto-generated cryptvol configuration bootstrap.
# Point [volume] at the backing device before running `cryptvol cycle`.

[volume]
# device = \"/dev/sdb\"
# mount_point = \"/mnt/secure\"
filesystem_type = \"ext3\"
mapper_dir = \"/dev/mapper\"
mount_table = \"/proc/self/mounts\"

[crypto]
cipher = \"aes\"
cipher_mode = \"xts-plain64\"
key_bytes = 64
hash = \"sha256\"
timeout_secs = 30

[tools]
# cryptsetup_path = \"/usr/sbin/cryptsetup\"
# mkfs_path = \"/usr/sbin/mkfs\"
# mount_path = \"/usr/bin/mount\"
# umount_path = \"/usr/bin/umount\"
# mkfs runs without a time limit unless one is set here.
# mkfs_timeout_secs = 3600

[unmount]
max_attempts = 1000
delay_ms = 10
";

/// Which device and mount point we manage, and how the mapped device is exposed.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct VolumeCfg {
    #[serde(default)]
    pub device: Option<String>,

    #[serde(default)]
    pub mount_point: Option<String>,

    #[serde(default = "default_filesystem_type")]
    pub filesystem_type: String,

    #[serde(default = "default_mapper_dir")]
    pub mapper_dir: String,

    #[serde(default = "default_mount_table")]
    pub mount_table: String,
}

fn default_filesystem_type() -> String {
    DEFAULT_FILESYSTEM.to_string()
}

fn default_mapper_dir() -> String {
    DEFAULT_MAPPER_DIR.to_string()
}

fn default_mount_table() -> String {
    DEFAULT_MOUNT_TABLE.to_string()
}

impl Default for VolumeCfg {
    fn default() -> Self {
        Self {
            device: None,
            mount_point: None,
            filesystem_type: default_filesystem_type(),
            mapper_dir: default_mapper_dir(),
            mount_table: default_mount_table(),
        }
    }
}

/// Cipher selection and tool timeouts.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CryptoCfg {
    #[serde(default = "default_cipher")]
    pub cipher: String,

    #[serde(default = "default_cipher_mode")]
    pub cipher_mode: String,

    #[serde(default = "default_key_bytes")]
    pub key_bytes: usize,

    #[serde(default = "default_hash")]
    pub hash: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_cipher() -> String {
    "aes".to_string()
}

fn default_cipher_mode() -> String {
    "xts-plain64".to_string()
}

fn default_key_bytes() -> usize {
    VOLUME_KEY_LEN
}

fn default_hash() -> String {
    "sha256".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for CryptoCfg {
    fn default() -> Self {
        Self {
            cipher: default_cipher(),
            cipher_mode: default_cipher_mode(),
            key_bytes: default_key_bytes(),
            hash: default_hash(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Optional overrides for host binaries; unset entries are searched for.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ToolsCfg {
    #[serde(default)]
    pub cryptsetup_path: Option<String>,

    #[serde(default)]
    pub mkfs_path: Option<String>,

    #[serde(default)]
    pub mount_path: Option<String>,

    #[serde(default)]
    pub umount_path: Option<String>,

    /// Upper bound for `mkfs`, which scales with device size. Unset waits
    /// for it to finish.
    #[serde(default)]
    pub mkfs_timeout_secs: Option<u64>,
}

/// Bounded retry used while the kernel still reports the volume as mounted.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct UnmountCfg {
    #[serde(default = "default_unmount_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_unmount_delay")]
    pub delay_ms: u64,
}

fn default_unmount_attempts() -> u32 {
    1000
}

fn default_unmount_delay() -> u64 {
    10
}

impl Default for UnmountCfg {
    fn default() -> Self {
        Self {
            max_attempts: default_unmount_attempts(),
            delay_ms: default_unmount_delay(),
        }
    }
}

/// Top-level configuration snapshot loaded from disk.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CryptvolConfig {
    #[serde(default)]
    pub volume: VolumeCfg,

    #[serde(default)]
    pub crypto: CryptoCfg,

    #[serde(default)]
    pub tools: ToolsCfg,

    #[serde(default)]
    pub unmount: UnmountCfg,

    #[serde(skip)]
    pub path: PathBuf,

    #[serde(skip)]
    pub format: ConfigFormat,
}

/// Tracks whether we parsed TOML or YAML so writes preserve format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConfigFormat {
    #[default]
    Toml,
    Yaml,
}

impl Default for CryptvolConfig {
    fn default() -> Self {
        Self {
            volume: VolumeCfg::default(),
            crypto: CryptoCfg::default(),
            tools: ToolsCfg::default(),
            unmount: UnmountCfg::default(),
            path: PathBuf::from(DEFAULT_CONFIG_PATH),
            format: ConfigFormat::Toml,
        }
    }
}

impl CryptvolConfig {
    /// Load configuration from disk, writing the bootstrap template first
    /// when `path` does not exist yet.
    ///
    /// cryptvol runs as root, so there is no per-user fallback: a location
    /// that cannot be created is an error.
    pub fn load_or_bootstrap<P: AsRef<Path>>(path: P) -> CryptvolResult<Self> {
        let target = path.as_ref();
        if !target.exists() {
            let created = ensure_bootstrap_file(target).map_err(|err| {
                CryptvolError::InvalidConfig(format!(
                    "failed to write bootstrap configuration at {}: {err}",
                    target.display()
                ))
            })?;
            if created {
                info!("cryptvol config bootstrap created at {}", target.display());
            }
        }
        Self::load(target)
    }

    /// Read a config file from disk, detect format, and check the key length.
    pub fn load<P: AsRef<Path>>(path: P) -> CryptvolResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let is_toml = matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some(ext) if ext.eq_ignore_ascii_case("toml")
        );
        let mut cfg = if is_toml {
            toml::from_str::<Self>(&contents)?
        } else {
            serde_yaml::from_str::<Self>(&contents)?
        };

        cfg.path = path.to_path_buf();
        cfg.format = if is_toml {
            ConfigFormat::Toml
        } else {
            ConfigFormat::Yaml
        };

        if cfg.crypto.key_bytes != VOLUME_KEY_LEN {
            return Err(CryptvolError::InvalidConfig(format!(
                "crypto.key_bytes must be {VOLUME_KEY_LEN} to match the derived volume key (got {})",
                cfg.crypto.key_bytes
            )));
        }

        Ok(cfg)
    }

    /// Perform a best-effort validation pass and return human-readable issues.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        let fs_type = self.volume.filesystem_type.trim();
        if fs_type.is_empty() {
            issues.push("volume.filesystem_type must not be empty".to_string());
        } else if !fs_type
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '.'))
        {
            issues.push(format!(
                "volume.filesystem_type contains unexpected characters: {fs_type}"
            ));
        } else if !EXT_FAMILY.contains(&fs_type) {
            issues.push(format!(
                "volume.filesystem_type `{fs_type}` is not in the ext family; format detection only recognises ext superblocks"
            ));
        }

        if !Path::new(&self.volume.mapper_dir).is_absolute() {
            issues.push("volume.mapper_dir must be an absolute path".to_string());
        }

        if let Some(device) = &self.volume.device {
            if device.trim().is_empty() {
                issues.push("volume.device is set but empty".to_string());
            }
        }

        if let Some(mount_point) = &self.volume.mount_point {
            if !Path::new(mount_point).is_absolute() {
                issues.push("volume.mount_point must be an absolute path".to_string());
            }
        }

        if self.crypto.cipher.trim().is_empty() || self.crypto.cipher_mode.trim().is_empty() {
            issues.push("crypto.cipher and crypto.cipher_mode must be set".to_string());
        }
        if self.crypto.key_bytes != VOLUME_KEY_LEN {
            issues.push(format!("crypto.key_bytes must be {VOLUME_KEY_LEN}"));
        }
        if self.crypto.timeout_secs == 0 {
            issues.push("crypto.timeout_secs must be greater than 0".to_string());
        }
        if self.tools.mkfs_timeout_secs == Some(0) {
            issues.push("tools.mkfs_timeout_secs must be greater than 0 when set".to_string());
        }

        if self.unmount.max_attempts == 0 {
            issues.push("unmount.max_attempts must be at least 1".to_string());
        }

        issues
    }

    /// Cipher selection passed to the engine's format step.
    pub fn cipher_spec(&self) -> CipherSpec {
        CipherSpec {
            cipher: self.crypto.cipher.clone(),
            mode: self.crypto.cipher_mode.clone(),
            key_bytes: self.crypto.key_bytes,
        }
    }

    /// Headerless mapping parameters passed to the engine's format step.
    pub fn plain_params(&self) -> PlainParams {
        PlainParams {
            hash: self.crypto.hash.clone(),
            ..PlainParams::default()
        }
    }

    /// Translate the stored timeout into a `Duration`.
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.crypto.timeout_secs)
    }

    /// Limit for filesystem creation; `None` means wait until mkfs exits.
    pub fn mkfs_timeout(&self) -> Option<Duration> {
        self.tools.mkfs_timeout_secs.map(Duration::from_secs)
    }

    /// Persist the configuration back to its original on-disk format.
    pub fn save(&self) -> CryptvolResult<()> {
        let payload = match self.format {
            ConfigFormat::Toml => toml::to_string_pretty(self)?,
            ConfigFormat::Yaml => serde_yaml::to_string(self)?,
        };
        let mode = existing_mode(&self.path).unwrap_or_else(|| default_mode(&self.path));
        write_atomically(&self.path, payload.as_bytes(), mode, true)?;
        Ok(())
    }
}

pub fn bootstrap_template() -> &'static str {
    BOOTSTRAP_TEMPLATE
}

fn ensure_bootstrap_file(path: &Path) -> io::Result<bool> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    write_atomically(
        path,
        BOOTSTRAP_TEMPLATE.as_bytes(),
        default_mode(path),
        false,
    )
}

/// System-wide files are group-readable; anything else stays private.
fn default_mode(path: &Path) -> u32 {
    if path.starts_with("/etc/") {
        0o640
    } else {
        0o600
    }
}

fn existing_mode(path: &Path) -> Option<u32> {
    fs::metadata(path)
        .ok()
        .map(|meta| meta.permissions().mode() & 0o777)
}

/// Write `contents` next to `path` and move it into place.
///
/// With `replace` unset an existing file wins and `Ok(false)` is returned.
fn write_atomically(path: &Path, contents: &[u8], mode: u32, replace: bool) -> io::Result<bool> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let mut temp = NamedTempFile::new_in(parent)?;
    temp.as_file_mut().write_all(contents)?;
    temp.as_file_mut().flush()?;
    fs::set_permissions(temp.path(), fs::Permissions::from_mode(mode))?;
    temp.as_file().sync_all()?;

    if replace {
        temp.persist(path).map_err(|err| err.error)?;
        return Ok(true);
    }
    match temp.persist_noclobber(path) {
        Ok(_) => Ok(true),
        Err(err) if err.error.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(err.error),
    }
}
