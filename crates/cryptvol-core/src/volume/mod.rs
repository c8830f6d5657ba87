//! Lifecycle controller for a single encrypted volume.
//!
//! A [`Volume`] binds one backing device to a headerless dm-crypt mapping
//! named after its persisted identity, and drives format, mount, and unmount
//! through [`HostTools`]. Success of the host tools is never taken at face
//! value: format is checked by probing the superblock, mount and unmount by
//! reading the mount table.
//!
//! Legal call order is `initialize → set_passphrase → (is_formatted →) format
//! → mount → unmount → teardown`. The controller does not serialise access; a
//! `Volume` is meant to be driven from one thread.

use crate::config::CryptvolConfig;
use crate::error::{CryptvolError, CryptvolResult, EngineStage};
use crate::identity::IdentityStore;
use crate::kdf::{derive_volume_key, VolumeKey};
use crate::mounts::MountTable;
use crate::paths::normalize_path;
use cryptvol_provider::{CipherSpec, CryptContext, CryptEngine, HostTools, PlainParams};
use log::{debug, info, warn};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use uuid::Uuid;


/// Byte offset of `s_magic` in an ext2/3/4 superblock (superblock at 1024, field at 56).
pub const EXT_MAGIC_OFFSET: u64 = 1024 + 56;
/// ext2/3/4 superblock magic, stored little-endian.
pub const EXT_SUPER_MAGIC: u16 = 0xEF53;
const EXT_FAMILY: &[&str] = &["ext2", "ext3", "ext4"];

/// Bounded retry used by [`Volume::unmount`].
///
/// Best effort only: it rides out short "device busy" windows but gives up
/// after `max_attempts`, and there is no way to cancel it midway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(1000, Duration::from_millis(10))
    }
}

/// Settings that shape a volume beyond its device and mount point.
#[derive(Debug, Clone)]
pub struct VolumeOptions {
    pub filesystem_type: String,
    pub mapper_dir: PathBuf,
    pub mount_table: MountTable,
    pub cipher: CipherSpec,
    pub params: PlainParams,
    pub unmount_retry: RetryPolicy,
}

impl VolumeOptions {
    pub fn from_config(config: &CryptvolConfig) -> Self {
        Self {
            filesystem_type: config.volume.filesystem_type.trim().to_string(),
            mapper_dir: normalize_path(Path::new(&config.volume.mapper_dir)),
            mount_table: MountTable::resolve(Path::new(&config.volume.mount_table)),
            cipher: config.cipher_spec(),
            params: config.plain_params(),
            unmount_retry: RetryPolicy::new(
                config.unmount.max_attempts,
                Duration::from_millis(config.unmount.delay_ms),
            ),
        }
    }
}

impl Default for VolumeOptions {
    fn default() -> Self {
        Self::from_config(&CryptvolConfig::default())
    }
}

/// Point-in-time view of a volume, as reported by `cryptvol status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeStatus {
    pub mapping_name: String,
    pub mapped_device: PathBuf,
    pub activated: bool,
    pub formatted: bool,
    pub mounted: bool,
}

/// One encrypted volume and the engine context that backs it.
pub struct Volume<C, H>
where
    C: CryptContext,
    H: HostTools,
{
    device: PathBuf,
    mount_point: PathBuf,
    filesystem_type: String,
    mapping_name: String,
    mapper_dir: PathBuf,
    mount_table: MountTable,
    unmount_retry: RetryPolicy,
    host: H,
    context: Option<C>,
    key: Option<VolumeKey>,
    activated: bool,
    last_unmount_attempts: u32,
}

impl<C, H> Volume<C, H>
where
    C: CryptContext,
    H: HostTools,
{
    /// Open an engine context for `device`, settle the mapping name, and
    /// format the context with the configured cipher.
    ///
    /// The mapping name is read from `<device>.config` when present, otherwise
    /// a random UUID is generated; either way it is written back before the
    /// volume is returned. On any failure the context is released and no
    /// volume is returned.
    pub fn initialize<E>(
        engine: &E,
        host: H,
        device: &Path,
        mount_point: &Path,
        options: VolumeOptions,
    ) -> CryptvolResult<Self>
    where
        E: CryptEngine<Context = C>,
    {
        let device = normalize_path(device);
        let mount_point = normalize_path(mount_point);

        let mut context =
            engine
                .open(&device)
                .map_err(|source| CryptvolError::EncryptionContext {
                    stage: EngineStage::Open,
                    device: device.clone(),
                    source,
                })?;

        let store = IdentityStore::for_device(&device);
        let mapping_name = match store.load()? {
            Some(name) => {
                debug!("reusing mapping name {name} from {}", store.path().display());
                name
            }
            None => Uuid::new_v4().to_string(),
        };

        context
            .format(&options.cipher, &options.params)
            .map_err(|source| CryptvolError::EncryptionContext {
                stage: EngineStage::Format,
                device: device.clone(),
                source,
            })?;

        store.save(&mapping_name)?;

        let volume = Self {
            device,
            mount_point,
            filesystem_type: options.filesystem_type,
            mapping_name,
            mapper_dir: options.mapper_dir,
            mount_table: options.mount_table,
            unmount_retry: options.unmount_retry,
            host,
            context: Some(context),
            key: None,
            activated: false,
            last_unmount_attempts: 0,
        };

        info!(
            "volume {} bound to mapped device {} (mount point {})",
            volume.device.display(),
            volume.mapped_device().display(),
            volume.mount_point.display()
        );
        Ok(volume)
    }

    /// Derive the volume key from `passphrase` and activate the mapping.
    ///
    /// A mapping that is already active counts as success. Any other engine
    /// failure tears the volume down before the error is returned.
    pub fn set_passphrase(&mut self, passphrase: &[u8]) -> CryptvolResult<()> {
        let key = derive_volume_key(passphrase);
        let name = self.mapping_name.clone();
        let result = self.context_mut()?.activate(&name, key.as_bytes());

        match result {
            Ok(()) => info!("activated mapping {name}"),
            Err(err) if err.is_already_active() => {
                info!("mapping {name} already active; reusing it");
            }
            Err(source) => {
                self.teardown();
                return Err(CryptvolError::Activation {
                    mapping: name,
                    source,
                });
            }
        }

        self.key = Some(key);
        self.activated = true;
        Ok(())
    }

    /// Check the mapped device for an ext superblock.
    ///
    /// A device that cannot be opened, or is too short to hold a superblock,
    /// reports `false`. Only failures while seeking or reading an opened
    /// device surface as errors.
    pub fn is_formatted(&self) -> CryptvolResult<bool> {
        self.ensure_live()?;

        if !EXT_FAMILY.contains(&self.filesystem_type.as_str()) {
            debug!(
                "filesystem type {} is checked with the ext superblock magic",
                self.filesystem_type
            );
        }

        let mapped = self.mapped_device();
        let mut file = match File::open(&mapped) {
            Ok(file) => file,
            Err(err) => {
                debug!("cannot open {} for probing: {err}", mapped.display());
                return Ok(false);
            }
        };

        file.seek(SeekFrom::Start(EXT_MAGIC_OFFSET))?;
        let mut magic = [0u8; 2];
        match file.read_exact(&mut magic) {
            Ok(()) => Ok(u16::from_le_bytes(magic) == EXT_SUPER_MAGIC),
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
            Err(err) => Err(CryptvolError::Io(err)),
        }
    }

    /// Create the filesystem on the mapped device.
    ///
    /// Returns whether a valid superblock is present afterwards, whatever the
    /// formatting tool reported.
    pub fn format(&mut self) -> CryptvolResult<bool> {
        self.ensure_activated()?;
        let mapped = self.mapped_device();

        if let Err(err) = self.host.make_filesystem(&self.filesystem_type, &mapped) {
            warn!(
                "mkfs -t {} {} reported: {err}",
                self.filesystem_type,
                mapped.display()
            );
        }

        let formatted = self.is_formatted()?;
        if formatted {
            info!("formatted {} as {}", mapped.display(), self.filesystem_type);
        }
        Ok(formatted)
    }

    /// Mount the mapped device on the mount point.
    ///
    /// Returns whether the mount table shows the volume afterwards.
    pub fn mount(&mut self) -> CryptvolResult<bool> {
        self.ensure_activated()?;
        let mapped = self.mapped_device();

        if let Err(err) = self
            .host
            .mount(&self.filesystem_type, &mapped, &self.mount_point)
        {
            warn!(
                "mount {} on {} reported: {err}",
                mapped.display(),
                self.mount_point.display()
            );
        }

        let mounted = self.is_mounted();
        if mounted {
            info!(
                "mounted {} on {}",
                mapped.display(),
                self.mount_point.display()
            );
        }
        Ok(mounted)
    }

    /// True when the mount table mentions the mount point or the mapped device.
    ///
    /// Usable after teardown, so callers can confirm nothing was left behind.
    pub fn is_mounted(&self) -> bool {
        self.mount_table
            .is_mounted(&self.mount_point, &self.mapped_device())
    }

    /// Unmount the volume and deactivate its mapping.
    ///
    /// When nothing is mounted the mapping is deactivated and `true` returned
    /// straight away. Otherwise each attempt unmounts the mount point and the
    /// mapped device and deactivates the mapping, until the mount table is
    /// clear or the retry policy runs out. Running out reports `false`.
    pub fn unmount(&mut self) -> CryptvolResult<bool> {
        self.ensure_live()?;

        if !self.is_mounted() {
            self.last_unmount_attempts = 0;
            self.deactivate_quietly();
            return Ok(true);
        }

        let mapped = self.mapped_device();
        let policy = self.unmount_retry;
        let mut attempts = 0;

        while attempts < policy.max_attempts {
            attempts += 1;

            if let Err(err) = self.host.unmount(&self.mount_point) {
                debug!(
                    "unmount {} (attempt {attempts}): {err}",
                    self.mount_point.display()
                );
            }
            if let Err(err) = self.host.unmount(&mapped) {
                debug!("unmount {} (attempt {attempts}): {err}", mapped.display());
            }
            self.deactivate_quietly();

            if !self.is_mounted() {
                break;
            }
            if attempts < policy.max_attempts && !policy.delay.is_zero() {
                thread::sleep(policy.delay);
            }
        }

        self.last_unmount_attempts = attempts;
        let unmounted = !self.is_mounted();
        if unmounted {
            info!(
                "unmounted {} after {attempts} attempt(s)",
                self.mount_point.display()
            );
        } else {
            warn!(
                "{} still mounted after {attempts} unmount attempt(s)",
                self.mount_point.display()
            );
        }
        Ok(unmounted)
    }

    /// Deactivate the mapping, release the engine context, and forget the key.
    ///
    /// Safe to call repeatedly; only the first call does anything. The volume
    /// rejects every operation except [`Volume::is_mounted`] afterwards.
    pub fn teardown(&mut self) {
        let Some(mut context) = self.context.take() else {
            return;
        };

        if let Err(err) = context.deactivate(&self.mapping_name) {
            warn!(
                "deactivating mapping {} during teardown failed: {err}",
                self.mapping_name
            );
        }
        drop(context);

        self.key = None;
        self.activated = false;
        debug!("released encryption context for {}", self.device.display());
    }

    /// Release the engine context but leave the mapping (and any mount) in place.
    ///
    /// The persisted mapping name lets a later process pick the volume back up.
    pub fn detach(mut self) {
        if self.context.take().is_some() {
            info!(
                "detached from {}; mapping {} left active",
                self.device.display(),
                self.mapping_name
            );
        }
        self.key = None;
        self.activated = false;
    }

    pub fn status(&self) -> CryptvolResult<VolumeStatus> {
        Ok(VolumeStatus {
            mapping_name: self.mapping_name.clone(),
            mapped_device: self.mapped_device(),
            activated: self.activated,
            formatted: self.is_formatted()?,
            mounted: self.is_mounted(),
        })
    }

    pub fn device(&self) -> &Path {
        &self.device
    }

    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    pub fn filesystem_type(&self) -> &str {
        &self.filesystem_type
    }

    pub fn mapping_name(&self) -> &str {
        &self.mapping_name
    }

    /// Device-mapper node for this volume, always derived from the mapping name.
    pub fn mapped_device(&self) -> PathBuf {
        self.mapper_dir.join(&self.mapping_name)
    }

    pub fn is_activated(&self) -> bool {
        self.activated
    }

    pub fn is_released(&self) -> bool {
        self.context.is_none()
    }

    /// Number of attempts the last [`Volume::unmount`] needed (0 when nothing was mounted).
    pub fn last_unmount_attempts(&self) -> u32 {
        self.last_unmount_attempts
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    fn ensure_live(&self) -> CryptvolResult<()> {
        if self.context.is_none() {
            return Err(CryptvolError::Released);
        }
        Ok(())
    }

    fn ensure_activated(&self) -> CryptvolResult<()> {
        self.ensure_live()?;
        if !self.activated || self.key.is_none() {
            return Err(CryptvolError::NotActivated(self.mapping_name.clone()));
        }
        Ok(())
    }

    fn context_mut(&mut self) -> CryptvolResult<&mut C> {
        self.context.as_mut().ok_or(CryptvolError::Released)
    }

    fn deactivate_quietly(&mut self) {
        let Some(context) = self.context.as_mut() else {
            return;
        };
        match context.deactivate(&self.mapping_name) {
            Ok(()) => self.activated = false,
            Err(err) => debug!("deactivate {}: {err}", self.mapping_name),
        }
    }
}

impl<C, H> Drop for Volume<C, H>
where
    C: CryptContext,
    H: HostTools,
{
    fn drop(&mut self) {
        self.teardown();
    }
}

impl<C, H> std::fmt::Debug for Volume<C, H>
where
    C: CryptContext,
    H: HostTools,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("device", &self.device)
            .field("mount_point", &self.mount_point)
            .field("filesystem_type", &self.filesystem_type)
            .field("mapping_name", &self.mapping_name)
            .field("activated", &self.activated)
            .field("released", &self.context.is_none())
            .finish_non_exhaustive()
    }
}
