//! Core building blocks for a single cryptvol-managed volume.
//!
//! Configuration, key derivation, identity persistence, mount-table probing,
//! and the `Volume` lifecycle controller live here so the adapter and CLI
//! crates only deal with host integration and operator surfaces.

pub mod config;
pub mod error;
pub mod identity;
pub mod kdf;
pub mod logging;
pub mod mounts;
pub mod paths;
pub mod volume;

pub use config::{CryptvolConfig, DEFAULT_CONFIG_PATH};
pub use error::{CryptvolError, CryptvolResult};
pub use kdf::{derive_volume_key, VolumeKey, VOLUME_KEY_LEN};
pub use paths::normalize_path;
pub use volume::{RetryPolicy, Volume, VolumeOptions, VolumeStatus};
