//! Contract for the block-device encryption engine.
//!
//! An engine hands out one context per backing device. The context is the
//! volume's encryption handle: it carries the cipher parameters once
//! formatted, activates and deactivates device-mapper nodes, and releases
//! whatever it holds when dropped.

use std::path::Path;
use thiserror::Error;

/// Error code reported when the requested mapping is already active (`-EEXIST`).
///
/// This is the only code the lifecycle treats as non-fatal during activation.
pub const ALREADY_ACTIVE: i32 = -17;
/// Operation not permitted (`-EPERM`).
pub const PERMISSION_DENIED: i32 = -1;
/// Device or mapping not found (`-ENOENT`).
pub const NOT_FOUND: i32 = -2;
/// Generic I/O failure (`-EIO`).
pub const IO_FAILURE: i32 = -5;
/// Engine ran out of memory (`-ENOMEM`).
pub const OUT_OF_MEMORY: i32 = -12;
/// Device busy (`-EBUSY`).
pub const BUSY: i32 = -16;
/// Invalid argument or misuse of the context (`-EINVAL`).
pub const INVALID_ARGUMENT: i32 = -22;
/// The engine did not answer in time (`-ETIMEDOUT`).
pub const TIMED_OUT: i32 = -110;

/// Failure reported by an encryption engine, modelled on negative errno codes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (error {code})")]
pub struct EngineError {
    pub code: i32,
    pub message: String,
}

impl EngineError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn already_active(message: impl Into<String>) -> Self {
        Self::new(ALREADY_ACTIVE, message)
    }

    /// True when the engine refused because the mapping already exists.
    pub fn is_already_active(&self) -> bool {
        self.code == ALREADY_ACTIVE
    }
}

/// Cipher selection applied when the context is formatted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherSpec {
    /// Block cipher name (e.g. `aes`).
    pub cipher: String,
    /// Chaining mode and IV generator (e.g. `xts-plain64`).
    pub mode: String,
    /// Volume key length in bytes. XTS splits this into two equal cipher keys.
    pub key_bytes: usize,
}

impl CipherSpec {
    /// `cipher-mode` string as understood by dm-crypt.
    pub fn dm_cipher(&self) -> String {
        format!("{}-{}", self.cipher, self.mode)
    }

    pub fn key_bits(&self) -> usize {
        self.key_bytes * 8
    }
}

impl Default for CipherSpec {
    fn default() -> Self {
        Self {
            cipher: "aes".to_string(),
            mode: "xts-plain64".to_string(),
            key_bytes: 64,
        }
    }
}

/// Headerless (plain) mapping parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlainParams {
    /// Digest named for any engine-internal key processing.
    pub hash: String,
    /// Data offset on the backing device, in 512-byte sectors.
    pub offset: u64,
    /// IV offset, in 512-byte sectors.
    pub skip: u64,
    /// Mapping size in sectors; `0` maps the whole device.
    pub size: u64,
}

impl Default for PlainParams {
    fn default() -> Self {
        Self {
            hash: "sha256".to_string(),
            offset: 0,
            skip: 0,
            size: 0,
        }
    }
}

/// Entry point into an encryption engine.
pub trait CryptEngine {
    type Context: CryptContext;

    /// Open a context bound to `device`.
    fn open(&self, device: &Path) -> Result<Self::Context, EngineError>;
}

/// Open engine context for one backing device. Dropping it releases the handle.
pub trait CryptContext {
    /// Backing device this context is bound to.
    fn device(&self) -> &Path;

    /// Record the cipher parameters for a headerless mapping.
    ///
    /// No secret is written anywhere; key material is only supplied on activation.
    fn format(&mut self, cipher: &CipherSpec, params: &PlainParams) -> Result<(), EngineError>;

    /// Expose the decrypted view of the device as `name` using raw `key` bytes.
    ///
    /// Implementations must report [`ALREADY_ACTIVE`] when `name` is already mapped.
    fn activate(&mut self, name: &str, key: &[u8]) -> Result<(), EngineError>;

    /// Remove the mapping `name`. Must succeed when the mapping is already gone.
    fn deactivate(&mut self, name: &str) -> Result<(), EngineError>;
}
