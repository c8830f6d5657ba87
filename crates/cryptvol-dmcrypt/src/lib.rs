#![forbid(unsafe_code)]

//! System adapters for cryptvol.
//!
//! Integrates with the host via:
//! - `cryptsetup` in plain mode (open/close) as the encryption engine
//! - `mkfs`, `mount`, and `umount` as host tools
//!
//! Every binary is driven through one subprocess runner with a timeout, so
//! tests can swap in fake executables.

mod binaries;
mod command;
mod cryptsetup;
mod host;

pub use binaries::{resolve_binary, DEFAULT_CRYPTSETUP_PATHS};
pub use cryptsetup::{CryptsetupContext, CryptsetupEngine};
pub use host::{HostError, SystemHostTools};
