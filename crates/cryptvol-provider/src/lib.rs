#![forbid(unsafe_code)]

//! Contracts shared across cryptvol.
//!
//! The core crate drives the volume lifecycle against these traits so the
//! concrete system integrations (`cryptsetup`, `mkfs`, `mount`) stay swappable
//! and the lifecycle stays testable without root.

pub mod engine;
pub mod host;

pub use engine::{CipherSpec, CryptContext, CryptEngine, EngineError, PlainParams};
pub use host::HostTools;
