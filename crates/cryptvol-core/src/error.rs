//! Error type shared by the cryptvol crates.

use cryptvol_provider::EngineError;
use std::path::PathBuf;
use thiserror::Error;

/// Lifecycle stage at which the encryption engine failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStage {
    Open,
    Format,
    Deactivate,
}

impl std::fmt::Display for EngineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            EngineStage::Open => "open",
            EngineStage::Format => "format",
            EngineStage::Deactivate => "deactivate",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum CryptvolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("encryption context {stage} failed for {}: {source}", .device.display())]
    EncryptionContext {
        stage: EngineStage,
        device: PathBuf,
        #[source]
        source: EngineError,
    },

    #[error("activating mapping `{mapping}` failed: {source}")]
    Activation {
        mapping: String,
        #[source]
        source: EngineError,
    },

    #[error("mapping `{0}` is not active; set the passphrase first")]
    NotActivated(String),

    #[error("volume has been torn down and can no longer be used")]
    Released,

    #[error("failed to parse TOML configuration: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("failed to serialise TOML configuration: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("failed to process YAML configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type CryptvolResult<T> = Result<T, CryptvolError>;
