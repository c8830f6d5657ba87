//! `mkfs`, `mount`, and `umount` wrappers.

use crate::binaries::{
    resolve_binary, DEFAULT_MKFS_PATHS, DEFAULT_MOUNT_PATHS, DEFAULT_UMOUNT_PATHS,
};
use crate::command::ToolCommand;
use cryptvol_core::config::CryptvolConfig;
use cryptvol_core::error::CryptvolResult;
use cryptvol_provider::HostTools;
use log::info;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// mkfs may stop to confirm writing over a device; answer every prompt.
const MKFS_ANSWERS: &[u8] = b"y\ny\ny\ny\ny\ny\ny\ny\n";

#[derive(Debug, Error)]
pub enum HostError {
    #[error("failed to run {tool}: {source}")]
    Spawn {
        tool: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{tool} exited with status {status}: {diagnostic}")]
    Failed {
        tool: &'static str,
        status: i32,
        diagnostic: String,
    },
}

/// Host tools backed by the system binaries.
///
/// `mount` and `umount` share one timeout. `mkfs` is unbounded unless
/// [`SystemHostTools::with_mkfs_timeout`] sets a limit.
#[derive(Debug, Clone)]
pub struct SystemHostTools {
    mkfs: ToolCommand,
    mount: ToolCommand,
    umount: ToolCommand,
}

impl SystemHostTools {
    pub fn new(mkfs: PathBuf, mount: PathBuf, umount: PathBuf, timeout: Duration) -> Self {
        Self {
            mkfs: ToolCommand::unbounded(mkfs),
            mount: ToolCommand::new(mount, timeout),
            umount: ToolCommand::new(umount, timeout),
        }
    }

    pub fn with_mkfs_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.mkfs = self.mkfs.with_timeout(timeout);
        self
    }

    pub fn from_config(config: &CryptvolConfig) -> CryptvolResult<Self> {
        let tools = &config.tools;
        let host = Self::new(
            resolve_binary(tools.mkfs_path.as_deref(), "mkfs", DEFAULT_MKFS_PATHS)?,
            resolve_binary(tools.mount_path.as_deref(), "mount", DEFAULT_MOUNT_PATHS)?,
            resolve_binary(tools.umount_path.as_deref(), "umount", DEFAULT_UMOUNT_PATHS)?,
            config.tool_timeout(),
        );
        Ok(host.with_mkfs_timeout(config.mkfs_timeout()))
    }
}

fn invoke(
    tool: &'static str,
    command: &ToolCommand,
    args: &[&str],
    input: Option<&[u8]>,
) -> Result<(), HostError> {
    let out = command
        .run(args, input)
        .map_err(|source| HostError::Spawn { tool, source })?;
    if out.success() {
        return Ok(());
    }
    Err(HostError::Failed {
        tool,
        status: out.status,
        diagnostic: out.describe(),
    })
}

impl HostTools for SystemHostTools {
    type Error = HostError;

    fn make_filesystem(&self, fs_type: &str, device: &Path) -> Result<(), HostError> {
        let device = device.to_string_lossy();
        invoke(
            "mkfs",
            &self.mkfs,
            &["-t", fs_type, device.as_ref()],
            Some(MKFS_ANSWERS),
        )?;
        info!("created {fs_type} filesystem on {device}");
        Ok(())
    }

    fn mount(&self, fs_type: &str, device: &Path, target: &Path) -> Result<(), HostError> {
        let device = device.to_string_lossy();
        let target = target.to_string_lossy();
        invoke(
            "mount",
            &self.mount,
            &["-t", fs_type, device.as_ref(), target.as_ref()],
            None,
        )
    }

    fn unmount(&self, target: &Path) -> Result<(), HostError> {
        let target = target.to_string_lossy();
        invoke("umount", &self.umount, &[target.as_ref()], None)
    }
}
