//! `cryptsetup`-backed encryption engine for headerless (plain) mappings.

use crate::binaries::{resolve_binary, DEFAULT_CRYPTSETUP_PATHS};
use crate::command::{Output, ToolCommand};
use cryptvol_core::config::CryptvolConfig;
use cryptvol_core::error::CryptvolResult;
use cryptvol_core::paths::normalize_path;
use cryptvol_provider::engine::{
    BUSY, INVALID_ARGUMENT, IO_FAILURE, NOT_FOUND, OUT_OF_MEMORY, PERMISSION_DENIED, TIMED_OUT,
};
use cryptvol_provider::{CipherSpec, CryptContext, CryptEngine, EngineError, PlainParams};
use log::{debug, info};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

// cryptsetup(8) exit codes.
const EXIT_INVALID_PARAMS: i32 = 1;
const EXIT_NO_PERMISSION: i32 = 2;
const EXIT_OUT_OF_MEMORY: i32 = 3;
const EXIT_WRONG_DEVICE: i32 = 4;
const EXIT_EXISTS_OR_BUSY: i32 = 5;

/// Engine that drives `cryptsetup open --type plain` and `cryptsetup close`.
#[derive(Debug, Clone)]
pub struct CryptsetupEngine {
    command: ToolCommand,
    mapper_dir: PathBuf,
}

impl CryptsetupEngine {
    pub fn new(binary: PathBuf, timeout: Duration, mapper_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: ToolCommand::new(binary, timeout),
            mapper_dir: mapper_dir.into(),
        }
    }

    pub fn from_config(config: &CryptvolConfig) -> CryptvolResult<Self> {
        let binary = resolve_binary(
            config.tools.cryptsetup_path.as_deref(),
            "cryptsetup",
            DEFAULT_CRYPTSETUP_PATHS,
        )?;
        Ok(Self::new(
            binary,
            config.tool_timeout(),
            normalize_path(Path::new(&config.volume.mapper_dir)),
        ))
    }

    pub fn binary(&self) -> &Path {
        self.command.binary()
    }

    pub fn mapper_dir(&self) -> &Path {
        &self.mapper_dir
    }
}

impl CryptEngine for CryptsetupEngine {
    type Context = CryptsetupContext;

    fn open(&self, device: &Path) -> Result<CryptsetupContext, EngineError> {
        if !device.exists() {
            return Err(EngineError::new(
                NOT_FOUND,
                format!("backing device {} does not exist", device.display()),
            ));
        }
        debug!("opened cryptsetup context for {}", device.display());
        Ok(CryptsetupContext {
            command: self.command.clone(),
            mapper_dir: self.mapper_dir.clone(),
            device: device.to_path_buf(),
            layout: None,
        })
    }
}

/// Context bound to one backing device.
///
/// Plain mappings keep no on-disk header, so the context only remembers the
/// parameters recorded by `format` and replays them on every activation.
#[derive(Debug)]
pub struct CryptsetupContext {
    command: ToolCommand,
    mapper_dir: PathBuf,
    device: PathBuf,
    layout: Option<(CipherSpec, PlainParams)>,
}

impl CryptsetupContext {
    fn node_exists(&self, name: &str) -> bool {
        self.mapper_dir.is_dir() && self.mapper_dir.join(name).exists()
    }

    fn run(&self, args: &[&str], input: Option<&[u8]>) -> Result<Output, EngineError> {
        self.command.run(args, input).map_err(|err| {
            let code = if err.kind() == io::ErrorKind::TimedOut {
                TIMED_OUT
            } else {
                IO_FAILURE
            };
            EngineError::new(code, format!("failed to run cryptsetup: {err}"))
        })
    }
}

impl CryptContext for CryptsetupContext {
    fn device(&self) -> &Path {
        &self.device
    }

    fn format(&mut self, cipher: &CipherSpec, params: &PlainParams) -> Result<(), EngineError> {
        if cipher.cipher.trim().is_empty() || cipher.mode.trim().is_empty() {
            return Err(EngineError::new(
                INVALID_ARGUMENT,
                "cipher and cipher mode must be set",
            ));
        }
        if cipher.key_bytes == 0 {
            return Err(EngineError::new(
                INVALID_ARGUMENT,
                "cipher key length must be positive",
            ));
        }
        if cipher.mode.starts_with("xts") && cipher.key_bytes % 2 != 0 {
            return Err(EngineError::new(
                INVALID_ARGUMENT,
                format!("xts needs an even key length, got {} bytes", cipher.key_bytes),
            ));
        }
        self.layout = Some((cipher.clone(), params.clone()));
        Ok(())
    }

    fn activate(&mut self, name: &str, key: &[u8]) -> Result<(), EngineError> {
        let Some((cipher, params)) = self.layout.as_ref() else {
            return Err(EngineError::new(
                INVALID_ARGUMENT,
                format!("context for {} was never formatted", self.device.display()),
            ));
        };
        if key.len() != cipher.key_bytes {
            return Err(EngineError::new(
                INVALID_ARGUMENT,
                format!(
                    "volume key is {} bytes, cipher expects {}",
                    key.len(),
                    cipher.key_bytes
                ),
            ));
        }
        if self.node_exists(name) {
            return Err(EngineError::already_active(format!(
                "mapping `{name}` already present under {}",
                self.mapper_dir.display()
            )));
        }

        let source = self.device.to_string_lossy().into_owned();
        let args = open_args(cipher, params, &source, name);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let out = self.run(&arg_refs, Some(key))?;
        if out.success() {
            info!("activated plain mapping {name} for {source}");
            return Ok(());
        }
        if out.status == EXIT_EXISTS_OR_BUSY {
            return Err(EngineError::already_active(format!(
                "cryptsetup reports mapping `{name}` already exists: {}",
                out.describe()
            )));
        }
        Err(classify_open_failure(name, &source, &out))
    }

    fn deactivate(&mut self, name: &str) -> Result<(), EngineError> {
        let mut out = self.run(&["close", name], None)?;
        if !out.success() && action_unsupported(&out) {
            out = self.run(&["remove", name], None)?;
        }
        if out.success() {
            info!("closed mapping {name}");
            return Ok(());
        }

        let lower = out.diagnostic().to_ascii_lowercase();
        if lower.contains("does not exist")
            || lower.contains("doesn't exist")
            || lower.contains("not active")
        {
            debug!("mapping {name} already inactive");
            return Ok(());
        }

        Err(classify_close_failure(name, &out))
    }
}

fn open_args(cipher: &CipherSpec, params: &PlainParams, source: &str, name: &str) -> Vec<String> {
    let mut args = vec![
        "open".to_string(),
        "--type".to_string(),
        "plain".to_string(),
        "--batch-mode".to_string(),
        "--cipher".to_string(),
        cipher.dm_cipher(),
        "--key-size".to_string(),
        cipher.key_bits().to_string(),
        // The key on stdin is already the volume key.
        "--hash".to_string(),
        "plain".to_string(),
        "--key-file".to_string(),
        "-".to_string(),
        "--keyfile-size".to_string(),
        cipher.key_bytes.to_string(),
        "--offset".to_string(),
        params.offset.to_string(),
        "--skip".to_string(),
        params.skip.to_string(),
    ];
    if params.size > 0 {
        args.push("--size".to_string());
        args.push(params.size.to_string());
    }
    args.push(source.to_string());
    args.push(name.to_string());
    args
}

fn action_unsupported(output: &Output) -> bool {
    let lower = output.diagnostic().to_ascii_lowercase();
    lower.contains("unknown action")
        || lower.contains("unknown command")
        || lower.contains("invalid action")
        || lower.contains("invalid command")
}

fn mentions_permission(lower: &str) -> bool {
    lower.contains("permission denied")
        || lower.contains("operation not permitted")
        || lower.contains("not permitted")
}

fn mentions_missing(lower: &str) -> bool {
    lower.contains("no such file")
        || lower.contains("does not exist")
        || lower.contains("not found")
        || lower.contains("cannot open device")
}

fn classify_open_failure(name: &str, source: &str, out: &Output) -> EngineError {
    let diagnostic = out.describe();
    let lower = diagnostic.to_ascii_lowercase();

    if out.status == EXIT_NO_PERMISSION || mentions_permission(&lower) {
        return EngineError::new(
            PERMISSION_DENIED,
            format!(
                "cryptsetup could not map `{source}` as `{name}`: {diagnostic}. This usually requires root"
            ),
        );
    }
    if out.status == EXIT_WRONG_DEVICE || mentions_missing(&lower) {
        return EngineError::new(
            NOT_FOUND,
            format!("cryptsetup could not access `{source}` for mapping `{name}`: {diagnostic}"),
        );
    }
    let code = match out.status {
        EXIT_INVALID_PARAMS => INVALID_ARGUMENT,
        EXIT_OUT_OF_MEMORY => OUT_OF_MEMORY,
        _ => IO_FAILURE,
    };
    EngineError::new(
        code,
        format!(
            "cryptsetup failed to map `{source}` as `{name}`: {diagnostic} (exit code {})",
            out.status
        ),
    )
}

fn classify_close_failure(name: &str, out: &Output) -> EngineError {
    let diagnostic = out.describe();
    let lower = diagnostic.to_ascii_lowercase();

    if mentions_permission(&lower) {
        return EngineError::new(
            PERMISSION_DENIED,
            format!("cryptsetup could not close mapping `{name}`: {diagnostic}. This usually requires root"),
        );
    }
    if out.status == EXIT_EXISTS_OR_BUSY || lower.contains("busy") || lower.contains("in use") {
        return EngineError::new(
            BUSY,
            format!("mapping `{name}` is still in use: {diagnostic}"),
        );
    }
    EngineError::new(
        IO_FAILURE,
        format!(
            "cryptsetup failed to close mapping `{name}`: {diagnostic} (exit code {})",
            out.status
        ),
    )
}
