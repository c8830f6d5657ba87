//! cryptvol command-line interface: drive one encrypted volume through its lifecycle.

use anyhow::{bail, ensure, Context, Result};
use clap::{Parser, Subcommand};
use cryptvol_core::{
    config::{CryptvolConfig, CONFIG_PATH_ENV, DEFAULT_CONFIG_PATH},
    logging, Volume, VolumeOptions, VolumeStatus,
};
use cryptvol_dmcrypt::{CryptsetupContext, CryptsetupEngine, SystemHostTools};
use log::warn;
use rpassword::prompt_password;
use schemars::schema_for;
use serde_json::to_string_pretty;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

type SystemVolume = Volume<CryptsetupContext, SystemHostTools>;

/// Top-level command-line options shared by every subcommand.
#[derive(Parser, Debug)]
#[command(
    name = "cryptvol",
    version,
    about = "Manage a single dm-crypt plain volume: activate, format, mount, unmount, tear down."
)]
struct Cli {
    /// Path to the cryptvol configuration file.
    #[arg(short, long, env = CONFIG_PATH_ENV, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Which device and mount point to operate on; falls back to `[volume]` in the config.
#[derive(clap::Args, Debug, Clone, Default)]
struct Target {
    /// Backing block device (e.g. /dev/sdb).
    #[arg(long)]
    device: Option<PathBuf>,

    /// Directory the decrypted filesystem is mounted on.
    #[arg(long)]
    mount_point: Option<PathBuf>,
}

#[derive(clap::Args, Debug, Clone, Default)]
struct Secret {
    /// Passphrase supplied directly on the command line.
    #[arg(long)]
    passphrase: Option<String>,

    /// Prompt interactively for the passphrase (the default when none is given).
    #[arg(long)]
    prompt_passphrase: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the full demo lifecycle: activate, format if needed, mount, unmount, tear down.
    Cycle {
        #[command(flatten)]
        target: Target,

        #[command(flatten)]
        secret: Secret,
    },

    /// Activate, format if needed, and mount; leaves the volume mounted on exit.
    Mount {
        #[command(flatten)]
        target: Target,

        #[command(flatten)]
        secret: Secret,
    },

    /// Unmount a previously mounted volume and deactivate its mapping.
    Unmount {
        #[command(flatten)]
        target: Target,
    },

    /// Show the mapping name, mapped device, and mount state.
    Status {
        #[command(flatten)]
        target: Target,
    },

    /// Print the JSON schema of the configuration file.
    Schema,
}

/// Entry point: parse arguments and surface errors with an exit code.
fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    logging::init("info");
    let cli = Cli::parse();

    match cli.command {
        Commands::Schema => {
            let schema = schema_for!(CryptvolConfig);
            println!("{}", to_string_pretty(&schema)?);
            Ok(())
        }
        Commands::Cycle { target, secret } => {
            let config = load_cli_config(&cli.config)?;
            let passphrase = resolve_passphrase(secret)?;
            let mut volume = open_volume(&config, &target)?;
            cycle(&mut volume, passphrase.as_bytes())
        }
        Commands::Mount { target, secret } => {
            let config = load_cli_config(&cli.config)?;
            let passphrase = resolve_passphrase(secret)?;
            let mut volume = open_volume(&config, &target)?;
            activate_and_mount(&mut volume, passphrase.as_bytes())?;
            println!(
                "Mounted {} on {} (mapping {}).",
                volume.mapped_device().display(),
                volume.mount_point().display(),
                volume.mapping_name()
            );
            volume.detach();
            Ok(())
        }
        Commands::Unmount { target } => {
            let config = load_cli_config(&cli.config)?;
            let mut volume = open_volume(&config, &target)?;
            let unmounted = volume.unmount()?;
            let attempts = volume.last_unmount_attempts();
            volume.teardown();
            ensure!(
                unmounted,
                "{} is still mounted after {attempts} attempt(s)",
                volume.mount_point().display()
            );
            println!("Unmounted {}.", volume.mount_point().display());
            Ok(())
        }
        Commands::Status { target } => {
            let config = load_cli_config(&cli.config)?;
            let volume = open_volume(&config, &target)?;
            let status = volume.status()?;
            print_status(&volume, &status);
            // Leave whatever mapping exists untouched.
            volume.detach();
            Ok(())
        }
    }
}

fn load_cli_config(path: &Path) -> Result<CryptvolConfig> {
    let config = CryptvolConfig::load_or_bootstrap(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;

    for issue in config.validate() {
        warn!("config: {issue}");
    }
    Ok(config)
}

fn resolve_passphrase(secret: Secret) -> Result<Zeroizing<String>> {
    ensure!(
        !(secret.passphrase.is_some() && secret.prompt_passphrase),
        "cannot combine --passphrase with --prompt-passphrase"
    );
    let value = match secret.passphrase {
        Some(value) => value,
        None => prompt_password("Volume passphrase: ")?,
    };
    ensure!(!value.is_empty(), "passphrase cannot be empty");
    Ok(Zeroizing::new(value))
}

fn resolve_target(config: &CryptvolConfig, target: &Target) -> Result<(PathBuf, PathBuf)> {
    let device = match (&target.device, &config.volume.device) {
        (Some(device), _) => device.clone(),
        (None, Some(device)) => PathBuf::from(device),
        (None, None) => bail!("no device given; pass --device or set volume.device"),
    };
    let mount_point = match (&target.mount_point, &config.volume.mount_point) {
        (Some(path), _) => path.clone(),
        (None, Some(path)) => PathBuf::from(path),
        (None, None) => bail!("no mount point given; pass --mount-point or set volume.mount_point"),
    };
    Ok((device, mount_point))
}

fn open_volume(config: &CryptvolConfig, target: &Target) -> Result<SystemVolume> {
    let (device, mount_point) = resolve_target(config, target)?;
    let engine = CryptsetupEngine::from_config(config)?;
    let host = SystemHostTools::from_config(config)?;
    let volume = Volume::initialize(
        &engine,
        host,
        &device,
        &mount_point,
        VolumeOptions::from_config(config),
    )
    .with_context(|| format!("failed to initialize volume on {}", device.display()))?;
    Ok(volume)
}

fn activate_and_mount(volume: &mut SystemVolume, passphrase: &[u8]) -> Result<()> {
    volume
        .set_passphrase(passphrase)
        .context("failed to activate the encrypted mapping")?;

    if volume.is_formatted()? {
        println!("Existing {} filesystem found.", volume.filesystem_type());
    } else {
        println!(
            "Creating {} filesystem on {}...",
            volume.filesystem_type(),
            volume.mapped_device().display()
        );
        ensure!(
            volume.format()?,
            "no {} superblock on {} after formatting",
            volume.filesystem_type(),
            volume.mapped_device().display()
        );
    }

    ensure!(
        volume.mount()?,
        "{} does not appear in the mount table after mounting",
        volume.mount_point().display()
    );
    Ok(())
}

fn cycle(volume: &mut SystemVolume, passphrase: &[u8]) -> Result<()> {
    println!(
        "Volume {} -> {}",
        volume.device().display(),
        volume.mapped_device().display()
    );
    activate_and_mount(volume, passphrase)?;
    println!("Mounted on {}.", volume.mount_point().display());

    let unmounted = volume.unmount()?;
    let attempts = volume.last_unmount_attempts();
    volume.teardown();
    ensure!(
        unmounted,
        "{} is still mounted after {attempts} attempt(s)",
        volume.mount_point().display()
    );
    println!("Unmounted and released after {attempts} attempt(s).");
    Ok(())
}

fn print_status(volume: &SystemVolume, status: &VolumeStatus) {
    println!("device:        {}", volume.device().display());
    println!("mount point:   {}", volume.mount_point().display());
    println!("mapping:       {}", status.mapping_name);
    println!("mapped device: {}", status.mapped_device.display());
    println!("formatted:     {}", yes_no(status.formatted));
    println!("mounted:       {}", yes_no(status.mounted));
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}
