//! jmvolume command-line interface for encrypted container and key management.

use anyhow::{bail, ensure, Context, Result};
use clap::{Args, Parser, Subcommand};
use jmvolume_core::{
    config::{CONFIG_PATH_ENV, DEFAULT_CONFIG_PATH},
    logging,
    provider::ContainerState,
    ConfigFormat, JmvolumeConfig, JmvolumeError, Secret, SecretMaterial,
};
use jmvolume_gpg::GpgCipher;
use jmvolume_luks::{
    CreateOptions, EncryptedContainer, HostTools, MountedVolume, SystemProbe, UnmountOutcome,
    PRIMARY_SLOT,
};
use log::warn;
use rpassword::prompt_password;
use schemars::schema_for;
use serde_json::to_string_pretty;
use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

/// Passphrase for the key file authenticating an operation.
const PASSPHRASE_ENV: &str = "JMVOLUME_PASSPHRASE";
/// Passphrase for a key file being enrolled or generated.
const NEW_PASSPHRASE_ENV: &str = "JMVOLUME_NEW_PASSPHRASE";

/// Top-level command-line options shared by every subcommand.
#[derive(Parser, Debug)]
#[command(
    name = "jmvolume",
    version,
    about = "Create, unlock, mount, and re-key LUKS file containers."
)]
struct Cli {
    /// Path to the jmvolume configuration file.
    #[arg(short, long, env = CONFIG_PATH_ENV, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Container file plus the mapper name it opens under.
#[derive(Args, Debug)]
struct VolumeArgs {
    /// Backing container file.
    path: PathBuf,

    /// Device-mapper name (the device appears as <mapper_root>/<name>).
    #[arg(short, long)]
    name: String,
}

/// Key file authenticating the operation.
///
/// A wrapped file's passphrase is read from `JMVOLUME_PASSPHRASE` or prompted
/// for; it is never taken from the command line.
#[derive(Args, Debug)]
struct KeyArgs {
    /// Key file; passphrase-wrapped unless --raw is given.
    #[arg(short = 'k', long)]
    key_file: PathBuf,

    /// Treat --key-file as a clear backup key.
    #[arg(long)]
    raw: bool,
}

/// Key file being enrolled; its passphrase comes from
/// `JMVOLUME_NEW_PASSPHRASE` or a prompt.
#[derive(Args, Debug)]
struct NewKeyArgs {
    /// Key file to enroll; passphrase-wrapped unless --new-raw is given.
    #[arg(long)]
    new_key_file: PathBuf,

    /// Treat --new-key-file as a clear backup key.
    #[arg(long)]
    new_raw: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Allocate, format, and put a filesystem on a new container file.
    Create {
        /// Container file to create.
        path: PathBuf,

        #[command(flatten)]
        key: KeyArgs,

        /// Size in MB; defaults to luks.default_size_mb.
        #[arg(long)]
        size_mb: Option<u64>,

        /// Replace an existing file at the path.
        #[arg(long)]
        overwrite: bool,

        /// Clear backup key file enrolled right after formatting.
        #[arg(long)]
        backup_key_file: Option<PathBuf>,

        /// Slot for the backup key; defaults to luks.backup_slot.
        #[arg(long)]
        backup_slot: Option<u8>,
    },

    /// Unlock a container into a mapped device.
    Open {
        #[command(flatten)]
        volume: VolumeArgs,

        #[command(flatten)]
        key: KeyArgs,

        /// Key slot to try.
        #[arg(long, default_value_t = PRIMARY_SLOT)]
        slot: u8,
    },

    /// Tear down the mapped device.
    Close {
        #[command(flatten)]
        volume: VolumeArgs,
    },

    /// Report whether a container is open (and mounted).
    Status {
        #[command(flatten)]
        volume: VolumeArgs,

        /// Also report whether the device is mounted here.
        #[arg(long)]
        mount_point: Option<PathBuf>,
    },

    /// Open if needed and mount the container's filesystem.
    Mount {
        #[command(flatten)]
        volume: VolumeArgs,

        /// Directory to mount on.
        mount_point: PathBuf,

        #[command(flatten)]
        key: KeyArgs,
    },

    /// Unmount and close; lists open files when the mount point is busy.
    Unmount {
        #[command(flatten)]
        volume: VolumeArgs,

        /// Directory the container is mounted on.
        mount_point: PathBuf,
    },

    /// Enroll a new key into a free slot.
    AddKey {
        #[command(flatten)]
        volume: VolumeArgs,

        #[command(flatten)]
        key: KeyArgs,

        #[command(flatten)]
        new_key: NewKeyArgs,

        /// Slot receiving the new key.
        #[arg(long)]
        slot: u8,
    },

    /// Replace the key stored in a slot.
    ChangeKey {
        #[command(flatten)]
        volume: VolumeArgs,

        #[command(flatten)]
        key: KeyArgs,

        #[command(flatten)]
        new_key: NewKeyArgs,

        /// Slot whose key is replaced.
        #[arg(long, default_value_t = PRIMARY_SLOT)]
        slot: u8,
    },

    /// Permanently wipe a key slot (slot 0 is refused). The key given must
    /// unlock a different slot.
    RemoveKey {
        #[command(flatten)]
        volume: VolumeArgs,

        #[command(flatten)]
        key: KeyArgs,

        /// Slot to wipe.
        #[arg(long)]
        slot: u8,

        /// Skip interactive confirmation.
        #[arg(long)]
        force: bool,
    },

    /// Close if open and remove the container file.
    Delete {
        #[command(flatten)]
        volume: VolumeArgs,

        /// Skip interactive confirmation.
        #[arg(long)]
        force: bool,
    },

    /// Generate a key file. The wrapping passphrase is read from
    /// `JMVOLUME_NEW_PASSPHRASE` or prompted for twice.
    Keygen {
        /// Destination of the key file.
        output: PathBuf,

        /// Store the secret in the clear (backup key) instead of wrapping it.
        #[arg(long)]
        raw: bool,

        /// Secret length in bytes; defaults to keys.length.
        #[arg(long)]
        length: Option<usize>,

        /// Replace an existing file.
        #[arg(long)]
        overwrite: bool,
    },

    /// Show metadata and fingerprint of a key file without revealing it.
    KeyInfo {
        /// Key file to inspect.
        key_file: PathBuf,

        /// The file holds a clear backup key.
        #[arg(long)]
        raw: bool,
    },

    /// Print the JSON schema of the configuration file.
    ConfigSchema,

    /// Validate a configuration file.
    ValidateConfig {
        /// Configuration file to validate.
        #[arg(short = 'f', long, default_value = DEFAULT_CONFIG_PATH)]
        file: PathBuf,
    },
}

/// Entry point: parse arguments and surface errors with an exit code.
///
/// Failures of an external tool exit with that tool's status.
fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        let code = err
            .downcast_ref::<JmvolumeError>()
            .and_then(JmvolumeError::exit_code)
            .filter(|code| *code > 0)
            .unwrap_or(1);
        std::process::exit(code);
    }
}

fn run() -> Result<()> {
    logging::init("info");
    let cli = Cli::parse();

    match cli.command {
        Commands::ConfigSchema => {
            let schema = schema_for!(JmvolumeConfig);
            println!("{}", to_string_pretty(&schema)?);
            Ok(())
        }
        Commands::ValidateConfig { file } => {
            let config = JmvolumeConfig::load(&file)
                .with_context(|| format!("{} is not a valid configuration", file.display()))?;
            let format = match config.format {
                ConfigFormat::Toml => "TOML",
                ConfigFormat::Yaml => "YAML",
            };
            println!("{}: OK ({format})", file.display());
            Ok(())
        }
        command => {
            let config = load_cli_config(&cli.config)?;
            dispatch(&config, command)
        }
    }
}

fn load_cli_config(path: &Path) -> Result<JmvolumeConfig> {
    JmvolumeConfig::load_or_default(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))
}

fn dispatch(config: &JmvolumeConfig, command: Commands) -> Result<()> {
    match command {
        Commands::Create {
            path,
            key,
            size_mb,
            overwrite,
            backup_key_file,
            backup_slot,
        } => {
            let secret = load_secret(config, &key)?;
            let mut options = CreateOptions::from_config(config);
            options.overwrite = overwrite;
            if let Some(size_mb) = size_mb {
                ensure!(size_mb > 0, "--size-mb must be greater than 0");
                options.size_mb = size_mb;
            }
            if let Some(slot) = backup_slot {
                options.backup_slot = slot;
            }
            if let Some(backup) = backup_key_file {
                options.backup_key = Some(read_raw_secret(&backup)?);
            }
            let size_mb = options.size_mb;
            EncryptedContainer::create(
                HostTools::from_config(config)?,
                SystemProbe::from_config(config),
                &path,
                &secret,
                options,
            )?;
            println!("Created {size_mb} MB container at {}", path.display());
        }
        Commands::Open { volume, key, slot } => {
            let container = container(config, &volume)?;
            let secret = load_secret(config, &key)?;
            container.open(&secret, slot)?;
            println!(
                "{} -> {}",
                volume.path.display(),
                container.mapped_device().display()
            );
        }
        Commands::Close { volume } => {
            let container = container(config, &volume)?;
            if container.is_open() {
                container.close()?;
                println!("Closed {}", volume.name);
            } else {
                println!("{} is not open", volume.name);
            }
        }
        Commands::Status {
            volume,
            mount_point,
        } => {
            let container = container(config, &volume)?;
            let state = match container.state() {
                ContainerState::Open => "open",
                ContainerState::Sealed => "sealed",
            };
            println!("{:<12} {}", "CONTAINER", volume.path.display());
            println!("{:<12} {}", "DEVICE", container.mapped_device().display());
            println!("{:<12} {state}", "STATE");
            if let Some(mount_point) = mount_point {
                let mounted = MountedVolume::new(container, &mount_point).is_mounted()?;
                println!(
                    "{:<12} {} ({})",
                    "MOUNT",
                    mount_point.display(),
                    if mounted { "mounted" } else { "not mounted" }
                );
            }
        }
        Commands::Mount {
            volume,
            mount_point,
            key,
        } => {
            let mv = MountedVolume::new(container(config, &volume)?, &mount_point);
            let secret = load_secret(config, &key)?;
            mv.mount(&secret)?;
            println!("Mounted {} at {}", volume.name, mount_point.display());
        }
        Commands::Unmount {
            volume,
            mount_point,
        } => {
            let mv = MountedVolume::new(container(config, &volume)?, &mount_point);
            match mv.unmount()? {
                UnmountOutcome::Completed => {
                    println!(
                        "Unmounted {} and closed {}",
                        mount_point.display(),
                        volume.name
                    );
                }
                UnmountOutcome::Busy { open_files } => {
                    println!("{}", open_files.trim_end());
                    bail!(
                        "{} is busy; {} left open",
                        mount_point.display(),
                        volume.name
                    );
                }
            }
        }
        Commands::AddKey {
            volume,
            key,
            new_key,
            slot,
        } => {
            let container = container(config, &volume)?;
            let existing = load_secret(config, &key)?;
            let new_secret = load_new_secret(config, new_key)?;
            container.add_key(&existing, &new_secret, slot)?;
            println!("Enrolled key in slot {slot} of {}", volume.path.display());
        }
        Commands::ChangeKey {
            volume,
            key,
            new_key,
            slot,
        } => {
            let container = container(config, &volume)?;
            let existing = load_secret(config, &key)?;
            let new_secret = load_new_secret(config, new_key)?;
            container.change_key(&existing, &new_secret, slot)?;
            println!("Replaced key in slot {slot} of {}", volume.path.display());
        }
        Commands::RemoveKey {
            volume,
            key,
            slot,
            force,
        } => {
            let container = container(config, &volume)?;
            let existing = load_secret(config, &key)?;
            if !force
                && !confirm(&format!(
                    "This permanently wipes key slot {slot} of {}.",
                    volume.path.display()
                ))?
            {
                println!("Aborted.");
                return Ok(());
            }
            container.remove_key(&existing, slot)?;
            println!("Wiped slot {slot} of {}", volume.path.display());
        }
        Commands::Delete { volume, force } => {
            let container = container(config, &volume)?;
            if !force
                && !confirm(&format!(
                    "This destroys {} and every key slot in it.",
                    volume.path.display()
                ))?
            {
                println!("Aborted.");
                return Ok(());
            }
            container.delete()?;
            println!("Deleted {}", volume.path.display());
        }
        Commands::Keygen {
            output,
            raw,
            length,
            overwrite,
        } => {
            let length = length.unwrap_or(config.keys.length);
            ensure!(length > 0, "--length must be greater than 0");
            if raw {
                SecretMaterial::build_raw(&output, length, overwrite)?;
                warn!("{} holds a clear key; store it offline", output.display());
            } else {
                let passphrase = match env_passphrase(NEW_PASSPHRASE_ENV) {
                    Some(value) => value,
                    None => prompt_new_passphrase(&output)?,
                };
                ensure!(!passphrase.is_empty(), "passphrase cannot be empty");
                let cipher = GpgCipher::from_config(config)?;
                SecretMaterial::build_wrapped(
                    &cipher,
                    &output,
                    passphrase.as_bytes(),
                    length,
                    overwrite,
                )?;
            }
            println!("Wrote {length}-byte key to {}", output.display());
        }
        Commands::KeyInfo { key_file, raw } => {
            let material = if raw {
                SecretMaterial::raw(&key_file)
            } else {
                SecretMaterial::wrapped(&key_file)
            };
            let metadata = fs::metadata(&key_file)
                .with_context(|| format!("unable to stat {}", key_file.display()))?;
            let mode = metadata.permissions().mode() & 0o777;
            println!("{:<12} {}", "PATH", key_file.display());
            println!(
                "{:<12} {}",
                "KIND",
                if material.is_wrapped() { "wrapped" } else { "raw" }
            );
            println!("{:<12} {} bytes", "SIZE", metadata.len());
            println!("{:<12} {:04o}", "MODE", mode);
            println!("{:<12} {}", "SHA256", material.fingerprint()?);
            if mode & 0o077 != 0 {
                warn!("{} is readable by group or others", key_file.display());
            }
        }
        Commands::ConfigSchema | Commands::ValidateConfig { .. } => {
            unreachable!("handled before configuration is loaded")
        }
    }
    Ok(())
}

impl From<NewKeyArgs> for KeyArgs {
    fn from(args: NewKeyArgs) -> Self {
        Self {
            key_file: args.new_key_file,
            raw: args.new_raw,
        }
    }
}

fn container(config: &JmvolumeConfig, volume: &VolumeArgs) -> Result<EncryptedContainer> {
    Ok(EncryptedContainer::new(
        HostTools::from_config(config)?,
        SystemProbe::from_config(config),
        &volume.path,
        volume.name.as_str(),
    )?)
}

/// Read the secret behind `key`, unwrapping it through gpg when needed.
fn load_secret(config: &JmvolumeConfig, key: &KeyArgs) -> Result<Secret> {
    unwrap_key(config, key, PASSPHRASE_ENV)
}

fn load_new_secret(config: &JmvolumeConfig, new_key: NewKeyArgs) -> Result<Secret> {
    unwrap_key(config, &KeyArgs::from(new_key), NEW_PASSPHRASE_ENV)
}

fn unwrap_key(config: &JmvolumeConfig, key: &KeyArgs, passphrase_env: &str) -> Result<Secret> {
    if key.raw {
        return read_raw_secret(&key.key_file);
    }
    let passphrase = match env_passphrase(passphrase_env) {
        Some(value) => value,
        None => Zeroizing::new(prompt_password(format!(
            "Passphrase for {}: ",
            key.key_file.display()
        ))?),
    };
    let cipher = GpgCipher::from_config(config)?;
    let secret = SecretMaterial::wrapped(&key.key_file)
        .reveal_secret(&cipher, passphrase.as_bytes(), config.reveal_policy())
        .with_context(|| format!("unable to unwrap {}", key.key_file.display()))?;
    Ok(secret)
}

/// Non-empty passphrase from the environment, if set.
fn env_passphrase(var: &str) -> Option<Zeroizing<String>> {
    std::env::var(var)
        .ok()
        .filter(|value| !value.is_empty())
        .map(Zeroizing::new)
}

fn read_raw_secret(path: &Path) -> Result<Secret> {
    let bytes = Zeroizing::new(
        fs::read(path).with_context(|| format!("unable to read key file {}", path.display()))?,
    );
    Secret::from_file_bytes(&bytes)
        .with_context(|| format!("{} does not hold a valid key", path.display()))
}

fn prompt_new_passphrase(output: &Path) -> Result<Zeroizing<String>> {
    let first = Zeroizing::new(prompt_password(format!(
        "New passphrase for {}: ",
        output.display()
    ))?);
    let second = Zeroizing::new(prompt_password("Repeat passphrase: ")?);
    ensure!(*first == *second, "passphrases do not match");
    Ok(first)
}

/// Ask for an explicit YES on stdin.
fn confirm(warning: &str) -> Result<bool> {
    println!("{warning}");
    println!("Type YES to continue or press Enter to abort:");
    print!("> ");
    io::stdout().flush().ok();
    let mut answer = String::new();
    io::stdin().read_line(&mut answer)?;
    Ok(answer.trim() == "YES")
}
