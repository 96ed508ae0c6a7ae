//! Configuration model and helpers used by jmvolume tools.

use crate::error::{JmvolumeError, JmvolumeResult};
use crate::keyfile::RevealPolicy;
use crate::secret::DEFAULT_SECRET_LENGTH;
use directories_next::ProjectDirs;
use log::{info, warn};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/jmvolume.toml";
pub const CONFIG_PATH_ENV: &str = "JMVOLUME_CONFIG";
const USER_CONFIG_FILE_NAME: &str = "jmvolume.toml";
const APP_QUALIFIER: &str = "net";
const APP_ORGANIZATION: &str = "llou";
const APP_NAME: &str = "jmvolume";

/// Highest key slot index accepted plus one (LUKS1 layout).
pub const MAX_KEY_SLOTS: u8 = 8;

pub const KNOWN_SBIN_DIRS: &[&str] = &[
    "/usr/sbin",
    "/usr/bin",
    "/sbin",
    "/bin",
    "/usr/local/sbin",
    "/usr/local/bin",
];

/// Optional explicit paths for the external tools.
///
/// Unset entries are resolved from [`KNOWN_SBIN_DIRS`] and then `PATH`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ToolsCfg {
    #[serde(default)]
    pub cryptsetup_path: Option<String>,

    #[serde(default)]
    pub dd_path: Option<String>,

    /// Filesystem builder; defaults to `mkfs.<luks.filesystem>`.
    #[serde(default)]
    pub mkfs_path: Option<String>,

    #[serde(default)]
    pub mount_path: Option<String>,

    #[serde(default)]
    pub umount_path: Option<String>,

    #[serde(default)]
    pub lsof_path: Option<String>,

    #[serde(default)]
    pub gpg_path: Option<String>,
}

/// Container engine knobs.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct LuksCfg {
    #[serde(default = "default_mapper_root")]
    pub mapper_root: String,

    #[serde(default = "default_mounts_path")]
    pub mounts_path: String,

    #[serde(default = "default_filesystem")]
    pub filesystem: String,

    #[serde(default = "default_size_mb")]
    pub default_size_mb: u64,

    #[serde(default = "default_backup_slot")]
    pub backup_slot: u8,

    /// Per-command deadline. Unset means wait indefinitely.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn default_mapper_root() -> String {
    "/dev/mapper".to_string()
}

fn default_mounts_path() -> String {
    "/proc/mounts".to_string()
}

fn default_filesystem() -> String {
    "ext3".to_string()
}

fn default_size_mb() -> u64 {
    40
}

fn default_backup_slot() -> u8 {
    3
}

impl Default for LuksCfg {
    fn default() -> Self {
        Self {
            mapper_root: default_mapper_root(),
            mounts_path: default_mounts_path(),
            filesystem: default_filesystem(),
            default_size_mb: default_size_mb(),
            backup_slot: default_backup_slot(),
            timeout_secs: None,
        }
    }
}

/// Key file generation and recovery settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct KeysCfg {
    #[serde(default = "default_key_length")]
    pub length: usize,

    #[serde(default = "default_cipher_algo")]
    pub cipher_algo: String,

    /// Fail `reveal` when the cipher rejects the passphrase instead of
    /// returning whatever it produced.
    #[serde(default)]
    pub strict_decrypt: bool,
}

fn default_key_length() -> usize {
    DEFAULT_SECRET_LENGTH
}

fn default_cipher_algo() -> String {
    "AES256".to_string()
}

impl Default for KeysCfg {
    fn default() -> Self {
        Self {
            length: default_key_length(),
            cipher_algo: default_cipher_algo(),
            strict_decrypt: false,
        }
    }
}

/// Top-level configuration snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct JmvolumeConfig {
    #[serde(default)]
    pub tools: ToolsCfg,

    #[serde(default)]
    pub luks: LuksCfg,

    #[serde(default)]
    pub keys: KeysCfg,

    #[serde(skip)]
    pub path: PathBuf,

    #[serde(skip)]
    pub format: ConfigFormat,
}

/// Which syntax a configuration file was parsed with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConfigFormat {
    #[default]
    Toml,
    Yaml,
}

impl JmvolumeConfig {
    /// Return the canonical system-wide configuration path.
    pub fn default_path() -> &'static Path {
        Path::new(DEFAULT_CONFIG_PATH)
    }

    /// Resolve the per-user configuration path.
    pub fn user_config_path() -> Option<PathBuf> {
        ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
            .map(|dirs| dirs.config_dir().join(USER_CONFIG_FILE_NAME))
    }

    /// Load `path` when present; otherwise fall back to the per-user file (only
    /// for the system default path) and finally to built-in defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> JmvolumeResult<Self> {
        let target = path.as_ref();
        if target.exists() {
            return Self::load(target);
        }

        if target == Self::default_path() {
            if let Some(user_path) = Self::user_config_path().filter(|p| p.exists()) {
                info!("using per-user configuration at {}", user_path.display());
                return Self::load(&user_path);
            }
        }

        warn!(
            "configuration missing at {}; using built-in defaults",
            target.display()
        );
        Ok(Self {
            path: target.to_path_buf(),
            ..Self::default()
        })
    }

    /// Read a config file from disk, detect format, and validate basics.
    pub fn load<P: AsRef<Path>>(path: P) -> JmvolumeResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let is_yaml = matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some(ext) if ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml")
        );
        let mut cfg = if is_yaml {
            serde_yaml::from_str::<Self>(&contents)?
        } else {
            toml::from_str::<Self>(&contents)?
        };

        cfg.path = path.to_path_buf();
        cfg.format = if is_yaml {
            ConfigFormat::Yaml
        } else {
            ConfigFormat::Toml
        };

        let issues = cfg.validate();
        if !issues.is_empty() {
            return Err(JmvolumeError::InvalidConfig(issues.join("; ")));
        }

        Ok(cfg)
    }

    /// Perform a validation pass and return human-readable issues.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        if self.luks.mapper_root.trim().is_empty() {
            issues.push("luks.mapper_root cannot be empty".to_string());
        }
        if self.luks.mounts_path.trim().is_empty() {
            issues.push("luks.mounts_path cannot be empty".to_string());
        }
        let fs_name = self.luks.filesystem.trim();
        if fs_name.is_empty()
            || !fs_name
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
        {
            issues.push(format!(
                "luks.filesystem must be a plain filesystem name (got `{}`)",
                self.luks.filesystem
            ));
        }
        if self.luks.default_size_mb == 0 {
            issues.push("luks.default_size_mb must be greater than 0".to_string());
        }
        if self.luks.backup_slot == 0 || self.luks.backup_slot >= MAX_KEY_SLOTS {
            issues.push(format!(
                "luks.backup_slot must be between 1 and {}",
                MAX_KEY_SLOTS - 1
            ));
        }
        if self.luks.timeout_secs == Some(0) {
            issues.push("luks.timeout_secs must be greater than 0 when set".to_string());
        }
        if self.keys.length == 0 {
            issues.push("keys.length must be greater than 0".to_string());
        }
        if self.keys.cipher_algo.trim().is_empty() {
            issues.push("keys.cipher_algo cannot be empty".to_string());
        }

        issues
    }

    pub fn mapper_root(&self) -> PathBuf {
        PathBuf::from(&self.luks.mapper_root)
    }

    pub fn mounts_path(&self) -> PathBuf {
        PathBuf::from(&self.luks.mounts_path)
    }

    /// Translate the stored timeout into a `Duration`.
    pub fn command_timeout(&self) -> Option<Duration> {
        self.luks.timeout_secs.map(Duration::from_secs)
    }

    pub fn reveal_policy(&self) -> RevealPolicy {
        if self.keys.strict_decrypt {
            RevealPolicy::Strict
        } else {
            RevealPolicy::Permissive
        }
    }
}

/// Resolve the binary for `name`, preferring an explicit `configured` path.
///
/// A configured path that does not exist is a configuration error; it is never
/// silently replaced by a system copy.
pub fn resolve_binary(configured: Option<&str>, name: &str) -> JmvolumeResult<PathBuf> {
    if let Some(path) = configured.map(str::trim).filter(|path| !path.is_empty()) {
        let candidate = Path::new(path);
        if !candidate.exists() {
            return Err(JmvolumeError::InvalidConfig(format!(
                "{name} binary not found at {}",
                candidate.display()
            )));
        }
        return Ok(candidate.to_path_buf());
    }

    for dir in KNOWN_SBIN_DIRS {
        let candidate = Path::new(dir).join(name);
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    find_in_path(name).ok_or_else(|| {
        JmvolumeError::InvalidConfig(format!(
            "unable to locate {name} binary; tried {:?} and PATH",
            KNOWN_SBIN_DIRS
        ))
    })
}

fn find_in_path(binary: &str) -> Option<PathBuf> {
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths).find_map(|dir| {
        let candidate = dir.join(binary);
        if candidate.exists() {
            Some(candidate)
        } else {
            None
        }
    })
}
