//! Error taxonomy shared by every jmvolume crate.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias used across the workspace.
pub type JmvolumeResult<T> = Result<T, JmvolumeError>;

#[derive(Debug, Error)]
pub enum JmvolumeError {
    #[error("encrypted volume already exists at {0}")]
    VolumeExists(PathBuf),

    #[error("key file already exists at {0}")]
    ArtifactExists(PathBuf),

    /// An external tool exited non-zero. `command` never includes stdin.
    #[error("{}", render_command_failure(.command, .exit_code, .stdout, .stderr))]
    CommandFailed {
        command: String,
        exit_code: i32,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
    },

    #[error("`{command}` timed out after {timeout:?}")]
    CommandTimeout { command: String, timeout: Duration },

    #[error("key slot {0} holds the primary key and cannot be wiped")]
    ProtectedSlot(u8),

    #[error("key slot {0} is out of range")]
    InvalidSlot(u8),

    #[error("unable to read key file {path}: {source}")]
    UnreadableArtifact {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("key file {0} could not be decrypted with the supplied passphrase")]
    DecryptionFailed(PathBuf),

    #[error("invalid secret: {0}")]
    InvalidSecret(String),

    #[error("invalid passphrase: {0}")]
    InvalidPassphrase(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML configuration: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("failed to process YAML configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl JmvolumeError {
    /// Exit code of a failed external command, when this error carries one.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            JmvolumeError::CommandFailed { exit_code, .. } => Some(*exit_code),
            _ => None,
        }
    }
}

fn render_command_failure(command: &str, exit_code: &i32, stdout: &[u8], stderr: &[u8]) -> String {
    let mut message = format!("error {exit_code} running: '{command}'");
    let stdout = String::from_utf8_lossy(stdout);
    let stderr = String::from_utf8_lossy(stderr);
    if !stdout.trim().is_empty() {
        message.push_str(&format!("\nreturned output:\n{}", stdout.trim_end()));
    }
    if !stderr.trim().is_empty() {
        message.push_str(&format!("\nreturned error:\n{}", stderr.trim_end()));
    }
    message
}
