use jmvolume_core::config::resolve_binary;
use jmvolume_core::error::{JmvolumeError, JmvolumeResult};
use jmvolume_core::provider::{Decryption, SymmetricCipher};
use jmvolume_core::{JmvolumeConfig, ProcessRunner};
use log::{debug, warn};
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

/// Arguments shared by both directions. `--passphrase-fd 0` makes gpg read
/// the first stdin line as the passphrase and the rest as the payload.
const COMMON_ARGS: &[&str] = &[
    "--batch",
    "--yes",
    "--no-tty",
    "--quiet",
    "--pinentry-mode",
    "loopback",
    "--passphrase-fd",
    "0",
];

/// `SymmetricCipher` backed by `gpg --symmetric`.
#[derive(Debug, Clone)]
pub struct GpgCipher {
    runner: ProcessRunner,
    binary: PathBuf,
    algorithm: String,
}

impl GpgCipher {
    pub fn new(
        runner: ProcessRunner,
        binary: impl Into<PathBuf>,
        algorithm: impl Into<String>,
    ) -> JmvolumeResult<Self> {
        let algorithm = algorithm.into();
        if algorithm.is_empty() || !algorithm.chars().all(|ch| ch.is_ascii_alphanumeric()) {
            return Err(JmvolumeError::InvalidConfig(format!(
                "`{algorithm}` is not a valid gpg cipher name"
            )));
        }
        Ok(Self {
            runner,
            binary: binary.into(),
            algorithm,
        })
    }

    pub fn from_config(config: &JmvolumeConfig) -> JmvolumeResult<Self> {
        let binary = resolve_binary(config.tools.gpg_path.as_deref(), "gpg")?;
        Self::new(
            ProcessRunner::new(config.command_timeout()),
            binary,
            config.keys.cipher_algo.trim(),
        )
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    fn encrypt_args(&self) -> Vec<&str> {
        let mut args: Vec<&str> = COMMON_ARGS.to_vec();
        args.extend([
            "--symmetric",
            "--cipher-algo",
            self.algorithm.as_str(),
            "--output",
            "-",
        ]);
        args
    }

    fn decrypt_args(&self) -> Vec<&str> {
        let mut args: Vec<&str> = COMMON_ARGS.to_vec();
        args.extend(["--decrypt", "--output", "-"]);
        args
    }
}

impl SymmetricCipher for GpgCipher {
    type Error = JmvolumeError;

    fn encrypt(&self, plaintext: &[u8], passphrase: &[u8]) -> JmvolumeResult<Vec<u8>> {
        let input = stdin_payload(passphrase, plaintext)?;
        let ciphertext = self.runner.run(&self.binary, &self.encrypt_args(), &input)?;
        debug!(
            "gpg wrapped {} bytes into {} bytes",
            plaintext.len(),
            ciphertext.len()
        );
        Ok(ciphertext)
    }

    fn decrypt(&self, ciphertext: &[u8], passphrase: &[u8]) -> JmvolumeResult<Decryption> {
        let input = stdin_payload(passphrase, ciphertext)?;
        let out = self
            .runner
            .capture(&self.binary, &self.decrypt_args(), &input)?;
        if !out.success() {
            warn!(
                "gpg decrypt exited with {}: {}",
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        Ok(Decryption {
            ok: out.success(),
            plaintext: out.stdout,
        })
    }
}

/// `passphrase \n payload`, as read by `--passphrase-fd 0`.
fn stdin_payload(passphrase: &[u8], payload: &[u8]) -> JmvolumeResult<Zeroizing<Vec<u8>>> {
    if passphrase.iter().any(|&b| b == b'\n' || b == 0) {
        return Err(JmvolumeError::InvalidPassphrase(
            "passphrase cannot contain newline or NUL bytes".to_string(),
        ));
    }
    let mut input = Zeroizing::new(Vec::with_capacity(passphrase.len() + 1 + payload.len()));
    input.extend_from_slice(passphrase);
    input.push(b'\n');
    input.extend_from_slice(payload);
    Ok(input)
}
