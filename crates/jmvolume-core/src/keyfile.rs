//! Key files on disk: raw backups and passphrase-wrapped secrets.
//!
//! A key file is written once and never modified. Rotating a key means
//! building a new file, enrolling it, and revoking the old slot.

use crate::error::{JmvolumeError, JmvolumeResult};
use crate::provider::SymmetricCipher;
use crate::secret::Secret;
use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{ErrorKind, Write};
use std::os::unix::fs::MetadataExt;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use zeroize::Zeroizing;

/// What `reveal` does when the cipher rejects the passphrase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RevealPolicy {
    /// Log a warning and hand back whatever the cipher produced.
    #[default]
    Permissive,
    /// Fail with [`JmvolumeError::DecryptionFailed`].
    Strict,
}

/// Handle to a key file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretMaterial {
    path: PathBuf,
    wrapped: bool,
}

impl SecretMaterial {
    /// Refer to an existing passphrase-wrapped key file.
    pub fn wrapped(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            wrapped: true,
        }
    }

    /// Refer to an existing clear (backup) key file.
    pub fn raw(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            wrapped: false,
        }
    }

    /// Generate a fresh secret, wrap it under `passphrase`, and store it.
    ///
    /// The passphrase itself is never written anywhere.
    pub fn build_wrapped<C>(
        cipher: &C,
        path: &Path,
        passphrase: &[u8],
        length: usize,
        overwrite: bool,
    ) -> JmvolumeResult<Self>
    where
        C: SymmetricCipher<Error = JmvolumeError>,
    {
        let target = KeyFileTarget::prepare(path, overwrite)?;
        let secret = Secret::generate(length);
        let ciphertext = cipher.encrypt(secret.as_bytes(), passphrase)?;
        target.store(&ciphertext)?;
        info!("wrapped key file written to {}", path.display());
        Ok(Self::wrapped(path))
    }

    /// Generate a fresh secret and store it in the clear.
    ///
    /// Meant for out-of-band recovery copies kept under separate controls.
    pub fn build_raw(path: &Path, length: usize, overwrite: bool) -> JmvolumeResult<Self> {
        let target = KeyFileTarget::prepare(path, overwrite)?;
        let secret = Secret::generate(length);
        target.store(secret.as_bytes())?;
        warn!("clear backup key written to {}", path.display());
        Ok(Self::raw(path))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_wrapped(&self) -> bool {
        self.wrapped
    }

    /// Recover the clear secret bytes.
    ///
    /// Raw files are returned as stored and `passphrase` is ignored.
    pub fn reveal<C>(
        &self,
        cipher: &C,
        passphrase: &[u8],
        policy: RevealPolicy,
    ) -> JmvolumeResult<Zeroizing<Vec<u8>>>
    where
        C: SymmetricCipher<Error = JmvolumeError>,
    {
        let stored = self.read_stored()?;
        if !self.wrapped {
            return Ok(stored);
        }

        let outcome = cipher.decrypt(&stored, passphrase)?;
        let plaintext = Zeroizing::new(outcome.plaintext);
        if outcome.ok {
            return Ok(plaintext);
        }

        match policy {
            RevealPolicy::Strict => Err(JmvolumeError::DecryptionFailed(self.path.clone())),
            RevealPolicy::Permissive => {
                warn!(
                    "decryption of {} reported failure; returning {} unverified bytes",
                    self.path.display(),
                    plaintext.len()
                );
                Ok(plaintext)
            }
        }
    }

    /// [`SecretMaterial::reveal`] followed by alphabet validation.
    pub fn reveal_secret<C>(
        &self,
        cipher: &C,
        passphrase: &[u8],
        policy: RevealPolicy,
    ) -> JmvolumeResult<Secret>
    where
        C: SymmetricCipher<Error = JmvolumeError>,
    {
        let bytes = self.reveal(cipher, passphrase, policy)?;
        Secret::from_file_bytes(&bytes)
    }

    /// SHA-256 of the stored bytes, hex encoded.
    pub fn fingerprint(&self) -> JmvolumeResult<String> {
        let stored = self.read_stored()?;
        Ok(hex::encode(Sha256::digest(&stored[..])))
    }

    fn read_stored(&self) -> JmvolumeResult<Zeroizing<Vec<u8>>> {
        fs::read(&self.path)
            .map(Zeroizing::new)
            .map_err(|source| JmvolumeError::UnreadableArtifact {
                path: self.path.clone(),
                source,
            })
    }
}

/// Symlinks followed when locating the file a key is written to.
const MAX_LINK_DEPTH: usize = 16;

/// Where a new key file lands, checked before any secret is generated.
///
/// A key file is replaced only with `overwrite`; the replacement keeps the
/// previous owner, and a symlinked path is written through to its target.
#[derive(Debug)]
struct KeyFileTarget {
    dest: PathBuf,
    owner: Option<(u32, u32)>,
}

impl KeyFileTarget {
    fn prepare(path: &Path, overwrite: bool) -> JmvolumeResult<Self> {
        let dest = follow_links(path)?;
        let owner = match fs::metadata(&dest) {
            Ok(_) if !overwrite => return Err(JmvolumeError::ArtifactExists(path.to_path_buf())),
            Ok(meta) => Some((meta.uid(), meta.gid())),
            Err(err) if err.kind() == ErrorKind::NotFound => None,
            Err(err) => return Err(JmvolumeError::Io(err)),
        };
        Ok(Self { dest, owner })
    }

    fn dir(&self) -> &Path {
        self.dest
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
    }

    /// Atomically replace the destination with `contents`, mode `0400`.
    fn store(&self, contents: &[u8]) -> JmvolumeResult<()> {
        let dir = self.dir();
        fs::create_dir_all(dir)?;

        let mut staged = NamedTempFile::new_in(dir)?;
        staged.write_all(contents)?;
        staged.flush()?;
        staged
            .as_file()
            .set_permissions(fs::Permissions::from_mode(0o400))?;
        if let Some((uid, gid)) = self.owner {
            let rc = unsafe { libc::fchown(staged.as_file().as_raw_fd(), uid, gid) };
            if rc != 0 {
                return Err(JmvolumeError::Io(std::io::Error::last_os_error()));
            }
        }
        staged.as_file().sync_all()?;
        staged
            .persist(&self.dest)
            .map_err(|err| JmvolumeError::Io(err.error))?;

        if let Err(err) = fs::File::open(dir).and_then(|handle| handle.sync_all()) {
            debug!("fsync of {} skipped: {err}", dir.display());
        }
        Ok(())
    }
}

fn follow_links(path: &Path) -> JmvolumeResult<PathBuf> {
    let mut current = path.to_path_buf();
    for _ in 0..MAX_LINK_DEPTH {
        match fs::read_link(&current) {
            Ok(next) => {
                current = match current.parent() {
                    Some(dir) if next.is_relative() => dir.join(next),
                    _ => next,
                };
            }
            // Not a link (EINVAL) or not there yet: this is the file to write.
            Err(err) if matches!(err.kind(), ErrorKind::InvalidInput | ErrorKind::NotFound) => {
                return Ok(current)
            }
            Err(err) => return Err(JmvolumeError::Io(err)),
        }
    }
    Err(JmvolumeError::InvalidConfig(format!(
        "{} is a symlink chain deeper than {MAX_LINK_DEPTH}",
        path.display()
    )))
}
