//! Clear key material and the two-secret mixing protocol.
//!
//! `cryptsetup` reads exactly one key stream from stdin. Operations that must
//! authenticate with one secret while installing another send both through
//! that stream back to back and pass the length of the first one as
//! `--keyfile-size`. That split is only unambiguous when every secret is drawn
//! from a fixed alphabet, which [`Secret`] enforces on construction.

use crate::error::{JmvolumeError, JmvolumeResult};
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::Rng;
use std::fmt;
use zeroize::Zeroizing;

/// Default length of generated secrets, in bytes.
pub const DEFAULT_SECRET_LENGTH: usize = 1024;

/// Returns true when `byte` belongs to the secret alphabet (`[A-Za-z0-9]`).
pub fn is_secret_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric()
}

/// Key material restricted to ASCII letters and digits.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(Zeroizing<Vec<u8>>);

impl Secret {
    /// Draw `length` bytes uniformly from the alphabet using the OS CSPRNG.
    pub fn generate(length: usize) -> Self {
        let bytes: Vec<u8> = OsRng.sample_iter(&Alphanumeric).take(length).collect();
        Self(Zeroizing::new(bytes))
    }

    /// Validate existing bytes against the alphabet.
    pub fn from_bytes(bytes: &[u8]) -> JmvolumeResult<Self> {
        if let Some(pos) = bytes.iter().position(|b| !is_secret_byte(*b)) {
            return Err(JmvolumeError::InvalidSecret(format!(
                "byte at offset {pos} is outside [A-Za-z0-9]"
            )));
        }
        Ok(Self(Zeroizing::new(bytes.to_vec())))
    }

    /// Like [`Secret::from_bytes`], but drops one trailing line ending.
    ///
    /// Secrets typed into an editor or echoed into a file usually gain one.
    pub fn from_file_bytes(bytes: &[u8]) -> JmvolumeResult<Self> {
        let trimmed = bytes
            .strip_suffix(b"\r\n")
            .or_else(|| bytes.strip_suffix(b"\n"))
            .unwrap_or(bytes);
        Self::from_bytes(trimmed)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Reject empty secrets; the engine would otherwise prompt or misbehave.
    pub fn ensure_non_empty(&self, role: &str) -> JmvolumeResult<()> {
        if self.is_empty() {
            return Err(JmvolumeError::InvalidSecret(format!("{role} cannot be empty")));
        }
        Ok(())
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret({} bytes)", self.0.len())
    }
}

/// Two secrets packed into one stream: `authenticating ‖ target`.
///
/// `offset` is the length of the authenticating secret and tells the engine
/// where to split.
pub struct MixedSecret {
    offset: usize,
    combined: Zeroizing<Vec<u8>>,
}

impl MixedSecret {
    pub fn new(authenticating: &Secret, target: &Secret) -> Self {
        let mut combined =
            Zeroizing::new(Vec::with_capacity(authenticating.len() + target.len()));
        combined.extend_from_slice(authenticating.as_bytes());
        combined.extend_from_slice(target.as_bytes());
        Self {
            offset: authenticating.len(),
            combined,
        }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn bytes(&self) -> &[u8] {
        &self.combined
    }

    /// Split the stream back into its two halves.
    pub fn split(&self) -> (&[u8], &[u8]) {
        self.combined.split_at(self.offset)
    }
}

impl fmt::Debug for MixedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MixedSecret")
            .field("offset", &self.offset)
            .field("len", &self.combined.len())
            .finish()
    }
}
