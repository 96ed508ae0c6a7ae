//! Contract for the passphrase-based symmetric encryption service.

use std::error::Error;

/// Outcome of a decryption request.
///
/// The service may hand back a payload even when it reports failure (a wrong
/// passphrase or corrupt ciphertext). Callers decide what to do with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decryption {
    /// Bytes the service produced on its output stream.
    pub plaintext: Vec<u8>,
    /// Whether the service reported a successful decryption.
    pub ok: bool,
}

/// Symmetric (passphrase-only) encryption of key material.
pub trait SymmetricCipher {
    type Error: Error + Send + Sync + 'static;

    /// Encrypt `plaintext` under `passphrase`, returning the ciphertext.
    fn encrypt(&self, plaintext: &[u8], passphrase: &[u8]) -> Result<Vec<u8>, Self::Error>;

    /// Decrypt `ciphertext` using `passphrase`.
    ///
    /// A rejected passphrase is reported through [`Decryption::ok`], not
    /// through `Err`. `Err` is reserved for failures to reach the service.
    fn decrypt(&self, ciphertext: &[u8], passphrase: &[u8]) -> Result<Decryption, Self::Error>;
}
