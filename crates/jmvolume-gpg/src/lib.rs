#![forbid(unsafe_code)]

//! GnuPG integration.
//!
//! `cipher` implements `SymmetricCipher` on top of the host `gpg` CLI in
//! symmetric mode. The passphrase is handed over on stdin ahead of the
//! payload and never appears in the argument vector.

mod cipher;

pub use cipher::GpgCipher;
