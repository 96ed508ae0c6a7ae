//! `GpgCipher` against a fake `gpg` that "encrypts" by prefixing the
//! passphrase, so failures are deterministic.

use jmvolume_core::provider::SymmetricCipher;
use jmvolume_core::{JmvolumeConfig, JmvolumeError, RevealPolicy, SecretMaterial};
use jmvolume_gpg::GpgCipher;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use tempfile::{tempdir, TempDir};

const FAKE_GPG: &str = r#"#!/bin/sh
echo "gpg $*" >> "@LOG@"
IFS= read -r PASS
PAYLOAD="$(cat)"
case "$*" in
  *--symmetric*)
    printf 'wrapped:%s:%s' "$PASS" "$PAYLOAD"
    ;;
  *--decrypt*)
    case "$PAYLOAD" in
      "wrapped:$PASS:"*)
        printf '%s' "${PAYLOAD#"wrapped:$PASS:"}"
        ;;
      *)
        printf 'garbage'
        echo "gpg: decryption failed: Bad session key" 1>&2
        exit 2
        ;;
    esac
    ;;
  *)
    exit 2
    ;;
esac
"#;

struct FakeGpg {
    dir: TempDir,
    cipher: GpgCipher,
}

impl FakeGpg {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        let log = dir.path().join("gpg.log");
        let script = dir.path().join("gpg");
        fs::write(&script, FAKE_GPG.replace("@LOG@", &log.to_string_lossy())).unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = JmvolumeConfig::default();
        config.tools.gpg_path = Some(script.to_string_lossy().into_owned());
        let cipher = GpgCipher::from_config(&config).unwrap();
        Self { dir, cipher }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn log(&self) -> String {
        fs::read_to_string(self.path("gpg.log")).unwrap_or_default()
    }
}

#[test]
fn encrypt_and_decrypt_through_gpg() {
    let gpg = FakeGpg::new();
    let ciphertext = gpg.cipher.encrypt(b"abc123", b"milu").unwrap();
    assert_eq!(ciphertext, b"wrapped:milu:abc123");

    let outcome = gpg.cipher.decrypt(&ciphertext, b"milu").unwrap();
    assert!(outcome.ok);
    assert_eq!(outcome.plaintext, b"abc123");

    let log = gpg.log();
    assert!(log.contains("--symmetric --cipher-algo AES256 --output -"));
    assert!(log.contains("--passphrase-fd 0 --decrypt --output -"));
    assert!(!log.contains("milu"));
}

#[test]
fn wrong_passphrase_is_reported_not_raised() {
    let gpg = FakeGpg::new();
    let ciphertext = gpg.cipher.encrypt(b"abc123", b"milu").unwrap();

    let outcome = gpg.cipher.decrypt(&ciphertext, b"other").unwrap();
    assert!(!outcome.ok);
    assert_eq!(outcome.plaintext, b"garbage");
}

#[test]
fn wrapped_key_file_round_trip() {
    let gpg = FakeGpg::new();
    let path = gpg.path("jmvolume.key");

    let material =
        SecretMaterial::build_wrapped(&gpg.cipher, &path, b"correct horse", 1024, false).unwrap();
    assert!(material.is_wrapped());
    let stored = fs::read(&path).unwrap();
    assert!(stored.starts_with(b"wrapped:correct horse:"));
    assert_eq!(fs::metadata(&path).unwrap().permissions().mode() & 0o777, 0o400);

    let secret = material
        .reveal_secret(&gpg.cipher, b"correct horse", RevealPolicy::Strict)
        .unwrap();
    assert_eq!(secret.len(), 1024);
    assert!(secret.as_bytes().iter().all(u8::is_ascii_alphanumeric));
}

#[test]
fn reveal_policy_decides_wrong_passphrase_outcome() {
    let gpg = FakeGpg::new();
    let path = gpg.path("jmvolume.key");
    let material = SecretMaterial::build_wrapped(&gpg.cipher, &path, b"milu", 64, false).unwrap();

    let err = material
        .reveal(&gpg.cipher, b"wrong", RevealPolicy::Strict)
        .unwrap_err();
    assert!(matches!(err, JmvolumeError::DecryptionFailed(p) if p == path));

    let bytes = material
        .reveal(&gpg.cipher, b"wrong", RevealPolicy::Permissive)
        .unwrap();
    assert_eq!(&bytes[..], b"garbage");
}

#[test]
fn build_wrapped_refuses_existing_file() {
    let gpg = FakeGpg::new();
    let path = gpg.path("jmvolume.key");
    fs::write(&path, b"keep me").unwrap();

    let err = SecretMaterial::build_wrapped(&gpg.cipher, &path, b"milu", 64, false).unwrap_err();
    assert!(matches!(err, JmvolumeError::ArtifactExists(_)));
    assert_eq!(fs::read(&path).unwrap(), b"keep me");
    assert!(gpg.log().is_empty());
}

#[test]
fn newline_in_passphrase_never_reaches_gpg() {
    let gpg = FakeGpg::new();
    let err = gpg.cipher.encrypt(b"abc", b"two\nlines").unwrap_err();
    assert!(matches!(err, JmvolumeError::InvalidPassphrase(_)));
    assert!(gpg.log().is_empty());
    assert!(!gpg.path("gpg.log").exists());
}
