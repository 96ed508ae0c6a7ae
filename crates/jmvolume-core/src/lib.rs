//! Core building blocks shared by jmvolume crates.
//!
//! Secrets, key files, configuration, error types, and process plumbing live
//! here so the container and cipher crates can focus on their engines.

pub mod config;
pub mod error;
pub mod keyfile;
pub mod logging;
pub mod process;
pub mod provider;
pub mod secret;

pub use config::{ConfigFormat, JmvolumeConfig, KeysCfg, LuksCfg, ToolsCfg, MAX_KEY_SLOTS};
pub use error::{JmvolumeError, JmvolumeResult};
pub use keyfile::{RevealPolicy, SecretMaterial};
pub use process::{Output, ProcessRunner};
pub use secret::{MixedSecret, Secret, DEFAULT_SECRET_LENGTH};
