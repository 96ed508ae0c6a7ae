//! Host capability contracts used by the core crate.
//!
//! The traits live in `jmvolume-provider`; concrete implementations live in
//! `jmvolume-luks` (device probing) and `jmvolume-gpg` (symmetric wrapping).

pub use jmvolume_provider::cipher::{Decryption, SymmetricCipher};
pub use jmvolume_provider::probe::{ContainerState, DeviceProbe, MountState, VolumeState};
