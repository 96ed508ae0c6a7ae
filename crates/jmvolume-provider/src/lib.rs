#![forbid(unsafe_code)]

//! Host capability contracts shared across jmvolume.
//!
//! Container and key-file logic depends on these traits instead of on the
//! host directly, so tests can simulate mapped devices, mount tables, and the
//! symmetric cipher without privileged operations.

pub mod cipher;
pub mod probe;

pub use cipher::{Decryption, SymmetricCipher};
pub use probe::{ContainerState, DeviceProbe, MountState, VolumeState};
