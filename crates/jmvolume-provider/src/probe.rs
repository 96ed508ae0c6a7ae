//! Status probes for encrypted containers and their mounts.
//!
//! Container state is never cached. Every query goes back to the host (or to
//! whatever the probe simulates) because the process may have restarted, or
//! another tool may have touched the mapping, between two operations.

use std::error::Error;
use std::path::Path;

/// Observable state of an encrypted container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    /// No mapped device is present.
    Sealed,
    /// The decrypted mapped device exists.
    Open,
}

/// Observable state of a filesystem mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountState {
    Unmounted,
    Mounted,
}

/// Combined container and mount state of a mounted volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeState {
    pub container: ContainerState,
    pub mount: MountState,
}

impl VolumeState {
    /// `(Sealed, Mounted)` cannot be produced by the host: mounting needs the
    /// mapped device. Seeing it means the probe and the host disagree.
    pub fn is_consistent(&self) -> bool {
        !matches!(
            (self.container, self.mount),
            (ContainerState::Sealed, MountState::Mounted)
        )
    }
}

/// Read-only queries against the host device and mount namespaces.
pub trait DeviceProbe {
    type Error: Error + Send + Sync + 'static;

    /// Return whether the device node at `path` currently exists.
    fn device_exists(&self, path: &Path) -> bool;

    /// Return whether `device` is listed in the mount table at `mount_point`.
    fn is_mounted(&self, device: &Path, mount_point: &Path) -> Result<bool, Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sealed_and_mounted_is_inconsistent() {
        let state = VolumeState {
            container: ContainerState::Sealed,
            mount: MountState::Mounted,
        };
        assert!(!state.is_consistent());

        let state = VolumeState {
            container: ContainerState::Open,
            mount: MountState::Mounted,
        };
        assert!(state.is_consistent());
    }
}
