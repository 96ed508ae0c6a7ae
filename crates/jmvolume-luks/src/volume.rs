//! Filesystem mount lifecycle on top of an encrypted container.

use crate::container::{EncryptedContainer, PRIMARY_SLOT};
use crate::probe::SystemProbe;
use jmvolume_core::error::{JmvolumeError, JmvolumeResult};
use jmvolume_core::provider::{DeviceProbe, MountState, VolumeState};
use jmvolume_core::secret::Secret;
use log::{info, warn};
use std::path::{Path, PathBuf};

/// Result of [`MountedVolume::unmount`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnmountOutcome {
    /// Unmounted (or already unmounted) and the container is sealed.
    Completed,
    /// Files are still open under the mount point. Nothing was changed; the
    /// container stays open and the caller may retry later.
    Busy { open_files: String },
}

/// An encrypted container paired with the directory it mounts on.
#[derive(Debug, Clone)]
pub struct MountedVolume<P = SystemProbe> {
    container: EncryptedContainer<P>,
    mount_point: PathBuf,
}

impl<P> MountedVolume<P>
where
    P: DeviceProbe<Error = JmvolumeError>,
{
    pub fn new(container: EncryptedContainer<P>, mount_point: impl Into<PathBuf>) -> Self {
        Self {
            container,
            mount_point: mount_point.into(),
        }
    }

    pub fn container(&self) -> &EncryptedContainer<P> {
        &self.container
    }

    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    /// Open the container if needed and mount its filesystem.
    ///
    /// An already mounted volume is left as is.
    pub fn mount(&self, key: &Secret) -> JmvolumeResult<()> {
        if self.is_mounted()? {
            warn!(
                "{} is already mounted at {}",
                self.container.mapped_device().display(),
                self.mount_point.display()
            );
            return Ok(());
        }

        if self.container.is_open() {
            info!("{} already open", self.container.mapper_name());
        } else {
            self.container.open(key, PRIMARY_SLOT)?;
        }

        self.container
            .tools()
            .mount(self.container.mapped_device(), &self.mount_point)?;
        info!(
            "mounted {} at {}",
            self.container.mapped_device().display(),
            self.mount_point.display()
        );
        Ok(())
    }

    /// Unmount and close.
    ///
    /// A failing unmount is treated as "still in use": the open files are
    /// listed and the container is left open rather than forced closed.
    pub fn unmount(&self) -> JmvolumeResult<UnmountOutcome> {
        if self.is_mounted()? {
            let device = self.container.mapped_device();
            if let Err(err) = self.container.tools().umount(device) {
                let open_files = match self.container.tools().open_files(&self.mount_point) {
                    Ok(listing) => listing,
                    Err(lsof_err) => {
                        warn!("unable to list open files: {lsof_err}");
                        String::new()
                    }
                };
                warn!(
                    "unable to unmount {}: {err}\nopen files:\n{}",
                    self.mount_point.display(),
                    open_files.trim_end()
                );
                return Ok(UnmountOutcome::Busy { open_files });
            }
            info!("unmounted {}", self.mount_point.display());
        }

        if self.container.is_open() {
            self.container.close()?;
        }
        Ok(UnmountOutcome::Completed)
    }

    pub fn is_mounted(&self) -> JmvolumeResult<bool> {
        self.container
            .probe()
            .is_mounted(self.container.mapped_device(), &self.mount_point)
    }

    pub fn state(&self) -> JmvolumeResult<VolumeState> {
        let mount = if self.is_mounted()? {
            MountState::Mounted
        } else {
            MountState::Unmounted
        };
        let state = VolumeState {
            container: self.container.state(),
            mount,
        };
        if !state.is_consistent() {
            warn!(
                "mount table lists {} at {} but the mapping is gone",
                self.container.mapped_device().display(),
                self.mount_point.display()
            );
        }
        Ok(state)
    }
}
