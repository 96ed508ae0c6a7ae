#![forbid(unsafe_code)]

//! LUKS container and mount lifecycle.
//!
//! Integrates with the host via:
//! - `cryptsetup` (format/open/close and key-slot administration)
//! - `dd` and `mkfs.<fs>` when creating containers
//! - `mount`/`umount`/`lsof` and the kernel mount table for mounts

mod command;
mod container;
mod probe;
mod volume;

pub use command::HostTools;
pub use container::{CreateOptions, EncryptedContainer, PRIMARY_SLOT};
pub use probe::SystemProbe;
pub use volume::{MountedVolume, UnmountOutcome};
