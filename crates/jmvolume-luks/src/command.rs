//! Command templates for `cryptsetup` and the OS helpers around it.
//!
//! Every argument vector here is part of the on-disk compatibility contract
//! with existing containers and must not drift. Key material is only ever
//! passed as the stdin payload.

use jmvolume_core::config::resolve_binary;
use jmvolume_core::error::JmvolumeResult;
use jmvolume_core::secret::{MixedSecret, Secret};
use jmvolume_core::{JmvolumeConfig, ProcessRunner};
use std::path::{Path, PathBuf};

/// Resolved binaries plus the runner used to invoke them.
#[derive(Debug, Clone)]
pub struct HostTools {
    runner: ProcessRunner,
    cryptsetup: PathBuf,
    dd: PathBuf,
    mkfs: PathBuf,
    mount: PathBuf,
    umount: PathBuf,
    lsof: PathBuf,
    mapper_root: PathBuf,
}

impl HostTools {
    /// Resolve every tool named in `config`, failing on the first missing one.
    pub fn from_config(config: &JmvolumeConfig) -> JmvolumeResult<Self> {
        let tools = &config.tools;
        let mkfs_name = format!("mkfs.{}", config.luks.filesystem.trim());
        Ok(Self {
            runner: ProcessRunner::new(config.command_timeout()),
            cryptsetup: resolve_binary(tools.cryptsetup_path.as_deref(), "cryptsetup")?,
            dd: resolve_binary(tools.dd_path.as_deref(), "dd")?,
            mkfs: resolve_binary(tools.mkfs_path.as_deref(), &mkfs_name)?,
            mount: resolve_binary(tools.mount_path.as_deref(), "mount")?,
            umount: resolve_binary(tools.umount_path.as_deref(), "umount")?,
            lsof: resolve_binary(tools.lsof_path.as_deref(), "lsof")?,
            mapper_root: config.mapper_root(),
        })
    }

    /// Path the engine exposes an open container under.
    pub fn mapped_device(&self, mapper_name: &str) -> PathBuf {
        self.mapper_root.join(mapper_name)
    }

    /// `dd if=/dev/zero of=<path> bs=1024 count=<size_mb * 1024>`
    pub(crate) fn allocate(&self, path: &Path, size_mb: u64) -> JmvolumeResult<()> {
        let blocks = size_mb.saturating_mul(1024);
        let args = [
            "if=/dev/zero".to_string(),
            format!("of={}", path.display()),
            "bs=1024".to_string(),
            format!("count={blocks}"),
        ];
        self.runner.run(&self.dd, &args, b"")?;
        Ok(())
    }

    /// `cryptsetup -d - luksFormat <path>`
    pub(crate) fn luks_format(&self, path: &Path, key: &Secret) -> JmvolumeResult<()> {
        let args = [
            "-d".to_string(),
            "-".to_string(),
            "luksFormat".to_string(),
            path_arg(path),
        ];
        self.runner.run(&self.cryptsetup, &args, key.as_bytes())?;
        Ok(())
    }

    /// `cryptsetup -d - luksOpen <path> <name>`
    pub(crate) fn luks_open_any(
        &self,
        path: &Path,
        name: &str,
        key: &Secret,
    ) -> JmvolumeResult<()> {
        let args = [
            "-d".to_string(),
            "-".to_string(),
            "luksOpen".to_string(),
            path_arg(path),
            name.to_string(),
        ];
        self.runner.run(&self.cryptsetup, &args, key.as_bytes())?;
        Ok(())
    }

    /// `cryptsetup -d - --key-slot <slot> luksOpen <path> <name>`
    pub(crate) fn luks_open(
        &self,
        path: &Path,
        name: &str,
        key: &Secret,
        slot: u8,
    ) -> JmvolumeResult<()> {
        let args = [
            "-d".to_string(),
            "-".to_string(),
            "--key-slot".to_string(),
            slot.to_string(),
            "luksOpen".to_string(),
            path_arg(path),
            name.to_string(),
        ];
        self.runner.run(&self.cryptsetup, &args, key.as_bytes())?;
        Ok(())
    }

    /// `cryptsetup luksClose <name>`
    pub(crate) fn luks_close(&self, name: &str) -> JmvolumeResult<()> {
        self.runner.run(&self.cryptsetup, &["luksClose", name], b"")?;
        Ok(())
    }

    /// `cryptsetup -d - --keyfile-size <offset> --key-slot <slot> luksAddKey <path>`
    pub(crate) fn luks_add_key(
        &self,
        path: &Path,
        mixed: &MixedSecret,
        slot: u8,
    ) -> JmvolumeResult<()> {
        self.mixed_key_action("luksAddKey", path, mixed, slot)
    }

    /// `cryptsetup -d - --keyfile-size <offset> --key-slot <slot> luksChangeKey <path>`
    pub(crate) fn luks_change_key(
        &self,
        path: &Path,
        mixed: &MixedSecret,
        slot: u8,
    ) -> JmvolumeResult<()> {
        self.mixed_key_action("luksChangeKey", path, mixed, slot)
    }

    /// `cryptsetup -d - luksKillSlot <path> <slot>`
    pub(crate) fn luks_kill_slot(
        &self,
        path: &Path,
        existing: &Secret,
        slot: u8,
    ) -> JmvolumeResult<()> {
        let args = [
            "-d".to_string(),
            "-".to_string(),
            "luksKillSlot".to_string(),
            path_arg(path),
            slot.to_string(),
        ];
        self.runner.run(&self.cryptsetup, &args, existing.as_bytes())?;
        Ok(())
    }

    /// `mkfs.<fs> <device>`
    pub(crate) fn make_filesystem(&self, device: &Path) -> JmvolumeResult<()> {
        self.runner.run(&self.mkfs, &[path_arg(device)], b"")?;
        Ok(())
    }

    /// `mount <device> <mount_point>`
    pub(crate) fn mount(&self, device: &Path, mount_point: &Path) -> JmvolumeResult<()> {
        self.runner
            .run(&self.mount, &[path_arg(device), path_arg(mount_point)], b"")?;
        Ok(())
    }

    /// `umount <device>`
    pub(crate) fn umount(&self, device: &Path) -> JmvolumeResult<()> {
        self.runner.run(&self.umount, &[path_arg(device)], b"")?;
        Ok(())
    }

    /// `lsof <mount_point>`; the listing is returned even when lsof exits
    /// non-zero, which it does whenever it finds nothing.
    pub(crate) fn open_files(&self, mount_point: &Path) -> JmvolumeResult<String> {
        let out = self
            .runner
            .capture(&self.lsof, &[path_arg(mount_point)], b"")?;
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }

    fn mixed_key_action(
        &self,
        action: &str,
        path: &Path,
        mixed: &MixedSecret,
        slot: u8,
    ) -> JmvolumeResult<()> {
        let args = [
            "-d".to_string(),
            "-".to_string(),
            "--keyfile-size".to_string(),
            mixed.offset().to_string(),
            "--key-slot".to_string(),
            slot.to_string(),
            action.to_string(),
            path_arg(path),
        ];
        self.runner.run(&self.cryptsetup, &args, mixed.bytes())?;
        Ok(())
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
