//! Encrypted container lifecycle and key-slot administration.
//!
//! A container is identified by its backing path and mapper name; nothing
//! else is held in memory. Whether it is open is always answered by probing
//! for the mapped device.
//!
//! Key slots and mapper names are host-wide resources. Nothing here locks
//! them: callers must serialize operations per `(path, mapper_name)`.

use crate::command::HostTools;
use crate::probe::SystemProbe;
use jmvolume_core::error::{JmvolumeError, JmvolumeResult};
use jmvolume_core::provider::{ContainerState, DeviceProbe};
use jmvolume_core::secret::{MixedSecret, Secret};
use jmvolume_core::{JmvolumeConfig, MAX_KEY_SLOTS};
use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};

/// Slot holding the primary key; it can never be wiped.
pub const PRIMARY_SLOT: u8 = 0;

/// Length of generated transient mapper names.
const DEVICE_NAME_LENGTH: usize = 20;

/// Parameters for [`EncryptedContainer::create`].
#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub size_mb: u64,
    pub overwrite: bool,
    /// Second unlock path enrolled right after formatting.
    pub backup_key: Option<Secret>,
    pub backup_slot: u8,
    /// Mapper name used for the format round trip; random when unset.
    pub device_name: Option<String>,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            size_mb: 40,
            overwrite: false,
            backup_key: None,
            backup_slot: 3,
            device_name: None,
        }
    }
}

impl CreateOptions {
    pub fn from_config(config: &JmvolumeConfig) -> Self {
        Self {
            size_mb: config.luks.default_size_mb,
            backup_slot: config.luks.backup_slot,
            ..Self::default()
        }
    }
}

/// Handle to one LUKS container.
#[derive(Debug, Clone)]
pub struct EncryptedContainer<P = SystemProbe> {
    path: PathBuf,
    mapper_name: String,
    mapped_device: PathBuf,
    tools: HostTools,
    probe: P,
}

impl<P> EncryptedContainer<P>
where
    P: DeviceProbe<Error = JmvolumeError>,
{
    /// Refer to an existing container. Nothing is touched on the host.
    pub fn new(
        tools: HostTools,
        probe: P,
        path: impl Into<PathBuf>,
        mapper_name: impl Into<String>,
    ) -> JmvolumeResult<Self> {
        let mapper_name = mapper_name.into();
        validate_mapper_name(&mapper_name)?;
        let mapped_device = tools.mapped_device(&mapper_name);
        Ok(Self {
            path: path.into(),
            mapper_name,
            mapped_device,
            tools,
            probe,
        })
    }

    /// Allocate, format, and put a filesystem on a new container.
    ///
    /// The container is opened once under the transient device name so the
    /// filesystem can be built, then closed again: the returned handle is
    /// always Sealed. When a backup key is supplied it is enrolled in
    /// `options.backup_slot` authenticated by `key`.
    pub fn create(
        tools: HostTools,
        probe: P,
        path: &Path,
        key: &Secret,
        options: CreateOptions,
    ) -> JmvolumeResult<Self> {
        key.ensure_non_empty("container key")?;
        if !options.overwrite && fs::symlink_metadata(path).is_ok() {
            return Err(JmvolumeError::VolumeExists(path.to_path_buf()));
        }
        if let Some(backup) = &options.backup_key {
            backup.ensure_non_empty("backup key")?;
            check_slot(options.backup_slot)?;
        }

        let device_name = match options.device_name {
            Some(name) => name,
            None => random_device_name(),
        };
        let container = Self::new(tools, probe, path, device_name)?;

        info!(
            "creating {} MB container at {}",
            options.size_mb,
            path.display()
        );
        container.tools.allocate(path, options.size_mb)?;
        container.tools.luks_format(path, key)?;
        container
            .tools
            .luks_open_any(path, &container.mapper_name, key)?;
        if let Err(err) = container.tools.make_filesystem(&container.mapped_device) {
            if let Err(close_err) = container.tools.luks_close(&container.mapper_name) {
                warn!(
                    "failed to re-seal {} after filesystem error: {close_err}",
                    container.mapper_name
                );
            }
            return Err(err);
        }
        container.tools.luks_close(&container.mapper_name)?;

        if let Some(backup) = &options.backup_key {
            container.add_key(key, backup, options.backup_slot)?;
        }

        Ok(container)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mapper_name(&self) -> &str {
        &self.mapper_name
    }

    pub fn mapped_device(&self) -> &Path {
        &self.mapped_device
    }

    pub fn probe(&self) -> &P {
        &self.probe
    }

    pub(crate) fn tools(&self) -> &HostTools {
        &self.tools
    }

    pub fn is_open(&self) -> bool {
        self.probe.device_exists(&self.mapped_device)
    }

    pub fn state(&self) -> ContainerState {
        if self.is_open() {
            ContainerState::Open
        } else {
            ContainerState::Sealed
        }
    }

    /// Sealed -> Open using the secret registered in `slot`.
    pub fn open(&self, key: &Secret, slot: u8) -> JmvolumeResult<()> {
        check_slot(slot)?;
        key.ensure_non_empty("container key")?;
        self.tools
            .luks_open(&self.path, &self.mapper_name, key, slot)?;
        info!(
            "opened {} as {}",
            self.path.display(),
            self.mapped_device.display()
        );
        Ok(())
    }

    /// Open -> Sealed. Fails with the engine's busy error while mounted.
    pub fn close(&self) -> JmvolumeResult<()> {
        self.tools.luks_close(&self.mapper_name)?;
        info!("closed {}", self.mapper_name);
        Ok(())
    }

    /// Register `new_key` in `slot`, authenticating with `existing_key`.
    pub fn add_key(
        &self,
        existing_key: &Secret,
        new_key: &Secret,
        slot: u8,
    ) -> JmvolumeResult<()> {
        check_slot(slot)?;
        existing_key.ensure_non_empty("existing key")?;
        new_key.ensure_non_empty("new key")?;
        let mixed = MixedSecret::new(existing_key, new_key);
        self.tools.luks_add_key(&self.path, &mixed, slot)?;
        info!("added key in slot {slot} of {}", self.path.display());
        Ok(())
    }

    /// Replace the secret in `slot`; the old one stops working.
    pub fn change_key(
        &self,
        existing_key: &Secret,
        new_key: &Secret,
        slot: u8,
    ) -> JmvolumeResult<()> {
        check_slot(slot)?;
        existing_key.ensure_non_empty("existing key")?;
        new_key.ensure_non_empty("new key")?;
        let mixed = MixedSecret::new(existing_key, new_key);
        self.tools.luks_change_key(&self.path, &mixed, slot)?;
        info!("changed key in slot {slot} of {}", self.path.display());
        Ok(())
    }

    /// Permanently revoke `slot`. `existing_key` must unlock another slot.
    ///
    /// Slot 0 is refused outright, however many other slots are occupied.
    pub fn remove_key(&self, existing_key: &Secret, slot: u8) -> JmvolumeResult<()> {
        if slot == PRIMARY_SLOT {
            return Err(JmvolumeError::ProtectedSlot(slot));
        }
        check_slot(slot)?;
        existing_key.ensure_non_empty("existing key")?;
        self.tools.luks_kill_slot(&self.path, existing_key, slot)?;
        warn!("wiped key slot {slot} of {}", self.path.display());
        Ok(())
    }

    /// Close if open, then remove the backing file with every key slot.
    pub fn delete(self) -> JmvolumeResult<()> {
        if self.is_open() {
            self.close()?;
        }
        fs::remove_file(&self.path)?;
        warn!("deleted container {}", self.path.display());
        Ok(())
    }
}

fn check_slot(slot: u8) -> JmvolumeResult<()> {
    if slot >= MAX_KEY_SLOTS {
        return Err(JmvolumeError::InvalidSlot(slot));
    }
    Ok(())
}

fn validate_mapper_name(name: &str) -> JmvolumeResult<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name
            .chars()
            .any(|ch| ch == '/' || ch.is_whitespace() || ch.is_control())
    {
        return Err(JmvolumeError::InvalidConfig(format!(
            "`{name}` is not a valid mapper name"
        )));
    }
    Ok(())
}

fn random_device_name() -> String {
    String::from_utf8_lossy(Secret::generate(DEVICE_NAME_LENGTH).as_bytes()).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_bounds() {
        assert!(check_slot(0).is_ok());
        assert!(check_slot(MAX_KEY_SLOTS - 1).is_ok());
        assert!(matches!(
            check_slot(MAX_KEY_SLOTS),
            Err(JmvolumeError::InvalidSlot(8))
        ));
    }

    #[test]
    fn mapper_name_rules() {
        assert!(validate_mapper_name("jmvolume_test").is_ok());
        assert!(validate_mapper_name("localo-test").is_ok());
        assert!(validate_mapper_name("").is_err());
        assert!(validate_mapper_name("..").is_err());
        assert!(validate_mapper_name("a/b").is_err());
        assert!(validate_mapper_name("a b").is_err());
    }

    #[test]
    fn random_device_names_are_alphanumeric() {
        let name = random_device_name();
        assert_eq!(name.len(), DEVICE_NAME_LENGTH);
        assert!(name.chars().all(|ch| ch.is_ascii_alphanumeric()));
        assert!(validate_mapper_name(&name).is_ok());
    }

    #[test]
    fn create_options_follow_config() {
        let mut config = JmvolumeConfig::default();
        config.luks.default_size_mb = 128;
        config.luks.backup_slot = 5;
        let options = CreateOptions::from_config(&config);
        assert_eq!(options.size_mb, 128);
        assert_eq!(options.backup_slot, 5);
        assert!(!options.overwrite);
        assert!(options.backup_key.is_none());
    }
}
