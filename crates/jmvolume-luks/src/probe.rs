//! Host-backed `DeviceProbe`: mapped device nodes and the kernel mount table.

use jmvolume_core::error::{JmvolumeError, JmvolumeResult};
use jmvolume_core::provider::DeviceProbe;
use jmvolume_core::JmvolumeConfig;
use std::fs;
use std::path::{Path, PathBuf};

/// Probe that reads the live system state.
#[derive(Debug, Clone)]
pub struct SystemProbe {
    mounts_path: PathBuf,
}

impl SystemProbe {
    pub fn new(mounts_path: impl Into<PathBuf>) -> Self {
        Self {
            mounts_path: mounts_path.into(),
        }
    }

    pub fn from_config(config: &JmvolumeConfig) -> Self {
        Self::new(config.mounts_path())
    }

    fn read_mount_table(&self) -> JmvolumeResult<String> {
        fs::read_to_string(&self.mounts_path).map_err(|err| {
            JmvolumeError::Io(std::io::Error::new(
                err.kind(),
                format!("read mount table {}: {err}", self.mounts_path.display()),
            ))
        })
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new("/proc/mounts")
    }
}

impl DeviceProbe for SystemProbe {
    type Error = JmvolumeError;

    fn device_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_mounted(&self, device: &Path, mount_point: &Path) -> JmvolumeResult<bool> {
        let table = self.read_mount_table()?;
        let mounted = mount_entries(&table)
            .any(|(dev, target)| same_path(&target, mount_point) && same_path(&dev, device));
        Ok(mounted)
    }
}

/// Iterate `(device, mount point)` pairs of a `/proc/mounts` style table.
fn mount_entries(table: &str) -> impl Iterator<Item = (PathBuf, PathBuf)> + '_ {
    table.lines().filter_map(|line| {
        let mut parts = line.split_whitespace();
        let device = parts.next()?;
        let target = parts.next()?;
        Some((
            PathBuf::from(unescape_mount_field(device)),
            PathBuf::from(unescape_mount_field(target)),
        ))
    })
}

/// The kernel lists canonical paths: a mapping may show up as `/dev/dm-N`
/// and a mount point reached through a symlink by its resolved target.
fn same_path(listed: &Path, given: &Path) -> bool {
    if listed == given {
        return true;
    }
    match (fs::canonicalize(listed), fs::canonicalize(given)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn unescape_mount_field(input: &str) -> String {
    let mut chars = input.chars().peekable();
    let mut output = String::with_capacity(input.len());

    while let Some(ch) = chars.next() {
        if ch == '\\' {
            let mut oct = String::new();
            for _ in 0..3 {
                match chars.peek() {
                    Some(next) if next.is_ascii_digit() => {
                        oct.push(*next);
                        chars.next();
                    }
                    _ => break,
                }
            }
            if oct.len() == 3 {
                if let Ok(value) = u8::from_str_radix(&oct, 8) {
                    output.push(value as char);
                    continue;
                }
            }
            output.push('\\');
            output.push_str(&oct);
        } else {
            output.push(ch);
        }
    }

    output
}
