//! Fake host used by the integration tests.
//!
//! Every external tool is a small shell script that keeps its state under a
//! temporary directory: key slots live next to the container file in
//! `<container>.slots/<n>`, open mappings are files under `mapper/`, and the
//! mount table is a `/proc/mounts` style text file.

#![allow(dead_code)]

use jmvolume_core::JmvolumeConfig;
use jmvolume_luks::{HostTools, SystemProbe};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::{tempdir, TempDir};

const CRYPTSETUP: &str = r#"#!/bin/sh
MAPPER="@MAPPER@"
MOUNTS="@MOUNTS@"
STATE="@STATE@"
echo "cryptsetup $*" >> "@LOG@"

SLOT=""
SIZE=""
while [ $# -gt 0 ]; do
  case "$1" in
    -d) shift 2 ;;
    --key-slot) SLOT="$2"; shift 2 ;;
    --keyfile-size) SIZE="$2"; shift 2 ;;
    *) break ;;
  esac
done
ACTION="$1"
shift

INPUT="$STATE/stdin.$$"
cat > "$INPUT"
trap 'rm -f "$INPUT" "$INPUT.auth" "$INPUT.new"' EXIT

matches_slot() {
  [ -f "$1/$2" ] && cmp -s "$1/$2" "$3"
}

matches_any() {
  for f in "$1"/*; do
    [ -f "$f" ] || continue
    [ "$(basename "$f")" = "$3" ] && continue
    cmp -s "$f" "$2" && return 0
  done
  return 1
}

no_key() {
  echo "No key available with this passphrase." 1>&2
  exit 2
}

case "$ACTION" in
  luksFormat)
    DEV="$1"
    [ -f "$DEV" ] || { echo "Device $DEV does not exist or access denied." 1>&2; exit 4; }
    rm -rf "$DEV.slots"
    mkdir -p "$DEV.slots"
    cp "$INPUT" "$DEV.slots/0"
    ;;
  luksOpen)
    DEV="$1"
    NAME="$2"
    [ -d "$DEV.slots" ] || { echo "Device $DEV is not a valid LUKS device." 1>&2; exit 1; }
    if [ -n "$SLOT" ]; then
      matches_slot "$DEV.slots" "$SLOT" "$INPUT" || no_key
    else
      matches_any "$DEV.slots" "$INPUT" "" || no_key
    fi
    [ -e "$MAPPER/$NAME" ] && { echo "Device $NAME already exists." 1>&2; exit 5; }
    echo "$DEV" > "$MAPPER/$NAME"
    ;;
  luksClose)
    NAME="$1"
    [ -e "$MAPPER/$NAME" ] || { echo "Device $NAME is not active." 1>&2; exit 4; }
    if grep -qF "$MAPPER/$NAME " "$MOUNTS" 2>/dev/null; then
      echo "Device $NAME is still in use." 1>&2
      exit 5
    fi
    rm -f "$MAPPER/$NAME"
    ;;
  luksAddKey|luksChangeKey)
    DEV="$1"
    head -c "$SIZE" "$INPUT" > "$INPUT.auth"
    tail -c +"$((SIZE + 1))" "$INPUT" > "$INPUT.new"
    if [ "$ACTION" = luksAddKey ]; then
      matches_any "$DEV.slots" "$INPUT.auth" "" || no_key
      if [ -f "$DEV.slots/$SLOT" ]; then
        echo "Key slot $SLOT is full, please select another one." 1>&2
        exit 1
      fi
    else
      matches_slot "$DEV.slots" "$SLOT" "$INPUT.auth" || no_key
    fi
    cp "$INPUT.new" "$DEV.slots/$SLOT"
    ;;
  luksKillSlot)
    DEV="$1"
    KILL="$2"
    [ -f "$DEV.slots/$KILL" ] || { echo "Keyslot $KILL is not active." 1>&2; exit 1; }
    matches_any "$DEV.slots" "$INPUT" "$KILL" || no_key
    rm -f "$DEV.slots/$KILL"
    ;;
  *)
    echo "Unknown action." 1>&2
    exit 1
    ;;
esac
exit 0
"#;

const DD: &str = r#"#!/bin/sh
echo "dd $*" >> "@LOG@"
for arg in "$@"; do
  case "$arg" in
    of=*) OF="${arg#of=}" ;;
    count=*) COUNT="${arg#count=}" ;;
  esac
done
printf 'zeroed %s blocks\n' "$COUNT" > "$OF"
"#;

const MKFS: &str = r#"#!/bin/sh
echo "mkfs.ext3 $*" >> "@LOG@"
if [ ! -e "$1" ]; then
  echo "mkfs.ext3: No such file or directory while trying to determine filesystem size" 1>&2
  exit 1
fi
if [ -f "@STATE@/mkfs_fail" ]; then
  echo "mkfs.ext3: Device size reported to be zero." 1>&2
  exit 1
fi
"#;

const MOUNT: &str = r#"#!/bin/sh
echo "mount $*" >> "@LOG@"
[ -e "$1" ] || { echo "mount: special device $1 does not exist." 1>&2; exit 32; }
[ -d "$2" ] || { echo "mount: mount point $2 does not exist." 1>&2; exit 32; }
TARGET="$(cd "$2" && pwd -P)"
echo "$1 $TARGET ext3 rw,relatime 0 0" >> "@MOUNTS@"
"#;

const UMOUNT: &str = r#"#!/bin/sh
MOUNTS="@MOUNTS@"
echo "umount $*" >> "@LOG@"
if [ -f "@STATE@/busy" ]; then
  echo "umount: $1: target is busy." 1>&2
  exit 32
fi
grep -qF "$1 " "$MOUNTS" || { echo "umount: $1: not mounted." 1>&2; exit 32; }
grep -vF "$1 " "$MOUNTS" > "$MOUNTS.tmp"
mv "$MOUNTS.tmp" "$MOUNTS"
"#;

const LSOF: &str = r#"#!/bin/sh
echo "lsof $*" >> "@LOG@"
[ -f "@STATE@/busy" ] || exit 1
printf 'COMMAND  PID USER   FD   TYPE DEVICE SIZE/OFF NODE NAME\n'
printf 'bash    4242 root  cwd    DIR  253,0     4096    2 %s\n' "$1"
"#;

pub struct FakeHost {
    pub dir: TempDir,
    pub config: JmvolumeConfig,
    pub log_path: PathBuf,
    pub state: PathBuf,
    pub mapper: PathBuf,
    pub mounts: PathBuf,
}

impl FakeHost {
    pub fn new() -> Self {
        let dir = tempdir().expect("tempdir");
        let bin = dir.path().join("bin");
        let state = dir.path().join("state");
        let mapper = dir.path().join("mapper");
        for path in [&bin, &state, &mapper] {
            fs::create_dir_all(path).expect("create fake host dirs");
        }
        let mounts = dir.path().join("mounts");
        fs::write(&mounts, "proc /proc proc rw,nosuid 0 0\n").expect("seed mounts");
        let log_path = dir.path().join("commands.log");

        let render = |template: &str| {
            template
                .replace("@MAPPER@", &mapper.to_string_lossy())
                .replace("@MOUNTS@", &mounts.to_string_lossy())
                .replace("@STATE@", &state.to_string_lossy())
                .replace("@LOG@", &log_path.to_string_lossy())
        };

        let mut config = JmvolumeConfig::default();
        config.luks.mapper_root = mapper.to_string_lossy().into_owned();
        config.luks.mounts_path = mounts.to_string_lossy().into_owned();
        config.tools.cryptsetup_path = Some(write_tool(&bin, "cryptsetup", &render(CRYPTSETUP)));
        config.tools.dd_path = Some(write_tool(&bin, "dd", &render(DD)));
        config.tools.mkfs_path = Some(write_tool(&bin, "mkfs.ext3", &render(MKFS)));
        config.tools.mount_path = Some(write_tool(&bin, "mount", &render(MOUNT)));
        config.tools.umount_path = Some(write_tool(&bin, "umount", &render(UMOUNT)));
        config.tools.lsof_path = Some(write_tool(&bin, "lsof", &render(LSOF)));

        Self {
            dir,
            config,
            log_path,
            state,
            mapper,
            mounts,
        }
    }

    pub fn tools(&self) -> HostTools {
        HostTools::from_config(&self.config).expect("fake tools resolve")
    }

    pub fn probe(&self) -> SystemProbe {
        SystemProbe::from_config(&self.config)
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Symlink `name` pointing at the directory `target`.
    pub fn mount_point_link(&self, name: &str, target: &Path) -> PathBuf {
        let path = self.dir.path().join(name);
        std::os::unix::fs::symlink(target, &path).expect("create mount point link");
        path
    }

    pub fn mount_point(&self, name: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        fs::create_dir_all(&path).expect("create mount point");
        path
    }

    /// Commands issued so far, one per line.
    pub fn log(&self) -> Vec<String> {
        fs::read_to_string(&self.log_path)
            .unwrap_or_default()
            .lines()
            .map(|line| line.to_string())
            .collect()
    }

    pub fn clear_log(&self) {
        let _ = fs::remove_file(&self.log_path);
    }

    pub fn slot(&self, container: &Path, slot: u8) -> Option<Vec<u8>> {
        let slots = PathBuf::from(format!("{}.slots", container.display()));
        fs::read(slots.join(slot.to_string())).ok()
    }

    pub fn set_busy(&self, busy: bool) {
        self.set_flag("busy", busy);
    }

    pub fn set_mkfs_failure(&self, fail: bool) {
        self.set_flag("mkfs_fail", fail);
    }

    fn set_flag(&self, name: &str, on: bool) {
        let flag = self.state.join(name);
        if on {
            fs::write(flag, b"").expect("set flag");
        } else {
            let _ = fs::remove_file(flag);
        }
    }
}

fn write_tool(bin: &Path, name: &str, contents: &str) -> String {
    let path = bin.join(name);
    fs::write(&path, contents).expect("write fake tool");
    let mut perms = fs::metadata(&path).expect("stat fake tool").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).expect("chmod fake tool");
    path.to_string_lossy().into_owned()
}
