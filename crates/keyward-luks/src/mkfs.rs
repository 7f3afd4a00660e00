//! Filesystem creation through `mkfs -t <fstype>`.

use crate::command::{permission_denied, ToolCommand};
use keyward_core::config::KeywardConfig;
use keyward_core::error::{KeywardError, KeywardResult};
use keyward_provider::FilesystemMaker;
use log::info;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_MKFS: &str = "mkfs";

#[derive(Debug, Clone)]
pub struct SystemFilesystemMaker {
    mkfs: ToolCommand,
}

impl SystemFilesystemMaker {
    pub fn new(binary: PathBuf, timeout: Duration) -> Self {
        Self {
            mkfs: ToolCommand::new(binary, timeout),
        }
    }

    /// Uses `mkfs` from `PATH` with the `[luks]` command timeout.
    pub fn from_config(config: &KeywardConfig) -> Self {
        Self::new(PathBuf::from(DEFAULT_MKFS), config.luks_timeout())
    }
}

/// Flags that make the per-filesystem builder overwrite existing signatures
/// without asking.
fn force_flag(fstype: &str) -> Option<&'static str> {
    match fstype {
        "ext2" | "ext3" | "ext4" => Some("-F"),
        "xfs" | "btrfs" | "f2fs" => Some("-f"),
        _ => None,
    }
}

fn label_flag(fstype: &str) -> &'static str {
    match fstype {
        "vfat" | "fat" | "msdos" | "exfat" => "-n",
        _ => "-L",
    }
}

pub(crate) fn mkfs_args<'a>(device: &'a str, fstype: &'a str, label: Option<&'a str>) -> Vec<&'a str> {
    let mut args = vec!["-t", fstype];
    if let Some(flag) = force_flag(fstype) {
        args.push(flag);
    }
    if let Some(label) = label {
        args.extend([label_flag(fstype), label]);
    }
    args.push(device);
    args
}

impl FilesystemMaker for SystemFilesystemMaker {
    type Error = KeywardError;

    fn make_filesystem(&self, device: &str, fstype: &str, label: Option<&str>) -> KeywardResult<()> {
        if fstype.is_empty() || fstype.contains(char::is_whitespace) {
            return Err(KeywardError::InvalidConfig(format!(
                "`{fstype}` is not a filesystem type"
            )));
        }
        let out = self.mkfs.run(&mkfs_args(device, fstype, label), None)?;
        if out.success() {
            info!("created {fstype} filesystem on {device}");
            return Ok(());
        }
        let hint = if permission_denied(&out.diagnostic_lower()) {
            ". This usually requires root"
        } else {
            ""
        };
        Err(KeywardError::Provider(format!(
            "{} -t {fstype} failed on {device}: {}{hint}",
            self.mkfs.binary().display(),
            out.describe()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ext4_is_forced_and_labelled() {
        assert_eq!(
            mkfs_args("/dev/mapper/data", "ext4", Some("data")),
            vec!["-t", "ext4", "-F", "-L", "data", "/dev/mapper/data"]
        );
    }

    #[test]
    fn vfat_uses_its_own_label_flag() {
        assert_eq!(
            mkfs_args("/dev/mapper/esp", "vfat", Some("ESP")),
            vec!["-t", "vfat", "-n", "ESP", "/dev/mapper/esp"]
        );
    }

    #[test]
    fn rejects_bogus_fstype() {
        let mkfs = SystemFilesystemMaker::new(PathBuf::from("/bin/false"), Duration::from_secs(1));
        assert!(matches!(
            mkfs.make_filesystem("/dev/mapper/x", "ext4 -q", None),
            Err(KeywardError::InvalidConfig(_))
        ));
    }
}
