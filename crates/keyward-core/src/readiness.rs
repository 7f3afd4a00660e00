//! Boot-readiness flags derived from slot composition and mount intent.
//!
//! Everything here is a pure function: the same slots and intent always
//! produce the same flags, and flags the rules do not own are left alone.

use crate::tables::Options;
use keyward_provider::KeySlot;
use serde::{Deserialize, Serialize};

pub const NOAUTO: &str = "noauto";
pub const NETDEV: &str = "_netdev";
pub const NOFAIL: &str = "nofail";
pub const READ_ONLY: &str = "ro";

/// How the operator wants a filesystem activated at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountIntent {
    /// Unlock and mount automatically at boot.
    pub auto: bool,
    pub read_only: bool,
    /// Root and other filesystems whose absence must stop the boot.
    pub boot_critical: bool,
}

impl Default for MountIntent {
    fn default() -> Self {
        Self {
            auto: true,
            read_only: false,
            boot_critical: false,
        }
    }
}

/// Flags the resolver decided on, before being merged into option lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Readiness {
    pub noauto: bool,
    pub netdev: bool,
    pub nofail: bool,
    pub read_only: bool,
    /// Activation must wait for the network (consumed by boot tooling).
    pub requires_network: bool,
}

/// Decide readiness flags for a device with `slots` and the given `intent`.
///
/// `nofail_secondary` turns off the `nofail` rule for deployments that want
/// every configured filesystem to block boot.
pub fn resolve(slots: &[KeySlot], intent: &MountIntent, nofail_secondary: bool) -> Readiness {
    let networked = slots.iter().any(KeySlot::is_keyserver);
    Readiness {
        noauto: !intent.auto,
        netdev: networked,
        nofail: nofail_secondary && !intent.boot_critical,
        read_only: intent.read_only,
        requires_network: networked,
    }
}

impl Readiness {
    /// Merge into crypttab options. `ro` is a filesystem concern and not set here.
    pub fn apply_to_crypt(&self, options: &Options) -> Options {
        let mut out = options.clone();
        out.set(NOAUTO, self.noauto);
        out.set(NETDEV, self.netdev);
        out.set(NOFAIL, self.nofail);
        out
    }

    /// Merge into fstab options.
    pub fn apply_to_mount(&self, options: &Options) -> Options {
        let mut out = options.clone();
        out.set(NOAUTO, self.noauto);
        out.set(NETDEV, self.netdev);
        out.set(NOFAIL, self.nofail);
        out.set(READ_ONLY, self.read_only);
        if self.read_only {
            out.remove("rw");
        }
        out
    }
}

/// Recover the intent previously written into an fstab option list.
pub fn intent_from_options(options: &Options, boot_critical: bool) -> MountIntent {
    MountIntent {
        auto: !options.contains(NOAUTO),
        read_only: options.contains(READ_ONLY),
        boot_critical,
    }
}

/// Re-derive only the network flag, leaving every other flag as configured.
///
/// Used after slot changes, which never alter the operator's mount intent.
pub fn refresh_network_flag(slots: &[KeySlot], options: &Options) -> Options {
    let mut out = options.clone();
    out.set(NETDEV, slots.iter().any(KeySlot::is_keyserver));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyward_provider::SlotKind;

    fn tang(index: u32) -> KeySlot {
        KeySlot {
            index,
            kind: SlotKind::Keyserver {
                url: "http://tang.example".into(),
                thumbprint: "abc".into(),
            },
        }
    }

    #[test]
    fn keyserver_slot_adds_netdev() {
        let slots = [KeySlot::passphrase(0), tang(1)];
        let readiness = resolve(&slots, &MountIntent::default(), true);
        assert!(readiness.netdev && readiness.requires_network);

        let options = readiness.apply_to_mount(&Options::parse("defaults"));
        assert_eq!(options.to_string(), "defaults,_netdev,nofail");
    }

    #[test]
    fn netdev_is_dropped_without_keyserver_slots() {
        let slots = [KeySlot::passphrase(0)];
        let readiness = resolve(&slots, &MountIntent::default(), true);
        let options = readiness.apply_to_crypt(&Options::parse("luks,_netdev,discard,nofail"));
        assert_eq!(options.to_string(), "luks,discard,nofail");
    }

    #[test]
    fn boot_critical_filesystems_never_get_nofail() {
        let intent = MountIntent {
            boot_critical: true,
            ..MountIntent::default()
        };
        let readiness = resolve(&[KeySlot::passphrase(0)], &intent, true);
        let options = readiness.apply_to_mount(&Options::parse("nofail,errors=remount-ro"));
        assert_eq!(options.to_string(), "errors=remount-ro");
    }

    #[test]
    fn read_only_and_noauto_follow_intent() {
        let intent = MountIntent {
            auto: false,
            read_only: true,
            boot_critical: false,
        };
        let readiness = resolve(&[], &intent, false);
        let mount = readiness.apply_to_mount(&Options::parse("rw,relatime"));
        assert_eq!(mount.to_string(), "relatime,noauto,ro");
        let crypt = readiness.apply_to_crypt(&Options::default());
        assert_eq!(crypt.to_string(), "noauto");

        assert_eq!(intent_from_options(&mount, false), intent);
    }

    #[test]
    fn refresh_only_touches_netdev() {
        let options = Options::parse("noauto,_netdev");
        let refreshed = refresh_network_flag(&[KeySlot::passphrase(0)], &options);
        assert_eq!(refreshed.to_string(), "noauto");
        let refreshed = refresh_network_flag(&[tang(2)], &refreshed);
        assert_eq!(refreshed.to_string(), "noauto,_netdev");
    }
}
