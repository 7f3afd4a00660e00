//! Provider contract for LUKS primitives.
//!
//! Implementations are expected to block until the underlying operation
//! completes. Wrong key material must be reported through the implementation's
//! authentication-failure error so callers can retry with another key.

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;

/// On-disk LUKS header generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LuksVersion {
    Luks1,
    Luks2,
}

impl LuksVersion {
    /// Number of keyslots the header format can hold.
    pub fn max_slots(self) -> usize {
        match self {
            LuksVersion::Luks1 => 8,
            LuksVersion::Luks2 => 32,
        }
    }

    /// Whether a key can be replaced in place while keeping its slot index.
    pub fn supports_in_place_change(self) -> bool {
        matches!(self, LuksVersion::Luks2)
    }

    /// Value accepted by `cryptsetup --type`.
    pub fn as_str(self) -> &'static str {
        match self {
            LuksVersion::Luks1 => "luks1",
            LuksVersion::Luks2 => "luks2",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "luks1" | "1" => Some(LuksVersion::Luks1),
            "luks2" | "2" => Some(LuksVersion::Luks2),
            _ => None,
        }
    }
}

impl fmt::Display for LuksVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a keyslot is unlocked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SlotKind {
    /// Interactive or stored passphrase.
    Passphrase,
    /// Network-bound slot whose passphrase is released by a keyserver.
    Keyserver { url: String, thumbprint: String },
}

/// One populated keyslot on a LUKS volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySlot {
    pub index: u32,
    #[serde(flatten)]
    pub kind: SlotKind,
}

impl KeySlot {
    pub fn passphrase(index: u32) -> Self {
        Self {
            index,
            kind: SlotKind::Passphrase,
        }
    }

    pub fn is_keyserver(&self) -> bool {
        matches!(self.kind, SlotKind::Keyserver { .. })
    }
}

/// Abstraction over the LUKS primitive library.
///
/// `device` is always the encrypted block device (e.g. `/dev/sdb1`), `name` the
/// device-mapper name of the cleartext mapping.
pub trait LuksBackend {
    type Error: Error + Send + Sync + 'static;

    /// Initialise a fresh header with `key` in slot 0, destroying all previous keys.
    fn format(&self, device: &str, version: LuksVersion, key: &[u8]) -> Result<(), Self::Error>;

    /// Open the volume as `/dev/mapper/<name>`.
    fn open(&self, device: &str, name: &str, key: &[u8]) -> Result<(), Self::Error>;

    /// Close the cleartext mapping; closing an inactive mapping succeeds.
    fn close(&self, name: &str) -> Result<(), Self::Error>;

    /// Whether the named cleartext mapping is currently active.
    fn is_open(&self, name: &str) -> Result<bool, Self::Error>;

    /// Add `new_key`, authorised by `auth_key`, optionally pinned to `slot`.
    /// Returns the index the key landed in.
    fn add_key(
        &self,
        device: &str,
        auth_key: &[u8],
        new_key: &[u8],
        slot: Option<u32>,
    ) -> Result<u32, Self::Error>;

    /// Destroy `slot`. With `auth_key` the backend verifies the key opens a
    /// remaining slot first; without it the slot is wiped unconditionally.
    fn kill_slot(&self, device: &str, slot: u32, auth_key: Option<&[u8]>)
        -> Result<(), Self::Error>;

    /// Replace the key in `slot` keeping the index (LUKS2 only).
    fn change_key(
        &self,
        device: &str,
        slot: u32,
        old_key: &[u8],
        new_key: &[u8],
    ) -> Result<(), Self::Error>;

    /// Whether `device` carries a LUKS header. Errors mean the device could
    /// not be inspected, not that it lacks a header.
    fn is_luks(&self, device: &str) -> Result<bool, Self::Error>;

    /// Header UUID of the volume.
    fn uuid(&self, device: &str) -> Result<String, Self::Error>;

    /// Header generation of the volume.
    fn version(&self, device: &str) -> Result<LuksVersion, Self::Error>;

    /// Indices of populated keyslots, ascending.
    fn active_slots(&self, device: &str) -> Result<Vec<u32>, Self::Error>;

    /// Return the slot `key` opens, or `None` when it opens none.
    fn test_key(&self, device: &str, key: &[u8]) -> Result<Option<u32>, Self::Error>;
}
