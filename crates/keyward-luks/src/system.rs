//! System-backed [`LuksBackend`] implementation.

use crate::cryptsetup::Cryptsetup;
use crate::dump::LuksDump;
use keyward_core::config::{detect_cryptsetup_path, KeywardConfig};
use keyward_core::error::{KeywardError, KeywardResult};
use keyward_provider::{LuksBackend, LuksVersion};
use std::path::PathBuf;
use std::time::Duration;

/// Manages LUKS headers and mappings via the host `cryptsetup` binary.
#[derive(Debug, Clone)]
pub struct SystemLuksBackend {
    cryptsetup: Cryptsetup,
}

impl SystemLuksBackend {
    pub fn new(binary: PathBuf, timeout: Duration) -> Self {
        Self {
            cryptsetup: Cryptsetup::new(binary, timeout),
        }
    }

    /// Resolve `cryptsetup` from `[luks] cryptsetup_path` or the usual locations.
    pub fn from_config(config: &KeywardConfig) -> KeywardResult<Self> {
        let binary = config
            .luks
            .cryptsetup_path
            .clone()
            .or_else(detect_cryptsetup_path)
            .ok_or_else(|| {
                KeywardError::InvalidConfig(
                    "cryptsetup not found; install it or set [luks] cryptsetup_path".into(),
                )
            })?;
        Ok(Self::new(PathBuf::from(binary), config.luks_timeout()))
    }

    /// Parsed `luksDump` of `device`, including LUKS2 tokens.
    pub fn dump(&self, device: &str) -> KeywardResult<LuksDump> {
        self.cryptsetup.dump(device)
    }
}

impl LuksBackend for SystemLuksBackend {
    type Error = KeywardError;

    fn format(&self, device: &str, version: LuksVersion, key: &[u8]) -> KeywardResult<()> {
        self.cryptsetup.format(device, version, key)
    }

    fn open(&self, device: &str, name: &str, key: &[u8]) -> KeywardResult<()> {
        self.cryptsetup.open(device, name, key)
    }

    fn close(&self, name: &str) -> KeywardResult<()> {
        self.cryptsetup.close(name)
    }

    fn is_open(&self, name: &str) -> KeywardResult<bool> {
        self.cryptsetup.is_open(name)
    }

    fn add_key(
        &self,
        device: &str,
        auth_key: &[u8],
        new_key: &[u8],
        slot: Option<u32>,
    ) -> KeywardResult<u32> {
        self.cryptsetup.add_key(device, auth_key, new_key, slot)
    }

    fn kill_slot(&self, device: &str, slot: u32, auth_key: Option<&[u8]>) -> KeywardResult<()> {
        self.cryptsetup.kill_slot(device, slot, auth_key)
    }

    fn change_key(
        &self,
        device: &str,
        slot: u32,
        old_key: &[u8],
        new_key: &[u8],
    ) -> KeywardResult<()> {
        if self.version(device)? != LuksVersion::Luks2 {
            return Err(KeywardError::Provider(format!(
                "{device} is LUKS1; in-place key change keeps the slot index only on LUKS2"
            )));
        }
        self.cryptsetup.change_key(device, slot, old_key, new_key)
    }

    fn is_luks(&self, device: &str) -> KeywardResult<bool> {
        self.cryptsetup.is_luks(device)
    }

    fn uuid(&self, device: &str) -> KeywardResult<String> {
        self.cryptsetup.uuid(device)
    }

    fn version(&self, device: &str) -> KeywardResult<LuksVersion> {
        Ok(self.cryptsetup.dump(device)?.version)
    }

    fn active_slots(&self, device: &str) -> KeywardResult<Vec<u32>> {
        Ok(self.cryptsetup.dump(device)?.slots)
    }

    fn test_key(&self, device: &str, key: &[u8]) -> KeywardResult<Option<u32>> {
        self.cryptsetup.test_key(device, key)
    }
}
