//! Stored passphrases for unattended unlock.
//!
//! Each device gets at most one plaintext file at `<key_dir>/<prefix>-<uuid>`,
//! readable by its owner only. Writes go through [`crate::atomic`] so a crash
//! leaves either the previous passphrase or the new one.

use crate::atomic::write_atomic;
use crate::config::KeywardConfig;
use crate::error::{KeywardError, KeywardResult};
use crate::tables::{ConfigStore, KeySource};
use chrono::{DateTime, Utc};
use log::info;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

const STORED_MODE: u32 = 0o400;

/// Metadata of a stored passphrase file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredPassphraseInfo {
    pub path: PathBuf,
    pub modified: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PassphraseVault {
    key_dir: PathBuf,
    prefix: String,
}

impl PassphraseVault {
    pub fn new(key_dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            key_dir: key_dir.into(),
            prefix: prefix.into(),
        }
    }

    pub fn from_config(config: &KeywardConfig) -> Self {
        Self::new(config.key_dir(), config.vault.prefix.clone())
    }

    pub fn key_dir(&self) -> &Path {
        &self.key_dir
    }

    /// Location of the stored passphrase for the volume with header `uuid`.
    pub fn path_for(&self, uuid: &str) -> PathBuf {
        self.key_dir
            .join(format!("{}-{}", self.prefix, uuid.trim().to_ascii_lowercase()))
    }

    /// Whether `path` is a file this vault manages.
    pub fn owns(&self, path: &Path) -> bool {
        path.parent() == Some(self.key_dir.as_path())
            && path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with(&format!("{}-", self.prefix)))
    }

    /// Persist `passphrase` for `uuid`, replacing any previous content.
    pub fn store(&self, uuid: &str, passphrase: &[u8]) -> KeywardResult<StoredPassphraseInfo> {
        if passphrase.is_empty() {
            return Err(KeywardError::MissingKey(
                "refusing to store an empty passphrase".into(),
            ));
        }
        let path = self.path_for(uuid);
        write_atomic(&path, passphrase, Some(STORED_MODE))?;
        info!("stored passphrase for {uuid} at {}", path.display());
        self.info_at(&path)
    }

    /// Replace an existing stored passphrase.
    pub fn rotate(&self, uuid: &str, passphrase: &[u8]) -> KeywardResult<StoredPassphraseInfo> {
        let path = self.path_for(uuid);
        if !path.exists() {
            return Err(KeywardError::MissingKey(format!(
                "no stored passphrase for {uuid} at {}",
                path.display()
            )));
        }
        self.store(uuid, passphrase)
    }

    /// Read the stored passphrase, if any.
    pub fn read(&self, uuid: &str) -> KeywardResult<Option<Zeroizing<Vec<u8>>>> {
        match fs::read(self.path_for(uuid)) {
            Ok(bytes) => Ok(Some(Zeroizing::new(bytes))),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(KeywardError::Io(err)),
        }
    }

    pub fn info(&self, uuid: &str) -> KeywardResult<Option<StoredPassphraseInfo>> {
        let path = self.path_for(uuid);
        match self.info_at(&path) {
            Ok(info) => Ok(Some(info)),
            Err(KeywardError::Io(err)) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Remove the stored passphrase file without touching crypttab.
    /// Returns whether a file existed.
    pub(crate) fn remove_file(&self, uuid: &str) -> KeywardResult<bool> {
        match fs::remove_file(self.path_for(uuid)) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(KeywardError::Io(err)),
        }
    }

    /// Delete the stored passphrase and point the crypttab entry of `device`
    /// (by `UUID=` or by path) back at an interactive prompt.
    ///
    /// crypttab is updated first so boot never references a missing key file.
    pub fn clear(&self, uuid: &str, device: &str, tables: &ConfigStore) -> KeywardResult<bool> {
        let snapshot = tables.load()?;
        let device_ref = format!("UUID={uuid}");
        let entry = snapshot
            .crypt_for_device(&device_ref)
            .or_else(|| snapshot.crypt_for_device(device));
        if let Some(entry) = entry {
            if entry.key.file().is_some_and(|path| self.owns(path)) {
                let mut updated = entry.clone();
                updated.key = KeySource::Prompt;
                let mut diff = snapshot.diff();
                diff.upsert_crypt(updated);
                tables.apply(&diff)?;
            }
        }

        let removed = self.remove_file(uuid)?;
        if removed {
            info!("cleared stored passphrase for {uuid}");
        }
        Ok(removed)
    }

    fn info_at(&self, path: &Path) -> KeywardResult<StoredPassphraseInfo> {
        let meta = fs::metadata(path)?;
        Ok(StoredPassphraseInfo {
            path: path.to_path_buf(),
            modified: DateTime::<Utc>::from(meta.modified()?),
        })
    }
}
