//! Transactional access to the crypt-unlock and mount tables.

use super::{CryptEntry, MountEntry, Table};
use crate::atomic::{self, StagedWrite};
use crate::config::KeywardConfig;
use crate::error::{KeywardError, KeywardResult};
use log::{debug, warn};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

type Fingerprint = Option<[u8; 32]>;

/// Owner of the on-disk `crypttab`/`fstab` pair.
///
/// Every successful [`ConfigStore::apply`] bumps a generation counter. A diff
/// computed from an older generation, or from bytes that changed on disk since
/// they were loaded, is rejected with [`KeywardError::Conflict`].
#[derive(Debug)]
pub struct ConfigStore {
    crypttab_path: PathBuf,
    fstab_path: PathBuf,
    generation: Mutex<u64>,
}

/// Parsed view of both tables at one generation.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub generation: u64,
    pub crypttab: Table<CryptEntry>,
    pub fstab: Table<MountEntry>,
    fingerprints: (Fingerprint, Fingerprint),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CryptChange {
    /// Insert or replace the entry for `entry.device`.
    Upsert(CryptEntry),
    /// Remove the entry for a device reference.
    Remove { device: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountChange {
    /// Insert or replace the entry mounted at `entry.mount_point`.
    Upsert(MountEntry),
    Remove { mount_point: String },
}

/// Set of table edits bound to the snapshot they were computed from.
#[derive(Debug, Clone)]
pub struct TableDiff {
    base_generation: u64,
    fingerprints: (Fingerprint, Fingerprint),
    pub crypt: Vec<CryptChange>,
    pub mount: Vec<MountChange>,
}

impl TableDiff {
    pub fn base_generation(&self) -> u64 {
        self.base_generation
    }

    pub fn is_empty(&self) -> bool {
        self.crypt.is_empty() && self.mount.is_empty()
    }

    pub fn upsert_crypt(&mut self, entry: CryptEntry) -> &mut Self {
        self.crypt.push(CryptChange::Upsert(entry));
        self
    }

    pub fn remove_crypt(&mut self, device: impl Into<String>) -> &mut Self {
        self.crypt.push(CryptChange::Remove {
            device: device.into(),
        });
        self
    }

    pub fn upsert_mount(&mut self, entry: MountEntry) -> &mut Self {
        self.mount.push(MountChange::Upsert(entry));
        self
    }

    pub fn remove_mount(&mut self, mount_point: impl Into<String>) -> &mut Self {
        self.mount.push(MountChange::Remove {
            mount_point: mount_point.into(),
        });
        self
    }
}

impl Snapshot {
    /// Start an empty diff against this snapshot.
    pub fn diff(&self) -> TableDiff {
        TableDiff {
            base_generation: self.generation,
            fingerprints: self.fingerprints,
            crypt: Vec::new(),
            mount: Vec::new(),
        }
    }

    pub fn crypt_for_device(&self, device: &str) -> Option<&CryptEntry> {
        self.crypttab.find(|entry| entry.refers_to(device))
    }

    pub fn crypt_by_name(&self, name: &str) -> Option<&CryptEntry> {
        self.crypttab.find(|entry| entry.name == name)
    }

    pub fn mount_for_point(&self, mount_point: &str) -> Option<&MountEntry> {
        self.fstab.find(|entry| entry.mount_point == mount_point)
    }

    pub fn mount_for_source(&self, source: &str) -> Option<&MountEntry> {
        self.fstab.find(|entry| entry.source == source)
    }
}

impl ConfigStore {
    pub fn new(crypttab_path: impl Into<PathBuf>, fstab_path: impl Into<PathBuf>) -> Self {
        Self {
            crypttab_path: crypttab_path.into(),
            fstab_path: fstab_path.into(),
            generation: Mutex::new(0),
        }
    }

    pub fn from_config(config: &KeywardConfig) -> Self {
        Self::new(config.crypttab_path(), config.fstab_path())
    }

    pub fn crypttab_path(&self) -> &Path {
        &self.crypttab_path
    }

    pub fn fstab_path(&self) -> &Path {
        &self.fstab_path
    }

    pub fn generation(&self) -> u64 {
        *self.lock_generation()
    }

    /// Read and parse both tables. Missing files load as empty tables.
    pub fn load(&self) -> KeywardResult<Snapshot> {
        let generation = self.lock_generation();
        let (crypt_raw, crypt_fp) = read_table(&self.crypttab_path)?;
        let (fstab_raw, fstab_fp) = read_table(&self.fstab_path)?;
        Ok(Snapshot {
            generation: *generation,
            crypttab: Table::parse(&self.crypttab_path, &crypt_raw)?,
            fstab: Table::parse(&self.fstab_path, &fstab_raw)?,
            fingerprints: (crypt_fp, fstab_fp),
        })
    }

    /// Point lookup of the crypt entry for `device`.
    pub fn query_device(&self, device: &str) -> KeywardResult<Option<CryptEntry>> {
        Ok(self.load()?.crypt_for_device(device).cloned())
    }

    /// Point lookup of the mount entry for `mount_point`.
    pub fn query_mountpoint(&self, mount_point: &str) -> KeywardResult<Option<MountEntry>> {
        Ok(self.load()?.mount_for_point(mount_point).cloned())
    }

    /// Apply `diff` and atomically rewrite the affected tables.
    ///
    /// Returns the new generation. Nothing is written when the diff is stale,
    /// does not validate, or a temp file cannot be prepared.
    pub fn apply(&self, diff: &TableDiff) -> KeywardResult<u64> {
        let mut generation = self.lock_generation();
        if diff.base_generation != *generation {
            return Err(KeywardError::Conflict {
                expected: diff.base_generation,
                found: *generation,
            });
        }

        let (crypt_raw, crypt_fp) = read_table(&self.crypttab_path)?;
        let (fstab_raw, fstab_fp) = read_table(&self.fstab_path)?;
        if (crypt_fp, fstab_fp) != diff.fingerprints {
            // Someone edited the files behind our back; invalidate every
            // outstanding snapshot.
            *generation += 1;
            warn!(
                "tables changed on disk since generation {}; rejecting diff",
                diff.base_generation
            );
            return Err(KeywardError::Conflict {
                expected: diff.base_generation,
                found: *generation,
            });
        }

        let mut crypttab: Table<CryptEntry> = Table::parse(&self.crypttab_path, &crypt_raw)?;
        let mut fstab: Table<MountEntry> = Table::parse(&self.fstab_path, &fstab_raw)?;

        for change in &diff.crypt {
            match change {
                CryptChange::Upsert(entry) => {
                    let device = entry.device.clone();
                    crypttab.upsert_by(|existing| existing.refers_to(&device), entry.clone());
                }
                CryptChange::Remove { device } => {
                    crypttab.remove_by(|existing| existing.refers_to(device));
                }
            }
        }
        for change in &diff.mount {
            match change {
                MountChange::Upsert(entry) => {
                    let point = entry.mount_point.clone();
                    fstab.upsert_by(|existing| existing.mount_point == point, entry.clone());
                }
                MountChange::Remove { mount_point } => {
                    fstab.remove_by(|existing| existing.mount_point == *mount_point);
                }
            }
        }

        validate(&crypttab, &fstab, diff)?;

        let crypt_out = crypttab.render();
        let fstab_out = fstab.render();
        let mut staged = Vec::new();
        if crypt_out != crypt_raw {
            staged.push((atomic::stage(&self.crypttab_path, crypt_out.as_bytes(), None)?, crypt_raw));
        }
        if fstab_out != fstab_raw {
            staged.push((atomic::stage(&self.fstab_path, fstab_out.as_bytes(), None)?, fstab_raw));
        }

        commit_all(staged)?;

        *generation += 1;
        Ok(*generation)
    }

    fn lock_generation(&self) -> std::sync::MutexGuard<'_, u64> {
        self.generation
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Rename each staged table into place. If one fails, tables already renamed
/// get their previous contents back.
fn commit_all(staged: Vec<(StagedWrite, String)>) -> KeywardResult<()> {
    let mut committed: Vec<(PathBuf, String)> = Vec::new();
    for (write, previous) in staged {
        let dest = write.dest().to_path_buf();
        if let Err(err) = write.commit() {
            for (path, original) in committed.iter().rev() {
                if let Err(restore_err) = atomic::write_atomic(path, original.as_bytes(), None) {
                    warn!(
                        "failed to restore {} after aborted table rewrite: {restore_err}",
                        path.display()
                    );
                }
            }
            return Err(err);
        }
        debug!("rewrote {}", dest.display());
        committed.push((dest, previous));
    }
    Ok(())
}

fn read_table(path: &Path) -> KeywardResult<(String, Fingerprint)> {
    match fs::read(path) {
        Ok(bytes) => {
            let digest: [u8; 32] = Sha256::digest(&bytes).into();
            let text = String::from_utf8(bytes).map_err(|_| KeywardError::Parse {
                path: path.to_path_buf(),
                line: 0,
                reason: "file is not valid UTF-8".into(),
            })?;
            Ok((text, Some(digest)))
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok((String::new(), None)),
        Err(err) => Err(KeywardError::Io(err)),
    }
}

fn validate(
    crypttab: &Table<CryptEntry>,
    fstab: &Table<MountEntry>,
    diff: &TableDiff,
) -> KeywardResult<()> {
    let mut names = HashSet::new();
    let entries: Vec<&CryptEntry> = crypttab.entries().collect();
    for (idx, entry) in entries.iter().enumerate() {
        if !names.insert(entry.name.as_str()) {
            return Err(KeywardError::InvalidConfig(format!(
                "crypttab would contain mapping `{}` twice",
                entry.name
            )));
        }
        if entries[idx + 1..]
            .iter()
            .any(|other| other.refers_to(&entry.device))
        {
            return Err(KeywardError::InvalidConfig(format!(
                "crypttab would contain device `{}` twice",
                entry.device
            )));
        }
    }

    let mut points = HashSet::new();
    for entry in fstab.entries() {
        if !points.insert(entry.mount_point.as_str()) {
            return Err(KeywardError::InvalidConfig(format!(
                "fstab would contain mount point `{}` twice",
                entry.mount_point
            )));
        }
    }

    // Entries this diff writes must point at a mapping crypttab provides.
    for change in &diff.mount {
        if let MountChange::Upsert(entry) = change {
            if let Some(name) = entry.mapping_name() {
                if !names.contains(name) {
                    return Err(KeywardError::InvalidConfig(format!(
                        "fstab entry for {} references mapping `{name}` missing from crypttab",
                        entry.mount_point
                    )));
                }
            }
        }
    }

    Ok(())
}
