//! Per-device unlock state machine and reconciliation core.
//!
//! [`UnlockPlanner`] ties the keyslot manager, the passphrase vault and the
//! table store together. It tracks each device through
//! `Locked -> Unlocking -> Unlocked` (and `Formatting`/`Failed` during
//! re-initialisation) and keeps `noauto`/`_netdev`/`nofail` in the tables in
//! step with what the header can actually do.

mod format;
mod reconcile;
mod strategy;

#[cfg(test)]
mod tests;

pub use format::{FormatReport, FormatRequest, KeyserverSpec};
pub use reconcile::{DesiredState, ExecuteReport, MountSpec, Plan, PlanStep, StoredChoice};
pub use strategy::{
    Attempt, AttemptOutcome, KeyStrategy, PassphrasePrompt, UnlockReport, UnlockRequest,
};

use crate::config::KeywardConfig;
use crate::error::{KeywardError, KeywardResult};
use crate::lease::DeviceLease;
use crate::readiness::{self, NOAUTO};
use crate::slots::{EditOutcome, KeySlotManager, Removal, RemovalOutcome};
use crate::tables::{ConfigStore, CryptEntry, MountEntry, Snapshot};
use crate::vault::{PassphraseVault, StoredPassphraseInfo};
use keyward_provider::{FilesystemMaker, KeySlot, KeyserverBinder, LuksBackend, LuksVersion};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use zeroize::Zeroizing;

/// Lifecycle state of one device as seen by the planner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DeviceState {
    Locked,
    Unlocking,
    Unlocked { mapping: String },
    Formatting,
    Failed { reason: String },
}

impl DeviceState {
    pub fn label(&self) -> &'static str {
        match self {
            DeviceState::Locked => "locked",
            DeviceState::Unlocking => "unlocking",
            DeviceState::Unlocked { .. } => "unlocked",
            DeviceState::Formatting => "formatting",
            DeviceState::Failed { .. } => "failed",
        }
    }
}

/// Knobs taken from the `[luks]` and `[mount]` configuration sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannerPolicy {
    pub nofail_secondary: bool,
    pub default_version: LuksVersion,
    /// Prompt attempts per unlock before giving up.
    pub max_prompts: u32,
}

impl Default for PlannerPolicy {
    fn default() -> Self {
        Self {
            nofail_secondary: true,
            default_version: LuksVersion::Luks2,
            max_prompts: 3,
        }
    }
}

/// Everything known about one device, for status displays.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    pub device: String,
    pub uuid: String,
    pub version: LuksVersion,
    pub state: DeviceState,
    pub slots: Vec<KeySlot>,
    pub crypttab: Option<CryptEntry>,
    pub fstab: Option<MountEntry>,
    pub stored_passphrase: Option<StoredPassphraseInfo>,
    pub requires_network: bool,
    pub failed_attempts: u32,
}

/// Device plus its current table entries.
#[derive(Debug, Clone)]
pub(crate) struct Located {
    pub uuid: String,
    pub snapshot: Snapshot,
    pub crypt: Option<CryptEntry>,
    pub mapping: String,
    pub mount: Option<MountEntry>,
}

pub struct UnlockPlanner<B, K, F> {
    slots: KeySlotManager<B, K>,
    mkfs: F,
    tables: ConfigStore,
    vault: PassphraseVault,
    policy: PlannerPolicy,
    states: Mutex<HashMap<String, DeviceState>>,
    attempts: Mutex<HashMap<String, u32>>,
}

pub(crate) fn uuid_ref(uuid: &str) -> String {
    format!("UUID={uuid}")
}

pub(crate) fn default_mapping(uuid: &str) -> String {
    format!("luks-{uuid}")
}

pub(crate) fn mapper_path(mapping: &str) -> String {
    format!("/dev/mapper/{mapping}")
}

impl<B, K, F> UnlockPlanner<B, K, F>
where
    B: LuksBackend<Error = KeywardError>,
    K: KeyserverBinder<Error = KeywardError>,
    F: FilesystemMaker<Error = KeywardError>,
{
    pub fn new(
        backend: B,
        binder: K,
        mkfs: F,
        tables: ConfigStore,
        vault: PassphraseVault,
    ) -> Self {
        Self {
            slots: KeySlotManager::new(backend, binder),
            mkfs,
            tables,
            vault,
            policy: PlannerPolicy::default(),
            states: Mutex::new(HashMap::new()),
            attempts: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &KeywardConfig, backend: B, binder: K, mkfs: F) -> Self {
        Self::new(
            backend,
            binder,
            mkfs,
            ConfigStore::from_config(config),
            PassphraseVault::from_config(config),
        )
        .with_policy(PlannerPolicy {
            nofail_secondary: config.mount.nofail_secondary,
            default_version: config.luks.default_version,
            ..PlannerPolicy::default()
        })
    }

    pub fn with_policy(mut self, policy: PlannerPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn slots(&self) -> &KeySlotManager<B, K> {
        &self.slots
    }

    pub fn tables(&self) -> &ConfigStore {
        &self.tables
    }

    pub fn vault(&self) -> &PassphraseVault {
        &self.vault
    }

    pub fn policy(&self) -> PlannerPolicy {
        self.policy
    }

    /// Rejected keys since the last successful unlock of `device`.
    pub fn attempts(&self, device: &str) -> u32 {
        lock(&self.attempts).get(device).copied().unwrap_or(0)
    }

    /// Current state of `device`, re-derived from the system unless an
    /// operation is in flight. A failed device stays failed until its header
    /// reads back as LUKS again.
    pub fn state(&self, device: &str) -> KeywardResult<DeviceState> {
        let cached = lock(&self.states).get(device).cloned();
        match cached {
            Some(DeviceState::Unlocked { mapping }) => {
                if self.slots.backend().is_open(&mapping)? {
                    return Ok(DeviceState::Unlocked { mapping });
                }
            }
            Some(DeviceState::Failed { reason }) => {
                if !matches!(self.slots.backend().is_luks(device), Ok(true)) {
                    return Ok(DeviceState::Failed { reason });
                }
                info!("{device} has a readable header again; re-deriving its state");
            }
            Some(state @ DeviceState::Unlocking) | Some(state @ DeviceState::Formatting) => {
                return Ok(state)
            }
            Some(DeviceState::Locked) | None => {}
        }

        let located = self.locate(device)?;
        let state = if self.slots.backend().is_open(&located.mapping)? {
            DeviceState::Unlocked {
                mapping: located.mapping,
            }
        } else {
            DeviceState::Locked
        };
        self.set_state(device, state.clone());
        Ok(state)
    }

    pub fn status(&self, device: &str) -> KeywardResult<DeviceStatus> {
        let state = self.state(device)?;
        let located = self.locate(device)?;
        let slots = self.slots.list_slots(device)?;
        Ok(DeviceStatus {
            device: device.to_string(),
            version: self.slots.version(device)?,
            state,
            requires_network: slots.iter().any(KeySlot::is_keyserver),
            slots,
            stored_passphrase: self.vault.info(&located.uuid)?,
            crypttab: located.crypt,
            fstab: located.mount,
            uuid: located.uuid,
            failed_attempts: self.attempts(device),
        })
    }

    /// Open the device trying keyserver bindings, the stored passphrase, the
    /// supplied key and finally the prompt.
    ///
    /// Fails with [`KeywardError::AuthFailed`] when a caller-offered key was
    /// rejected and [`KeywardError::NoUsableKey`] when nothing worked.
    pub fn unlock(
        &self,
        lease: &DeviceLease,
        request: &UnlockRequest<'_>,
    ) -> KeywardResult<UnlockReport> {
        let device = lease.device();
        match self.state(device)? {
            DeviceState::Locked => {}
            other => {
                return Err(KeywardError::InvalidState {
                    device: device.to_string(),
                    state: other.label().to_string(),
                    action: "unlock",
                })
            }
        }

        let located = self.locate(device)?;
        let mapping = request
            .mapping
            .clone()
            .unwrap_or_else(|| located.mapping.clone());
        self.set_state(device, DeviceState::Unlocking);

        let mut attempts = Vec::new();
        let result = self.run_strategies(device, &located.uuid, &mapping, request, &mut attempts);
        let (strategy, slot) = match result {
            Ok(Some(opened)) => opened,
            Ok(None) => {
                self.set_state(device, DeviceState::Locked);
                let rejected = attempts.iter().any(|attempt| {
                    attempt.strategy.caller_offered() && attempt.outcome == AttemptOutcome::AuthFailed
                });
                warn!(
                    "unlock of {device} failed after {} attempt(s)",
                    self.attempts(device)
                );
                return Err(if rejected {
                    KeywardError::AuthFailed {
                        device: device.to_string(),
                    }
                } else {
                    KeywardError::NoUsableKey {
                        device: device.to_string(),
                    }
                });
            }
            Err(err) => {
                self.set_state(device, DeviceState::Locked);
                return Err(err);
            }
        };

        let failed_attempts = self.attempts(device);
        lock(&self.attempts).remove(device);
        self.set_state(
            device,
            DeviceState::Unlocked {
                mapping: mapping.clone(),
            },
        );
        info!("unlocked {device} as {mapping} via {strategy}");

        let mut warnings = Vec::new();
        if request.persist_activation {
            if let Err(err) = self.persist_activation(device, true) {
                warn!("could not clear noauto for {device}: {err}");
                warnings.push(format!("activation not persisted: {err}"));
            }
        }

        Ok(UnlockReport {
            device: device.to_string(),
            mapping,
            strategy,
            slot,
            attempts,
            failed_attempts,
            warnings,
        })
    }

    fn run_strategies(
        &self,
        device: &str,
        uuid: &str,
        mapping: &str,
        request: &UnlockRequest<'_>,
        attempts: &mut Vec<Attempt>,
    ) -> KeywardResult<Option<(KeyStrategy, Option<u32>)>> {
        for strategy in KeyStrategy::ORDER {
            if !request.allows(strategy) {
                continue;
            }
            match strategy {
                KeyStrategy::Keyserver => {
                    let bindings = match self.slots.binder().bindings(device) {
                        Ok(bindings) => bindings,
                        Err(err) => {
                            warn!("keyserver bindings of {device} unavailable: {err}");
                            attempts.push(Attempt {
                                strategy,
                                outcome: AttemptOutcome::Unavailable,
                                detail: Some(err.to_string()),
                            });
                            continue;
                        }
                    };
                    for binding in bindings {
                        let key = match self.slots.binder().recover_key(device, binding.slot) {
                            Ok(key) => Zeroizing::new(key),
                            Err(err) => {
                                warn!(
                                    "keyserver {} unavailable for {device} slot {}: {err}",
                                    binding.url, binding.slot
                                );
                                attempts.push(Attempt {
                                    strategy,
                                    outcome: AttemptOutcome::Unavailable,
                                    detail: Some(err.to_string()),
                                });
                                continue;
                            }
                        };
                        if self.attempt(device, mapping, strategy, &key, attempts)? {
                            return Ok(Some((strategy, Some(binding.slot))));
                        }
                    }
                }
                KeyStrategy::StoredPassphrase => match self.vault.read(uuid) {
                    Ok(Some(key)) => {
                        if self.attempt(device, mapping, strategy, &key, attempts)? {
                            return Ok(Some((strategy, None)));
                        }
                    }
                    Ok(None) => attempts.push(Attempt {
                        strategy,
                        outcome: AttemptOutcome::Unavailable,
                        detail: None,
                    }),
                    Err(err) => {
                        warn!("stored passphrase for {device} unreadable: {err}");
                        attempts.push(Attempt {
                            strategy,
                            outcome: AttemptOutcome::Unavailable,
                            detail: Some(err.to_string()),
                        });
                    }
                },
                KeyStrategy::SuppliedKey => {
                    if let Some(key) = request.supplied_key {
                        if self.attempt(device, mapping, strategy, key, attempts)? {
                            return Ok(Some((strategy, None)));
                        }
                    }
                }
                KeyStrategy::Prompt => {
                    if let Some(prompt) = request.prompt {
                        for round in 1..=self.policy.max_prompts {
                            let Some(key) = prompt.prompt(device, round)? else {
                                attempts.push(Attempt {
                                    strategy,
                                    outcome: AttemptOutcome::Unavailable,
                                    detail: Some("prompt cancelled".into()),
                                });
                                break;
                            };
                            if self.attempt(device, mapping, strategy, &key, attempts)? {
                                return Ok(Some((strategy, None)));
                            }
                        }
                    }
                }
            }
        }
        Ok(None)
    }

    /// Try `key`; `Ok(false)` means it was rejected.
    fn attempt(
        &self,
        device: &str,
        mapping: &str,
        strategy: KeyStrategy,
        key: &[u8],
        attempts: &mut Vec<Attempt>,
    ) -> KeywardResult<bool> {
        match self.slots.backend().open(device, mapping, key) {
            Ok(()) => {
                attempts.push(Attempt {
                    strategy,
                    outcome: AttemptOutcome::Unlocked,
                    detail: None,
                });
                Ok(true)
            }
            Err(KeywardError::AuthFailed { .. }) => {
                debug!("{strategy} rejected by {device}");
                *lock(&self.attempts).entry(device.to_string()).or_insert(0) += 1;
                attempts.push(Attempt {
                    strategy,
                    outcome: AttemptOutcome::AuthFailed,
                    detail: None,
                });
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Close the cleartext mapping and mark the device's entries `noauto`.
    pub fn lock(&self, lease: &DeviceLease) -> KeywardResult<()> {
        let device = lease.device();
        let mapping = match self.state(device)? {
            DeviceState::Unlocked { mapping } => mapping,
            other => {
                return Err(KeywardError::InvalidState {
                    device: device.to_string(),
                    state: other.label().to_string(),
                    action: "lock",
                })
            }
        };
        self.slots.backend().close(&mapping)?;
        self.set_state(device, DeviceState::Locked);
        info!("locked {device} ({mapping})");
        self.persist_activation(device, false)?;
        Ok(())
    }

    pub fn add_key(
        &self,
        lease: &DeviceLease,
        new_key: &[u8],
        auth_key: &[u8],
    ) -> KeywardResult<KeySlot> {
        let slot = self.slots.add_slot(lease, new_key, auth_key)?;
        self.refresh_readiness(lease.device())?;
        Ok(slot)
    }

    pub fn add_keyserver(
        &self,
        lease: &DeviceLease,
        url: &str,
        thumbprint: Option<&str>,
        auth_key: &[u8],
    ) -> KeywardResult<KeySlot> {
        let slot = self
            .slots
            .add_keyserver_slot(lease, url, thumbprint, auth_key)?;
        self.refresh_readiness(lease.device())?;
        Ok(slot)
    }

    /// Remove a slot. A stored passphrase that no longer opens any slot is
    /// cleared so boot falls back to the prompt.
    pub fn remove_key(
        &self,
        lease: &DeviceLease,
        index: u32,
        removal: Removal<'_>,
    ) -> KeywardResult<RemovalOutcome> {
        let device = lease.device();
        let outcome = self.slots.remove_slot(lease, index, removal)?;
        if outcome.remaining > 0 {
            let uuid = self.slots.backend().uuid(device)?;
            if let Some(stored) = self.vault.read(&uuid)? {
                if self.slots.verify_key(device, &stored)?.is_none() {
                    info!("stored passphrase for {device} no longer opens a keyslot; clearing it");
                    self.vault.clear(&uuid, device, &self.tables)?;
                }
            }
        }
        self.refresh_readiness(device)?;
        Ok(outcome)
    }

    /// Change the passphrase in `index`, keeping a matching stored passphrase
    /// in sync.
    pub fn change_key(
        &self,
        lease: &DeviceLease,
        index: u32,
        old_key: &[u8],
        new_key: &[u8],
    ) -> KeywardResult<EditOutcome> {
        let device = lease.device();
        let outcome = self.slots.edit_slot(lease, index, old_key, new_key)?;
        let uuid = self.slots.backend().uuid(device)?;
        if let Some(stored) = self.vault.read(&uuid)? {
            if stored.as_slice() == old_key {
                self.vault.rotate(&uuid, new_key)?;
            }
        }
        self.refresh_readiness(device)?;
        Ok(outcome)
    }

    /// Store `passphrase` for unattended unlock and point crypttab at it.
    pub fn store_passphrase(
        &self,
        lease: &DeviceLease,
        passphrase: &[u8],
    ) -> KeywardResult<StoredPassphraseInfo> {
        let desired = DesiredState {
            stored: StoredChoice::Store(passphrase),
            ..self.current_desired(lease.device())?
        };
        let plan = self.plan(lease, &desired)?;
        self.execute(lease, plan)?;
        let uuid = self.slots.backend().uuid(lease.device())?;
        self.vault.info(&uuid)?.ok_or_else(|| {
            KeywardError::MissingKey(format!("stored passphrase for {uuid} vanished"))
        })
    }

    /// Change the passphrase held in the vault together with the slot it opens.
    pub fn change_stored_passphrase(
        &self,
        lease: &DeviceLease,
        new_passphrase: &[u8],
    ) -> KeywardResult<EditOutcome> {
        let device = lease.device();
        let uuid = self.slots.backend().uuid(device)?;
        let stored = self.vault.read(&uuid)?.ok_or_else(|| {
            KeywardError::MissingKey(format!("no stored passphrase for {device}"))
        })?;
        let index = self
            .slots
            .verify_key(device, &stored)?
            .ok_or_else(|| KeywardError::AuthFailed {
                device: device.to_string(),
            })?;
        let outcome = self.slots.edit_slot(lease, index, &stored, new_passphrase)?;
        if let Err(err) = self.vault.rotate(&uuid, new_passphrase) {
            warn!("{device}: keyslot {index} changed but the stored passphrase was not updated: {err}");
            return Err(err);
        }
        Ok(outcome)
    }

    /// Delete the stored passphrase; crypttab falls back to prompting.
    pub fn clear_stored_passphrase(&self, lease: &DeviceLease) -> KeywardResult<bool> {
        let uuid = self.slots.backend().uuid(lease.device())?;
        self.vault.clear(&uuid, lease.device(), &self.tables)
    }

    /// Re-derive `_netdev` on existing entries after the slot set changed.
    fn refresh_readiness(&self, device: &str) -> KeywardResult<()> {
        let located = self.locate(device)?;
        let slots = self.slots.list_slots(device)?;
        let mut diff = located.snapshot.diff();
        if let Some(mut crypt) = located.crypt {
            let refreshed = readiness::refresh_network_flag(&slots, &crypt.options);
            if refreshed != crypt.options {
                crypt.options = refreshed;
                diff.upsert_crypt(crypt);
            }
        }
        if let Some(mut mount) = located.mount {
            let refreshed = readiness::refresh_network_flag(&slots, &mount.options);
            if refreshed != mount.options {
                mount.options = refreshed;
                diff.upsert_mount(mount);
            }
        }
        if !diff.is_empty() {
            self.tables.apply(&diff)?;
            debug!("refreshed readiness flags for {device}");
        }
        Ok(())
    }

    /// Set or clear `noauto` on the device's entries. Returns whether anything changed.
    fn persist_activation(&self, device: &str, auto: bool) -> KeywardResult<bool> {
        let located = self.locate(device)?;
        let mut diff = located.snapshot.diff();
        if let Some(mut crypt) = located.crypt {
            if crypt.options.set(NOAUTO, !auto) {
                diff.upsert_crypt(crypt);
            }
        }
        if let Some(mut mount) = located.mount {
            if mount.options.set(NOAUTO, !auto) {
                diff.upsert_mount(mount);
            }
        }
        if diff.is_empty() {
            return Ok(false);
        }
        self.tables.apply(&diff)?;
        Ok(true)
    }

    pub(crate) fn locate(&self, device: &str) -> KeywardResult<Located> {
        let uuid = self.slots.backend().uuid(device)?;
        let snapshot = self.tables.load()?;
        let crypt = snapshot
            .crypt_for_device(&uuid_ref(&uuid))
            .or_else(|| snapshot.crypt_for_device(device))
            .cloned();
        let mapping = crypt
            .as_ref()
            .map(|entry| entry.name.clone())
            .unwrap_or_else(|| default_mapping(&uuid));
        let mount = snapshot.mount_for_source(&mapper_path(&mapping)).cloned();
        Ok(Located {
            uuid,
            snapshot,
            crypt,
            mapping,
            mount,
        })
    }

    pub(crate) fn set_state(&self, device: &str, state: DeviceState) {
        debug!("{device} -> {}", state.label());
        lock(&self.states).insert(device.to_string(), state);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
