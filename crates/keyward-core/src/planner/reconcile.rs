//! Desired-state reconciliation: compute the minimal vault and table changes
//! for one device, then apply them in dependency order.

use super::{mapper_path, uuid_ref, Located, UnlockPlanner};
use crate::config::looks_like_mapping_name;
use crate::error::{KeywardError, KeywardResult};
use crate::lease::DeviceLease;
use crate::readiness::{self, MountIntent, NOAUTO, NOFAIL, READ_ONLY};
use crate::tables::{normalize_uuid, CryptEntry, KeySource, MountEntry, Options, TableDiff};
use keyward_provider::{FilesystemMaker, KeySlot, KeyserverBinder, LuksBackend};
use log::{info, warn};
use serde::Serialize;
use std::fmt;
use zeroize::Zeroizing;

/// What to do with the stored passphrase.
#[derive(Clone, Copy, Default)]
pub enum StoredChoice<'a> {
    #[default]
    Keep,
    Store(&'a [u8]),
    Clear,
}

impl fmt::Debug for StoredChoice<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoredChoice::Keep => f.write_str("Keep"),
            StoredChoice::Store(_) => f.write_str("Store(<redacted>)"),
            StoredChoice::Clear => f.write_str("Clear"),
        }
    }
}

/// Filesystem the device should be mounted as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub mount_point: String,
    pub fstype: String,
    /// Operator options; readiness flags are merged on top.
    pub options: Options,
    pub read_only: bool,
    pub boot_critical: bool,
}

impl MountSpec {
    pub fn new(mount_point: impl Into<String>, fstype: impl Into<String>) -> Self {
        Self {
            mount_point: mount_point.into(),
            fstype: fstype.into(),
            options: Options::default(),
            read_only: false,
            boot_critical: false,
        }
    }

    pub(crate) fn from_entry(entry: &MountEntry) -> Self {
        let mut options = entry.options.clone();
        options.remove(NOAUTO);
        options.remove(readiness::NETDEV);
        options.remove(NOFAIL);
        options.remove(READ_ONLY);
        Self {
            mount_point: entry.mount_point.clone(),
            fstype: entry.fstype.clone(),
            options,
            read_only: entry.options.contains(READ_ONLY),
            boot_critical: !entry.options.contains(NOFAIL),
        }
    }
}

/// Target configuration for one device.
#[derive(Debug, Clone)]
pub struct DesiredState<'a> {
    /// Mapping name; defaults to the current crypttab name or `luks-<uuid>`.
    pub name: Option<String>,
    pub auto_unlock: bool,
    pub stored: StoredChoice<'a>,
    pub mount: Option<MountSpec>,
}

impl Default for DesiredState<'_> {
    fn default() -> Self {
        Self {
            name: None,
            auto_unlock: true,
            stored: StoredChoice::Keep,
            mount: None,
        }
    }
}

/// One ordered action of a [`Plan`].
pub enum PlanStep {
    StorePassphrase {
        uuid: String,
        passphrase: Zeroizing<Vec<u8>>,
    },
    ClearPassphrase {
        uuid: String,
    },
    UpdateTables(TableDiff),
}

impl PlanStep {
    pub fn describe(&self) -> String {
        match self {
            PlanStep::StorePassphrase { uuid, .. } => format!("store passphrase for {uuid}"),
            PlanStep::ClearPassphrase { uuid } => format!("clear stored passphrase for {uuid}"),
            PlanStep::UpdateTables(diff) => format!(
                "update tables ({} crypttab, {} fstab change(s))",
                diff.crypt.len(),
                diff.mount.len()
            ),
        }
    }
}

impl fmt::Debug for PlanStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

/// Ordered vault and table changes that bring a device to a [`DesiredState`].
#[derive(Debug)]
pub struct Plan {
    device: String,
    steps: Vec<PlanStep>,
}

impl Plan {
    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn describe(&self) -> Vec<String> {
        self.steps.iter().map(PlanStep::describe).collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecuteReport {
    pub device: String,
    pub steps: Vec<String>,
    /// Table generation after the rewrite, if tables changed.
    pub generation: Option<u64>,
}

type VaultUndo = (String, Option<Zeroizing<Vec<u8>>>);

impl<B, K, F> UnlockPlanner<B, K, F>
where
    B: LuksBackend<Error = KeywardError>,
    K: KeyserverBinder<Error = KeywardError>,
    F: FilesystemMaker<Error = KeywardError>,
{
    /// The device's current configuration expressed as a desired state.
    pub fn current_desired(&self, device: &str) -> KeywardResult<DesiredState<'static>> {
        let located = self.locate(device)?;
        Ok(DesiredState {
            auto_unlock: !located
                .crypt
                .as_ref()
                .is_some_and(|entry| entry.options.contains(NOAUTO)),
            name: located.crypt.map(|entry| entry.name),
            stored: StoredChoice::Keep,
            mount: located.mount.as_ref().map(MountSpec::from_entry),
        })
    }

    /// Compute the steps that bring `lease.device()` to `desired`.
    /// A converged device yields an empty plan.
    pub fn plan(&self, lease: &DeviceLease, desired: &DesiredState<'_>) -> KeywardResult<Plan> {
        let located = self.locate(lease.device())?;
        self.build_plan(lease.device(), &located, desired)
    }

    pub(crate) fn build_plan(
        &self,
        device: &str,
        located: &Located,
        desired: &DesiredState<'_>,
    ) -> KeywardResult<Plan> {
        let slots = self.slots.list_slots(device)?;

        let mut steps = Vec::new();
        let mut cleanup = Vec::new();
        let key = self.plan_vault(device, located, desired.stored, &mut steps, &mut cleanup)?;

        let name = desired
            .name
            .clone()
            .unwrap_or_else(|| located.mapping.clone());
        if !looks_like_mapping_name(&name) {
            return Err(KeywardError::InvalidConfig(format!(
                "`{name}` is not a valid mapping name"
            )));
        }
        if let Some(other) = located.snapshot.crypt_by_name(&name) {
            if located.crypt.as_ref().map(|entry| &entry.device) != Some(&other.device) {
                return Err(KeywardError::InvalidConfig(format!(
                    "mapping `{name}` is already used by {}",
                    other.device
                )));
            }
        }

        let diff = self.plan_tables(located, &slots, desired, name, key)?;
        if !diff.is_empty() {
            steps.push(PlanStep::UpdateTables(diff));
        }
        // crypttab stops referencing a key file before the file goes away.
        steps.append(&mut cleanup);

        Ok(Plan {
            device: device.to_string(),
            steps,
        })
    }

    /// Apply `plan`. Key files are written before the tables that reference
    /// them and deleted after; if a step fails the vault changes are undone.
    pub fn execute(&self, lease: &DeviceLease, plan: Plan) -> KeywardResult<ExecuteReport> {
        if plan.device != lease.device() {
            return Err(KeywardError::InvalidConfig(format!(
                "plan for {} cannot run under the lease for {}",
                plan.device,
                lease.device()
            )));
        }

        let mut undo: Vec<VaultUndo> = Vec::new();
        let mut generation = None;
        let mut done = Vec::new();
        for step in &plan.steps {
            if let Err(err) = self.run_step(step, &mut undo, &mut generation) {
                warn!("{}: {} failed: {err}", plan.device, step.describe());
                self.undo_vault(undo);
                return Err(err);
            }
            done.push(step.describe());
        }
        if !done.is_empty() {
            info!("reconciled {} ({} step(s))", plan.device, done.len());
        }

        Ok(ExecuteReport {
            device: plan.device,
            steps: done,
            generation,
        })
    }

    fn plan_vault(
        &self,
        device: &str,
        located: &Located,
        stored: StoredChoice<'_>,
        steps: &mut Vec<PlanStep>,
        cleanup: &mut Vec<PlanStep>,
    ) -> KeywardResult<KeySource> {
        let uuid = &located.uuid;
        let existing = self.vault.read(uuid)?;
        let stored_path = self.vault.path_for(uuid);
        let current_key = located.crypt.as_ref().map(|entry| entry.key.clone());

        let key = match stored {
            StoredChoice::Keep => current_key.unwrap_or(if existing.is_some() {
                KeySource::File(stored_path)
            } else {
                KeySource::Prompt
            }),
            StoredChoice::Store(passphrase) => {
                if passphrase.is_empty() {
                    return Err(KeywardError::MissingKey(
                        "refusing to store an empty passphrase".into(),
                    ));
                }
                if self.slots.verify_key(device, passphrase)?.is_none() {
                    return Err(KeywardError::AuthFailed {
                        device: device.to_string(),
                    });
                }
                if existing.as_deref().map(Vec::as_slice) != Some(passphrase) {
                    steps.push(PlanStep::StorePassphrase {
                        uuid: uuid.clone(),
                        passphrase: Zeroizing::new(passphrase.to_vec()),
                    });
                }
                KeySource::File(stored_path)
            }
            StoredChoice::Clear => {
                if existing.is_some() {
                    cleanup.push(PlanStep::ClearPassphrase { uuid: uuid.clone() });
                }
                match current_key {
                    Some(KeySource::File(path)) if !self.vault.owns(&path) => KeySource::File(path),
                    _ => KeySource::Prompt,
                }
            }
        };
        Ok(key)
    }

    fn plan_tables(
        &self,
        located: &Located,
        slots: &[KeySlot],
        desired: &DesiredState<'_>,
        name: String,
        key: KeySource,
    ) -> KeywardResult<TableDiff> {
        let spec = desired
            .mount
            .clone()
            .or_else(|| located.mount.as_ref().map(MountSpec::from_entry));
        let intent = MountIntent {
            auto: desired.auto_unlock,
            read_only: spec.as_ref().is_some_and(|spec| spec.read_only),
            boot_critical: spec.as_ref().is_some_and(|spec| spec.boot_critical),
        };
        let resolved = readiness::resolve(slots, &intent, self.policy.nofail_secondary);

        let mut diff = located.snapshot.diff();
        let base = located
            .crypt
            .clone()
            .unwrap_or_else(|| CryptEntry::new(name.clone(), uuid_ref(&located.uuid)));
        // A re-initialised header has a new UUID; the entry follows it.
        let current_ref = uuid_ref(&located.uuid);
        let device = if normalize_uuid(&base.device).is_some() && !base.refers_to(&current_ref) {
            current_ref
        } else {
            base.device
        };
        let crypt = CryptEntry {
            options: resolved.apply_to_crypt(&base.options),
            name,
            key,
            device,
        };
        if let Some(old) = &located.crypt {
            if !old.refers_to(&crypt.device) {
                diff.remove_crypt(old.device.clone());
            }
        }
        if located.crypt.as_ref() != Some(&crypt) {
            diff.upsert_crypt(crypt.clone());
        }

        let Some(spec) = spec else {
            return Ok(diff);
        };
        let source = mapper_path(&crypt.name);
        let current = located.snapshot.mount_for_point(&spec.mount_point);
        if let Some(other) = current {
            if other.source != source && located.mount.as_ref() != Some(other) {
                return Err(KeywardError::InvalidConfig(format!(
                    "mount point {} is already used by {}",
                    spec.mount_point, other.source
                )));
            }
        }
        let mut entry = current.cloned().unwrap_or_else(|| {
            let mut fresh = MountEntry::new(source.clone(), spec.mount_point.clone(), spec.fstype.clone());
            fresh.pass = if spec.mount_point == "/" { 1 } else { 2 };
            fresh
        });
        // Without explicit options the current flag order is preserved.
        let base_options = match (&desired.mount, current) {
            (None, Some(existing)) => existing.options.clone(),
            _ => spec.options.clone(),
        };
        entry.source = source;
        entry.fstype = spec.fstype.clone();
        entry.options = resolved.apply_to_mount(&base_options);
        if current != Some(&entry) {
            diff.upsert_mount(entry);
        }
        if let Some(old) = &located.mount {
            if old.mount_point != spec.mount_point {
                diff.remove_mount(old.mount_point.clone());
            }
        }
        Ok(diff)
    }

    fn run_step(
        &self,
        step: &PlanStep,
        undo: &mut Vec<VaultUndo>,
        generation: &mut Option<u64>,
    ) -> KeywardResult<()> {
        match step {
            PlanStep::StorePassphrase { uuid, passphrase } => {
                let previous = self.vault.read(uuid)?;
                self.vault.store(uuid, passphrase)?;
                undo.push((uuid.clone(), previous));
            }
            PlanStep::ClearPassphrase { uuid } => {
                let previous = self.vault.read(uuid)?;
                self.vault.remove_file(uuid)?;
                undo.push((uuid.clone(), previous));
            }
            PlanStep::UpdateTables(diff) => {
                *generation = Some(self.tables.apply(diff)?);
            }
        }
        Ok(())
    }

    fn undo_vault(&self, undo: Vec<VaultUndo>) {
        for (uuid, previous) in undo.into_iter().rev() {
            let restored = match previous {
                Some(bytes) => self.vault.store(&uuid, &bytes).map(|_| ()),
                None => self.vault.remove_file(&uuid).map(|_| ()),
            };
            if let Err(err) = restored {
                warn!("failed to roll back stored passphrase for {uuid}: {err}");
            }
        }
    }
}

