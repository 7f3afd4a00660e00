//! Filesystem creation and LUKS re-initialisation.

use super::{default_mapping, lock, mapper_path, DeviceState, Located, UnlockPlanner};
use super::reconcile::{DesiredState, MountSpec, StoredChoice};
use crate::audit::{self, AuditAction, AuditEntry};
use crate::error::{KeywardError, KeywardResult};
use crate::lease::DeviceLease;
use crate::tables::KeySource;
use crate::vault::StoredPassphraseInfo;
use keyward_provider::{FilesystemMaker, KeySlot, KeyserverBinder, LuksBackend, LuksVersion};
use log::{info, warn};
use serde::Serialize;

/// Keyserver to bind right after a fresh header is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyserverSpec {
    pub url: String,
    /// Signing-key thumbprint the advertisement must match.
    pub thumbprint: Option<String>,
}

/// Parameters of [`UnlockPlanner::format`].
pub struct FormatRequest<'a> {
    /// Filesystem type handed to mkfs, e.g. `ext4`.
    pub fstype: String,
    /// Filesystem label.
    pub label: Option<String>,
    /// Mapping name; defaults to the current crypttab name or `luks-<uuid>`.
    pub name: Option<String>,
    /// Mount entry to write; defaults to the current one with the new fstype.
    pub mount: Option<MountSpec>,
    /// Leave `noauto` off so the device unlocks at boot.
    pub auto_unlock: bool,
    /// Header version for a fresh header; the configured default otherwise.
    pub version: Option<LuksVersion>,
    /// Keep the header, its slots and the stored passphrase; only recreate
    /// the filesystem.
    pub keep_keys: bool,
    /// Needed with `keep_keys` when the device is locked.
    pub old_passphrase: Option<&'a [u8]>,
    /// Needed without `keep_keys`.
    pub new_passphrase: Option<&'a [u8]>,
    /// Store the new passphrase in the vault for unattended unlock.
    pub store_passphrase: bool,
    /// Keyserver to bind right after a fresh header is written.
    pub keyserver: Option<KeyserverSpec>,
}

impl FormatRequest<'_> {
    pub fn new(fstype: impl Into<String>) -> Self {
        Self {
            fstype: fstype.into(),
            label: None,
            name: None,
            mount: None,
            auto_unlock: true,
            version: None,
            keep_keys: false,
            old_passphrase: None,
            new_passphrase: None,
            store_passphrase: false,
            keyserver: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FormatReport {
    pub device: String,
    pub uuid: String,
    pub mapping: String,
    /// A new header was written.
    pub reinitialised: bool,
    pub slots: Vec<KeySlot>,
    pub stored_passphrase: Option<StoredPassphraseInfo>,
    pub warnings: Vec<String>,
}

impl<B, K, F> UnlockPlanner<B, K, F>
where
    B: LuksBackend<Error = KeywardError>,
    K: KeyserverBinder<Error = KeywardError>,
    F: FilesystemMaker<Error = KeywardError>,
{
    /// Create a filesystem on the device, optionally re-initialising its header.
    ///
    /// Errors before the header or filesystem is touched restore the previous
    /// state (an open mapping is closed first, so `Unlocked` becomes `Locked`);
    /// errors afterwards leave the device `Failed`.
    pub fn format(
        &self,
        lease: &DeviceLease,
        request: &FormatRequest<'_>,
    ) -> KeywardResult<FormatReport> {
        let device = lease.device();
        let is_luks = self.slots.backend().is_luks(device)?;
        let (located, previous) = if is_luks {
            (Some(self.locate(device)?), self.state(device)?)
        } else {
            (None, DeviceState::Locked)
        };
        if matches!(previous, DeviceState::Unlocking | DeviceState::Formatting) {
            return Err(KeywardError::InvalidState {
                device: device.to_string(),
                state: previous.label().to_string(),
                action: "format",
            });
        }

        self.set_state(device, DeviceState::Formatting);
        if request.keep_keys {
            self.format_keep_keys(lease, located, previous, request)
        } else {
            self.format_fresh(lease, located, previous, request)
        }
    }

    fn format_keep_keys(
        &self,
        lease: &DeviceLease,
        located: Option<Located>,
        previous: DeviceState,
        request: &FormatRequest<'_>,
    ) -> KeywardResult<FormatReport> {
        let device = lease.device();
        let Some(located) = located else {
            self.set_state(device, previous);
            return Err(KeywardError::InvalidState {
                device: device.to_string(),
                state: "not a LUKS volume".into(),
                action: "keep its keys",
            });
        };

        let mapping = match &previous {
            DeviceState::Unlocked { mapping } => mapping.clone(),
            _ => {
                let mapping = request
                    .name
                    .clone()
                    .unwrap_or_else(|| located.mapping.clone());
                let Some(old) = request.old_passphrase else {
                    self.set_state(device, previous);
                    return Err(KeywardError::MissingKey(format!(
                        "{device} is locked; the current passphrase is required to keep its keys"
                    )));
                };
                if let Err(err) = self.slots.backend().open(device, &mapping, old) {
                    self.set_state(device, previous);
                    return Err(err);
                }
                mapping
            }
        };

        let outcome = self
            .mkfs
            .make_filesystem(&mapper_path(&mapping), &request.fstype, request.label.as_deref())
            .and_then(|()| {
                let desired = self.desired_after_format(request, &located, &mapping, StoredChoice::Keep);
                let plan = self.build_plan(device, &located, &desired)?;
                self.execute(lease, plan)
            });
        let warnings = self.settle_format(device, &mapping, outcome)?;
        info!("recreated {} filesystem on {device} keeping its keys", request.fstype);
        self.format_report(device, located.uuid, mapping, false, warnings)
    }

    fn format_fresh(
        &self,
        lease: &DeviceLease,
        located: Option<Located>,
        previous: DeviceState,
        request: &FormatRequest<'_>,
    ) -> KeywardResult<FormatReport> {
        let device = lease.device();
        let Some(new_key) = request.new_passphrase.filter(|key| !key.is_empty()) else {
            self.set_state(device, previous);
            return Err(KeywardError::MissingKey(format!(
                "a new passphrase is required to initialise {device}"
            )));
        };
        if let DeviceState::Unlocked { mapping } = &previous {
            if let Err(err) = self.slots.backend().close(mapping) {
                self.set_state(device, previous);
                return Err(err);
            }
        }

        let version = request.version.unwrap_or(self.policy.default_version);
        let old_uuid = located.as_ref().map(|located| located.uuid.clone());
        audit::record(
            &AuditEntry::new(device, AuditAction::Reformat)
                .note(format!("new {version} header; previous uuid {}", old_uuid.as_deref().unwrap_or("none"))),
        );
        if let Err(err) = self.slots.backend().format(device, version, new_key) {
            if self.header_untouched(device, old_uuid.as_deref()) {
                warn!("format of {device} failed before its header changed: {err}");
                self.set_state(device, DeviceState::Locked);
            } else {
                self.mark_failed(device, &err);
            }
            return Err(err);
        }

        let mut warnings = Vec::new();
        let finished = self.finish_fresh(lease, located, request, new_key, &mut warnings);
        let (uuid, mapping) = match finished {
            Ok(done) => done,
            Err(err) => {
                self.mark_failed(device, &err);
                return Err(err);
            }
        };

        if let Some(old_uuid) = old_uuid.filter(|old| *old != uuid) {
            match self.vault.remove_file(&old_uuid) {
                Ok(true) => info!("removed stored passphrase of replaced header {old_uuid}"),
                Ok(false) => {}
                Err(err) => warnings.push(format!("stale stored passphrase for {old_uuid} not removed: {err}")),
            }
        }

        self.set_state(
            device,
            DeviceState::Unlocked {
                mapping: mapping.clone(),
            },
        );
        lock(&self.attempts).remove(device);
        info!("initialised {version} header and {} filesystem on {device}", request.fstype);
        self.format_report(device, uuid, mapping, true, warnings)
    }

    fn finish_fresh(
        &self,
        lease: &DeviceLease,
        located: Option<Located>,
        request: &FormatRequest<'_>,
        new_key: &[u8],
        warnings: &mut Vec<String>,
    ) -> KeywardResult<(String, String)> {
        let device = lease.device();
        let uuid = self.slots.backend().uuid(device)?;
        let mut target = match located {
            Some(mut located) => {
                located.uuid = uuid.clone();
                if located.crypt.is_none() {
                    located.mapping = default_mapping(&uuid);
                }
                // Old stored passphrases belong to the destroyed header.
                if let Some(crypt) = located.crypt.as_mut() {
                    if crypt.key.file().is_some_and(|path| self.vault.owns(path)) {
                        crypt.key = KeySource::Prompt;
                    }
                }
                located
            }
            None => self.locate(device)?,
        };
        let mapping = request
            .name
            .clone()
            .unwrap_or_else(|| target.mapping.clone());
        target.mapping = mapping.clone();

        self.slots.backend().open(device, &mapping, new_key)?;
        self.mkfs
            .make_filesystem(&mapper_path(&mapping), &request.fstype, request.label.as_deref())?;

        if let Some(keyserver) = &request.keyserver {
            let bound = self.slots.add_keyserver_slot(
                lease,
                &keyserver.url,
                keyserver.thumbprint.as_deref(),
                new_key,
            );
            if let Err(err) = bound {
                warn!("{device}: keyserver binding to {} failed: {err}", keyserver.url);
                warnings.push(format!("keyserver {} not bound: {err}", keyserver.url));
            }
        }

        let stored = if request.store_passphrase {
            StoredChoice::Store(new_key)
        } else {
            StoredChoice::Keep
        };
        let desired = self.desired_after_format(request, &target, &mapping, stored);
        let plan = self.build_plan(device, &target, &desired)?;
        self.execute(lease, plan)?;
        Ok((uuid, mapping))
    }

    fn desired_after_format<'a>(
        &self,
        request: &FormatRequest<'_>,
        located: &Located,
        mapping: &str,
        stored: StoredChoice<'a>,
    ) -> DesiredState<'a> {
        let mount = request
            .mount
            .clone()
            .or_else(|| located.mount.as_ref().map(MountSpec::from_entry))
            .map(|mut spec| {
                spec.fstype = request.fstype.clone();
                spec
            });
        DesiredState {
            name: Some(mapping.to_string()),
            auto_unlock: request.auto_unlock,
            stored,
            mount,
        }
    }

    /// Map the outcome of the post-mkfs steps onto the device state.
    fn settle_format<T>(
        &self,
        device: &str,
        mapping: &str,
        outcome: KeywardResult<T>,
    ) -> KeywardResult<Vec<String>> {
        match outcome {
            Ok(_) => {
                self.set_state(
                    device,
                    DeviceState::Unlocked {
                        mapping: mapping.to_string(),
                    },
                );
                Ok(Vec::new())
            }
            Err(err) => {
                self.mark_failed(device, &err);
                Err(err)
            }
        }
    }

    /// Whether the header still matches what it was before a failed format:
    /// the same UUID, or still no LUKS header at all.
    fn header_untouched(&self, device: &str, old_uuid: Option<&str>) -> bool {
        let backend = self.slots.backend();
        match old_uuid {
            Some(old) => backend.uuid(device).is_ok_and(|uuid| uuid == old),
            None => matches!(backend.is_luks(device), Ok(false)),
        }
    }

    fn mark_failed(&self, device: &str, err: &KeywardError) {
        warn!("format of {device} failed: {err}");
        self.set_state(
            device,
            DeviceState::Failed {
                reason: err.to_string(),
            },
        );
    }

    fn format_report(
        &self,
        device: &str,
        uuid: String,
        mapping: String,
        reinitialised: bool,
        warnings: Vec<String>,
    ) -> KeywardResult<FormatReport> {
        Ok(FormatReport {
            device: device.to_string(),
            slots: self.slots.list_slots(device)?,
            stored_passphrase: self.vault.info(&uuid)?,
            uuid,
            mapping,
            reinitialised,
            warnings,
        })
    }
}
