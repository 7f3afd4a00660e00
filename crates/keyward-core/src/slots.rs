//! Keyslot enumeration and mutation.
//!
//! [`KeySlotManager`] guards the LUKS header against the two ways an operator
//! can lock themselves out: removing the last unlock method and replacing a
//! key without a working fallback. Every mutation requires the device lease.

use crate::audit::{self, AuditAction, AuditEntry};
use crate::error::{KeywardError, KeywardResult};
use crate::lease::DeviceLease;
use keyward_provider::{KeySlot, KeyserverBinder, LuksBackend, LuksVersion, SlotKind};
use log::{info, warn};
use serde::Serialize;

/// How a slot removal is authorised.
#[derive(Debug, Clone, Copy)]
pub enum Removal<'a> {
    /// A passphrase slot needs its own key; a keyserver slot a key that opens
    /// another slot.
    Key(&'a [u8]),
    /// Skip authorisation and last-slot protection. Always audited.
    Force,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemovalOutcome {
    pub removed: KeySlot,
    /// Populated slots left on the device.
    pub remaining: usize,
    /// How many of those are keyserver-bound; zero drops `_netdev`.
    pub remaining_keyserver: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EditOutcome {
    /// Slot that now holds the new key.
    pub slot: u32,
    /// The key could not be moved back to its original index.
    pub relocated: bool,
    pub warnings: Vec<String>,
}

pub struct KeySlotManager<B, K> {
    backend: B,
    binder: K,
}

impl<B, K> KeySlotManager<B, K>
where
    B: LuksBackend<Error = KeywardError>,
    K: KeyserverBinder<Error = KeywardError>,
{
    pub fn new(backend: B, binder: K) -> Self {
        Self { backend, binder }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn binder(&self) -> &K {
        &self.binder
    }

    pub fn version(&self, device: &str) -> KeywardResult<LuksVersion> {
        self.backend.version(device)
    }

    /// Populated slots in ascending order. Slots reported by the binder are
    /// keyserver slots, everything else is a passphrase slot.
    pub fn list_slots(&self, device: &str) -> KeywardResult<Vec<KeySlot>> {
        let bindings = self.binder.bindings(device)?;
        let mut slots: Vec<KeySlot> = self
            .backend
            .active_slots(device)?
            .into_iter()
            .map(|index| {
                match bindings.iter().find(|binding| binding.slot == index) {
                    Some(binding) => KeySlot {
                        index,
                        kind: SlotKind::Keyserver {
                            url: binding.url.clone(),
                            thumbprint: binding.thumbprint.clone(),
                        },
                    },
                    None => KeySlot::passphrase(index),
                }
            })
            .collect();
        slots.sort_by_key(|slot| slot.index);
        Ok(slots)
    }

    /// Slot opened by `key`, if any.
    pub fn verify_key(&self, device: &str, key: &[u8]) -> KeywardResult<Option<u32>> {
        self.backend.test_key(device, key)
    }

    pub fn add_slot(
        &self,
        lease: &DeviceLease,
        new_key: &[u8],
        auth_key: &[u8],
    ) -> KeywardResult<KeySlot> {
        let device = lease.device();
        if new_key.is_empty() {
            return Err(KeywardError::MissingKey("new passphrase is empty".into()));
        }
        self.ensure_capacity(device)?;
        self.require_auth(device, auth_key)?;

        let index = self.backend.add_key(device, auth_key, new_key, None)?;
        info!("added passphrase keyslot {index} to {device}");
        Ok(KeySlot::passphrase(index))
    }

    pub fn add_keyserver_slot(
        &self,
        lease: &DeviceLease,
        url: &str,
        thumbprint: Option<&str>,
        auth_key: &[u8],
    ) -> KeywardResult<KeySlot> {
        let device = lease.device();
        self.ensure_capacity(device)?;
        self.require_auth(device, auth_key)?;

        let binding = self.binder.bind(device, url, thumbprint, auth_key)?;
        info!(
            "bound keyslot {} of {device} to keyserver {url}",
            binding.slot
        );
        Ok(KeySlot {
            index: binding.slot,
            kind: SlotKind::Keyserver {
                url: binding.url,
                thumbprint: binding.thumbprint,
            },
        })
    }

    pub fn remove_slot(
        &self,
        lease: &DeviceLease,
        index: u32,
        removal: Removal<'_>,
    ) -> KeywardResult<RemovalOutcome> {
        let device = lease.device();
        let slots = self.list_slots(device)?;
        let target = slots
            .iter()
            .find(|slot| slot.index == index)
            .cloned()
            .ok_or_else(|| KeywardError::SlotNotFound {
                device: device.to_string(),
                slot: index,
            })?;

        match removal {
            Removal::Key(key) => {
                if slots.len() == 1 {
                    return Err(KeywardError::LastSlotProtected {
                        device: device.to_string(),
                        slot: index,
                    });
                }
                let opened = self.backend.test_key(device, key)?;
                let authorised = match target.kind {
                    SlotKind::Passphrase => opened == Some(index),
                    SlotKind::Keyserver { .. } => opened.is_some_and(|slot| slot != index),
                };
                if !authorised {
                    return Err(KeywardError::AuthFailed {
                        device: device.to_string(),
                    });
                }
            }
            Removal::Force => {
                warn!("force-removing keyslot {index} of {device}");
                let mut entry = AuditEntry::new(device, AuditAction::RemoveSlot)
                    .slot(index)
                    .forced(true);
                if slots.len() == 1 {
                    entry = entry.note("last remaining keyslot");
                }
                audit::record(&entry);
            }
        }

        if target.is_keyserver() {
            self.binder.unbind(device, index)?;
            audit::record(
                &AuditEntry::new(device, AuditAction::Unbind)
                    .slot(index)
                    .forced(matches!(removal, Removal::Force)),
            );
        } else {
            self.backend.kill_slot(device, index, None)?;
        }
        info!("removed keyslot {index} from {device}");

        let remaining: Vec<&KeySlot> = slots.iter().filter(|slot| slot.index != index).collect();
        Ok(RemovalOutcome {
            removed: target,
            remaining: remaining.len(),
            remaining_keyserver: remaining.iter().filter(|slot| slot.is_keyserver()).count(),
        })
    }

    /// Replace the passphrase in `index`.
    ///
    /// At every step at least one of `old_key` and `new_key` opens the device.
    pub fn edit_slot(
        &self,
        lease: &DeviceLease,
        index: u32,
        old_key: &[u8],
        new_key: &[u8],
    ) -> KeywardResult<EditOutcome> {
        let device = lease.device();
        if new_key.is_empty() {
            return Err(KeywardError::MissingKey("new passphrase is empty".into()));
        }
        let slots = self.list_slots(device)?;
        let target = slots
            .iter()
            .find(|slot| slot.index == index)
            .ok_or_else(|| KeywardError::SlotNotFound {
                device: device.to_string(),
                slot: index,
            })?;
        if target.is_keyserver() {
            return Err(KeywardError::InvalidState {
                device: device.to_string(),
                state: format!("keyslot {index} keyserver-bound"),
                action: "change its passphrase",
            });
        }
        if self.backend.test_key(device, old_key)? != Some(index) {
            return Err(KeywardError::AuthFailed {
                device: device.to_string(),
            });
        }

        let version = self.backend.version(device)?;
        if version.supports_in_place_change() {
            self.backend.change_key(device, index, old_key, new_key)?;
            info!("changed passphrase in keyslot {index} of {device}");
            return Ok(EditOutcome {
                slot: index,
                relocated: false,
                warnings: Vec::new(),
            });
        }

        self.relocating_edit(device, index, old_key, new_key, slots.len(), version)
    }

    fn relocating_edit(
        &self,
        device: &str,
        index: u32,
        old_key: &[u8],
        new_key: &[u8],
        in_use: usize,
        version: LuksVersion,
    ) -> KeywardResult<EditOutcome> {
        if in_use >= version.max_slots() {
            return Err(KeywardError::SlotLimitExceeded {
                device: device.to_string(),
                max: version.max_slots(),
            });
        }

        let temp = self.backend.add_key(device, old_key, new_key, None)?;
        let verified = match self.backend.test_key(device, new_key) {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(KeywardError::Provider(format!(
                "new key does not open {device} after adding it to keyslot {temp}"
            ))),
            Err(err) => Err(err),
        };
        let old_killed = verified.and_then(|()| self.backend.kill_slot(device, index, Some(new_key)));
        if let Err(err) = old_killed {
            if let Err(cleanup) = self.backend.kill_slot(device, temp, Some(old_key)) {
                warn!("failed to remove temporary keyslot {temp} of {device}: {cleanup}");
            }
            return Err(err);
        }

        let mut warnings = Vec::new();
        if let Err(err) = self.backend.add_key(device, new_key, new_key, Some(index)) {
            let message = format!(
                "new key kept in keyslot {temp}; could not move it back to keyslot {index}: {err}"
            );
            warn!("{device}: {message}");
            warnings.push(message);
            return Ok(EditOutcome {
                slot: temp,
                relocated: true,
                warnings,
            });
        }
        if let Err(err) = self.backend.kill_slot(device, temp, Some(new_key)) {
            let message = format!("temporary keyslot {temp} still holds the new key: {err}");
            warn!("{device}: {message}");
            warnings.push(message);
        }
        info!("changed passphrase in keyslot {index} of {device} via keyslot {temp}");
        Ok(EditOutcome {
            slot: index,
            relocated: false,
            warnings,
        })
    }

    fn ensure_capacity(&self, device: &str) -> KeywardResult<()> {
        let max = self.backend.version(device)?.max_slots();
        if self.backend.active_slots(device)?.len() >= max {
            return Err(KeywardError::SlotLimitExceeded {
                device: device.to_string(),
                max,
            });
        }
        Ok(())
    }

    fn require_auth(&self, device: &str, key: &[u8]) -> KeywardResult<u32> {
        self.backend
            .test_key(device, key)?
            .ok_or_else(|| KeywardError::AuthFailed {
                device: device.to_string(),
            })
    }
}
