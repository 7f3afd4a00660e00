//! In-memory collaborators for unit tests.

use crate::error::{KeywardError, KeywardResult};
use keyward_provider::{Binding, FilesystemMaker, KeyserverBinder, LuksBackend, LuksVersion};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone)]
struct Volume {
    version: LuksVersion,
    uuid: String,
    slots: BTreeMap<u32, Vec<u8>>,
}

#[derive(Debug, Default)]
struct LuksState {
    volumes: HashMap<String, Volume>,
    mappings: HashMap<String, String>,
    history: HashMap<String, Vec<Vec<Vec<u8>>>>,
    fail_once: HashSet<&'static str>,
    formats: u32,
    tear_next_format: bool,
}

/// LUKS backend keeping headers in memory. Every key-set mutation is recorded
/// so tests can inspect intermediate states.
#[derive(Debug, Clone, Default)]
pub(crate) struct FakeLuks {
    state: Arc<Mutex<LuksState>>,
}

impl FakeLuks {
    pub(crate) fn with_volume(device: &str, version: LuksVersion, key: &[u8]) -> Self {
        let fake = Self::default();
        fake.add_volume(device, version, key);
        fake
    }

    pub(crate) fn add_volume(&self, device: &str, version: LuksVersion, key: &[u8]) {
        let mut state = self.lock();
        state.formats += 1;
        let uuid = fake_uuid(state.formats);
        state.volumes.insert(
            device.to_string(),
            Volume {
                version,
                uuid,
                slots: BTreeMap::from([(0, key.to_vec())]),
            },
        );
    }

    /// Make the next call to `op` fail with a provider error.
    pub(crate) fn fail_next(&self, op: &'static str) {
        self.lock().fail_once.insert(op);
    }

    /// Make the next `format` wipe the old header and then fail.
    pub(crate) fn tear_next_format(&self) {
        self.lock().tear_next_format = true;
    }

    pub(crate) fn slot_key(&self, device: &str, slot: u32) -> Option<Vec<u8>> {
        self.lock()
            .volumes
            .get(device)
            .and_then(|volume| volume.slots.get(&slot).cloned())
    }

    /// Key sets observed after each mutation of `device`.
    pub(crate) fn history(&self, device: &str) -> Vec<Vec<Vec<u8>>> {
        self.lock().history.get(device).cloned().unwrap_or_default()
    }

    pub(crate) fn mapping(&self, name: &str) -> Option<String> {
        self.lock().mappings.get(name).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, LuksState> {
        self.state.lock().unwrap()
    }

    fn check_fail(state: &mut LuksState, op: &'static str) -> KeywardResult<()> {
        if state.fail_once.remove(op) {
            return Err(KeywardError::Provider(format!("injected {op} failure")));
        }
        Ok(())
    }
}

fn fake_uuid(counter: u32) -> String {
    format!("{counter:08x}-1111-4222-8333-{counter:012x}")
}

fn volume<'a>(state: &'a mut LuksState, device: &str) -> KeywardResult<&'a mut Volume> {
    state
        .volumes
        .get_mut(device)
        .ok_or_else(|| KeywardError::Provider(format!("{device} is not a LUKS device")))
}

fn record(state: &mut LuksState, device: &str) {
    let keys = state
        .volumes
        .get(device)
        .map(|volume| volume.slots.values().cloned().collect())
        .unwrap_or_default();
    state
        .history
        .entry(device.to_string())
        .or_default()
        .push(keys);
}

impl LuksBackend for FakeLuks {
    type Error = KeywardError;

    fn format(&self, device: &str, version: LuksVersion, key: &[u8]) -> KeywardResult<()> {
        let mut state = self.lock();
        Self::check_fail(&mut state, "format")?;
        if state.tear_next_format {
            state.tear_next_format = false;
            state.volumes.remove(device);
            return Err(KeywardError::Provider(format!(
                "header write to {device} interrupted"
            )));
        }
        state.formats += 1;
        let uuid = fake_uuid(state.formats);
        state.volumes.insert(
            device.to_string(),
            Volume {
                version,
                uuid,
                slots: BTreeMap::from([(0, key.to_vec())]),
            },
        );
        record(&mut state, device);
        Ok(())
    }

    fn open(&self, device: &str, name: &str, key: &[u8]) -> KeywardResult<()> {
        let mut state = self.lock();
        Self::check_fail(&mut state, "open")?;
        if state.mappings.contains_key(name) {
            return Err(KeywardError::Provider(format!("{name} already active")));
        }
        let volume = volume(&mut state, device)?;
        if !volume.slots.values().any(|slot| slot == key) {
            return Err(KeywardError::AuthFailed {
                device: device.to_string(),
            });
        }
        state.mappings.insert(name.to_string(), device.to_string());
        Ok(())
    }

    fn close(&self, name: &str) -> KeywardResult<()> {
        let mut state = self.lock();
        Self::check_fail(&mut state, "close")?;
        state.mappings.remove(name);
        Ok(())
    }

    fn is_open(&self, name: &str) -> KeywardResult<bool> {
        Ok(self.lock().mappings.contains_key(name))
    }

    fn add_key(
        &self,
        device: &str,
        auth_key: &[u8],
        new_key: &[u8],
        slot: Option<u32>,
    ) -> KeywardResult<u32> {
        let mut state = self.lock();
        Self::check_fail(&mut state, "add_key")?;
        let volume = volume(&mut state, device)?;
        if !volume.slots.values().any(|key| key == auth_key) {
            return Err(KeywardError::AuthFailed {
                device: device.to_string(),
            });
        }
        let max = volume.version.max_slots() as u32;
        let index = match slot {
            Some(index) if volume.slots.contains_key(&index) || index >= max => {
                return Err(KeywardError::Provider(format!(
                    "keyslot {index} is not available"
                )))
            }
            Some(index) => index,
            None => (0..max)
                .find(|index| !volume.slots.contains_key(index))
                .ok_or_else(|| KeywardError::SlotLimitExceeded {
                    device: device.to_string(),
                    max: max as usize,
                })?,
        };
        volume.slots.insert(index, new_key.to_vec());
        record(&mut state, device);
        Ok(index)
    }

    fn kill_slot(&self, device: &str, slot: u32, auth_key: Option<&[u8]>) -> KeywardResult<()> {
        let mut state = self.lock();
        Self::check_fail(&mut state, "kill_slot")?;
        let volume = volume(&mut state, device)?;
        if !volume.slots.contains_key(&slot) {
            return Err(KeywardError::SlotNotFound {
                device: device.to_string(),
                slot,
            });
        }
        if let Some(auth) = auth_key {
            let authorised = volume
                .slots
                .iter()
                .any(|(index, key)| *index != slot && key == auth);
            if !authorised {
                return Err(KeywardError::AuthFailed {
                    device: device.to_string(),
                });
            }
        }
        volume.slots.remove(&slot);
        record(&mut state, device);
        Ok(())
    }

    fn change_key(
        &self,
        device: &str,
        slot: u32,
        old_key: &[u8],
        new_key: &[u8],
    ) -> KeywardResult<()> {
        let mut state = self.lock();
        Self::check_fail(&mut state, "change_key")?;
        let volume = volume(&mut state, device)?;
        if volume.version == LuksVersion::Luks1 {
            return Err(KeywardError::Provider("in-place change unsupported".into()));
        }
        match volume.slots.get_mut(&slot) {
            Some(key) if key.as_slice() == old_key => *key = new_key.to_vec(),
            _ => {
                return Err(KeywardError::AuthFailed {
                    device: device.to_string(),
                })
            }
        }
        record(&mut state, device);
        Ok(())
    }

    fn is_luks(&self, device: &str) -> KeywardResult<bool> {
        let mut state = self.lock();
        Self::check_fail(&mut state, "is_luks")?;
        Ok(state.volumes.contains_key(device))
    }

    fn uuid(&self, device: &str) -> KeywardResult<String> {
        Ok(volume(&mut self.lock(), device)?.uuid.clone())
    }

    fn version(&self, device: &str) -> KeywardResult<LuksVersion> {
        Ok(volume(&mut self.lock(), device)?.version)
    }

    fn active_slots(&self, device: &str) -> KeywardResult<Vec<u32>> {
        Ok(volume(&mut self.lock(), device)?
            .slots
            .keys()
            .copied()
            .collect())
    }

    fn test_key(&self, device: &str, key: &[u8]) -> KeywardResult<Option<u32>> {
        Ok(volume(&mut self.lock(), device)?
            .slots
            .iter()
            .find(|(_, slot)| slot.as_slice() == key)
            .map(|(index, _)| *index))
    }
}

#[derive(Debug)]
struct BinderState {
    bindings: HashMap<String, Vec<(Binding, Vec<u8>)>>,
    reachable: bool,
    listing_fails: bool,
    thumbprint: String,
    issued: u32,
}

/// Keyserver binder that stores released keys in memory on top of [`FakeLuks`].
#[derive(Debug, Clone)]
pub(crate) struct FakeBinder {
    luks: FakeLuks,
    state: Arc<Mutex<BinderState>>,
}

impl FakeBinder {
    pub(crate) fn new(luks: FakeLuks) -> Self {
        Self {
            luks,
            state: Arc::new(Mutex::new(BinderState {
                bindings: HashMap::new(),
                reachable: true,
                listing_fails: false,
                thumbprint: "tp-server".into(),
                issued: 0,
            })),
        }
    }

    pub(crate) fn set_reachable(&self, reachable: bool) {
        self.state.lock().unwrap().reachable = reachable;
    }

    /// Make `bindings()` fail the way a hung `clevis luks list` does.
    pub(crate) fn set_listing_fails(&self, fails: bool) {
        self.state.lock().unwrap().listing_fails = fails;
    }

    pub(crate) fn thumbprint(&self) -> String {
        self.state.lock().unwrap().thumbprint.clone()
    }
}

impl KeyserverBinder for FakeBinder {
    type Error = KeywardError;

    fn bind(
        &self,
        device: &str,
        url: &str,
        trusted_thumbprint: Option<&str>,
        existing_key: &[u8],
    ) -> KeywardResult<Binding> {
        let (secret, thumbprint) = {
            let mut state = self.state.lock().unwrap();
            if !state.reachable {
                return Err(KeywardError::Unreachable(url.to_string()));
            }
            if trusted_thumbprint.is_some_and(|trusted| trusted != state.thumbprint) {
                return Err(KeywardError::RejectedByOperator(format!(
                    "{url} advertised {}",
                    state.thumbprint
                )));
            }
            state.issued += 1;
            (
                format!("keyserver-secret-{}", state.issued).into_bytes(),
                state.thumbprint.clone(),
            )
        };
        let slot = self.luks.add_key(device, existing_key, &secret, None)?;
        let binding = Binding {
            slot,
            url: url.to_string(),
            thumbprint,
        };
        self.state
            .lock()
            .unwrap()
            .bindings
            .entry(device.to_string())
            .or_default()
            .push((binding.clone(), secret));
        Ok(binding)
    }

    fn unbind(&self, device: &str, slot: u32) -> KeywardResult<()> {
        self.luks.kill_slot(device, slot, None)?;
        if let Some(list) = self.state.lock().unwrap().bindings.get_mut(device) {
            list.retain(|(binding, _)| binding.slot != slot);
        }
        Ok(())
    }

    fn bindings(&self, device: &str) -> KeywardResult<Vec<Binding>> {
        let state = self.state.lock().unwrap();
        if state.listing_fails {
            return Err(KeywardError::Unreachable(format!(
                "listing bindings of {device} timed out"
            )));
        }
        Ok(state
            .bindings
            .get(device)
            .map(|list| {
                list.iter()
                    .filter(|(binding, secret)| {
                        self.luks.slot_key(device, binding.slot).as_ref() == Some(secret)
                    })
                    .map(|(binding, _)| binding.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    fn recover_key(&self, device: &str, slot: u32) -> KeywardResult<Vec<u8>> {
        let state = self.state.lock().unwrap();
        if !state.reachable {
            return Err(KeywardError::Unreachable(format!("{device} slot {slot}")));
        }
        state
            .bindings
            .get(device)
            .and_then(|list| list.iter().find(|(binding, _)| binding.slot == slot))
            .map(|(_, secret)| secret.clone())
            .ok_or_else(|| KeywardError::SlotNotFound {
                device: device.to_string(),
                slot,
            })
    }
}

/// Records `mkfs` invocations.
#[derive(Debug, Clone, Default)]
pub(crate) struct FakeMkfs {
    calls: Arc<Mutex<Vec<(String, String)>>>,
}

impl FakeMkfs {
    pub(crate) fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

impl FilesystemMaker for FakeMkfs {
    type Error = KeywardError;

    fn make_filesystem(&self, device: &str, fstype: &str, _label: Option<&str>) -> KeywardResult<()> {
        self.calls
            .lock()
            .unwrap()
            .push((device.to_string(), fstype.to_string()));
        Ok(())
    }
}
