//! Per-device exclusive leases.
//!
//! Every mutating slot, format or table operation takes a `&DeviceLease`, so
//! holding the guard is the only way to touch a device. Leases on different
//! devices never block each other; the guard releases on drop, including on
//! error and unwind paths.

use crate::error::{KeywardError, KeywardResult};
use log::debug;
use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct Inner {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

/// Registry handing out at most one lease per device.
#[derive(Debug, Clone, Default)]
pub struct LeaseRegistry {
    inner: Arc<Inner>,
}

/// Scoped exclusive claim on one device.
#[derive(Debug)]
pub struct DeviceLease {
    device: String,
    registry: Arc<Inner>,
}

impl LeaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `device` is free, then claim it.
    pub fn acquire(&self, device: &str) -> DeviceLease {
        let mut held = self.lock();
        while held.contains(device) {
            held = self
                .inner
                .released
                .wait(held)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        held.insert(device.to_string());
        debug!("lease acquired for {device}");
        self.lease(device)
    }

    /// Claim `device` or fail immediately with [`KeywardError::LeaseHeld`].
    pub fn try_acquire(&self, device: &str) -> KeywardResult<DeviceLease> {
        let mut held = self.lock();
        if !held.insert(device.to_string()) {
            return Err(KeywardError::LeaseHeld(device.to_string()));
        }
        debug!("lease acquired for {device}");
        Ok(self.lease(device))
    }

    pub fn is_held(&self, device: &str) -> bool {
        self.lock().contains(device)
    }

    fn lease(&self, device: &str) -> DeviceLease {
        DeviceLease {
            device: device.to_string(),
            registry: Arc::clone(&self.inner),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.inner
            .held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl DeviceLease {
    /// Block device node this lease covers.
    pub fn device(&self) -> &str {
        &self.device
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        let mut held = self
            .registry
            .held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        held.remove(&self.device);
        drop(held);
        self.registry.released.notify_all();
        debug!("lease released for {}", self.device);
    }
}
