//! Provider contract for network-bound (Tang/Clevis-style) keyslots.
//!
//! The engine only decides when to bind, unbind or recover; the handshake with
//! the keyserver belongs to the implementation. Implementations must map an
//! unreachable or timed-out keyserver to a distinct error so callers can fall
//! back to local key material.

use serde::{Deserialize, Serialize};
use std::error::Error;

/// Keyserver pin attached to one keyslot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    pub slot: u32,
    pub url: String,
    /// Thumbprint of the keyserver's advertised signing key.
    pub thumbprint: String,
}

pub trait KeyserverBinder {
    type Error: Error + Send + Sync + 'static;

    /// Bind a new keyslot to the keyserver at `url`, authorised by `existing_key`.
    ///
    /// When `trusted_thumbprint` is given the advertisement must be signed by
    /// that key, otherwise the binding is rejected.
    fn bind(
        &self,
        device: &str,
        url: &str,
        trusted_thumbprint: Option<&str>,
        existing_key: &[u8],
    ) -> Result<Binding, Self::Error>;

    /// Remove the binding and wipe its keyslot.
    fn unbind(&self, device: &str, slot: u32) -> Result<(), Self::Error>;

    /// List bindings present on the device.
    fn bindings(&self, device: &str) -> Result<Vec<Binding>, Self::Error>;

    /// Ask the keyserver to release the passphrase held in `slot`.
    fn recover_key(&self, device: &str, slot: u32) -> Result<Vec<u8>, Self::Error>;
}
