//! Unlock strategies, requests and reports.

use crate::error::KeywardResult;
use serde::Serialize;
use std::fmt;
use zeroize::Zeroizing;

/// Source of key material tried during unlock, in order of preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    Keyserver,
    StoredPassphrase,
    SuppliedKey,
    Prompt,
}

impl KeyStrategy {
    pub const ORDER: [KeyStrategy; 4] = [
        KeyStrategy::Keyserver,
        KeyStrategy::StoredPassphrase,
        KeyStrategy::SuppliedKey,
        KeyStrategy::Prompt,
    ];

    /// Whether the key came from the caller rather than from the system.
    pub fn caller_offered(self) -> bool {
        matches!(self, KeyStrategy::SuppliedKey | KeyStrategy::Prompt)
    }
}

impl fmt::Display for KeyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            KeyStrategy::Keyserver => "keyserver",
            KeyStrategy::StoredPassphrase => "stored passphrase",
            KeyStrategy::SuppliedKey => "supplied key",
            KeyStrategy::Prompt => "prompt",
        })
    }
}

/// Result of trying one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Unlocked,
    AuthFailed,
    /// The strategy had nothing to offer (no binding, no stored file,
    /// keyserver unreachable, prompt cancelled).
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attempt {
    pub strategy: KeyStrategy,
    pub outcome: AttemptOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Interactive passphrase source.
pub trait PassphrasePrompt {
    /// Ask for the passphrase of `device`. `attempt` starts at 1.
    /// `Ok(None)` means the operator cancelled.
    fn prompt(&self, device: &str, attempt: u32) -> KeywardResult<Option<Zeroizing<Vec<u8>>>>;
}

pub struct UnlockRequest<'a> {
    /// Mapping name to open; defaults to the crypttab name or `luks-<uuid>`.
    pub mapping: Option<String>,
    pub supplied_key: Option<&'a [u8]>,
    pub prompt: Option<&'a dyn PassphrasePrompt>,
    pub use_keyserver: bool,
    pub use_stored: bool,
    /// Clear `noauto` on the device's table entries after a successful unlock.
    pub persist_activation: bool,
}

impl Default for UnlockRequest<'_> {
    fn default() -> Self {
        Self {
            mapping: None,
            supplied_key: None,
            prompt: None,
            use_keyserver: true,
            use_stored: true,
            persist_activation: true,
        }
    }
}

impl<'a> UnlockRequest<'a> {
    pub fn with_key(key: &'a [u8]) -> Self {
        Self {
            supplied_key: Some(key),
            ..Self::default()
        }
    }

    pub(crate) fn allows(&self, strategy: KeyStrategy) -> bool {
        match strategy {
            KeyStrategy::Keyserver => self.use_keyserver,
            KeyStrategy::StoredPassphrase => self.use_stored,
            KeyStrategy::SuppliedKey => self.supplied_key.is_some(),
            KeyStrategy::Prompt => self.prompt.is_some(),
        }
    }
}

/// Summary of a successful unlock.
#[derive(Debug, Clone, Serialize)]
pub struct UnlockReport {
    pub device: String,
    pub mapping: String,
    pub strategy: KeyStrategy,
    pub slot: Option<u32>,
    pub attempts: Vec<Attempt>,
    /// Rejected keys counted before this success.
    pub failed_attempts: u32,
    pub warnings: Vec<String>,
}
