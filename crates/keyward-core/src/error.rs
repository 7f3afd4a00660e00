//! Error type shared by every keyward crate.

use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

pub type KeywardResult<T> = Result<T, KeywardError>;

#[derive(Debug, Error)]
pub enum KeywardError {
    #[error("{}:{line}: {reason}", path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("configuration changed since it was loaded (generation {expected}, now {found}); reload and retry")]
    Conflict { expected: u64, found: u64 },

    #[error("key rejected by {device}")]
    AuthFailed { device: String },

    #[error("{device} has no free keyslot ({max} in use)")]
    SlotLimitExceeded { device: String, max: usize },

    #[error("refusing to remove keyslot {slot} of {device}: it is the last unlock method")]
    LastSlotProtected { device: String, slot: u32 },

    #[error("no unlock method succeeded for {device}")]
    NoUsableKey { device: String },

    #[error("keyserver unreachable: {0}")]
    Unreachable(String),

    #[error("keyserver binding rejected: {0}")]
    RejectedByOperator(String),

    #[error("{0}")]
    MissingKey(String),

    #[error("keyslot {slot} is not in use on {device}")]
    SlotNotFound { device: String, slot: u32 },

    #[error("{device} is {state}; cannot {action}")]
    InvalidState {
        device: String,
        state: String,
        action: &'static str,
    },

    #[error("another operation holds the lease for {0}")]
    LeaseHeld(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    TomlDe(#[from] toml::de::Error),

    #[error(transparent)]
    TomlSer(#[from] toml::ser::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Stable, presentation-free error codes handed to UI layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    ParseError,
    ConflictError,
    AuthFailed,
    SlotLimitExceeded,
    LastSlotProtected,
    NoUsableKey,
    Unreachable,
    RejectedByOperator,
    MissingKey,
    SlotNotFound,
    InvalidState,
    LeaseHeld,
    InvalidConfig,
    Provider,
    Io,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::ParseError => "parse-error",
            ErrorCode::ConflictError => "conflict-error",
            ErrorCode::AuthFailed => "auth-failed",
            ErrorCode::SlotLimitExceeded => "slot-limit-exceeded",
            ErrorCode::LastSlotProtected => "last-slot-protected",
            ErrorCode::NoUsableKey => "no-usable-key",
            ErrorCode::Unreachable => "unreachable",
            ErrorCode::RejectedByOperator => "rejected-by-operator",
            ErrorCode::MissingKey => "missing-key",
            ErrorCode::SlotNotFound => "slot-not-found",
            ErrorCode::InvalidState => "invalid-state",
            ErrorCode::LeaseHeld => "lease-held",
            ErrorCode::InvalidConfig => "invalid-config",
            ErrorCode::Provider => "provider",
            ErrorCode::Io => "io",
        }
    }
}

impl KeywardError {
    pub fn code(&self) -> ErrorCode {
        match self {
            KeywardError::Parse { .. } => ErrorCode::ParseError,
            KeywardError::Conflict { .. } => ErrorCode::ConflictError,
            KeywardError::AuthFailed { .. } => ErrorCode::AuthFailed,
            KeywardError::SlotLimitExceeded { .. } => ErrorCode::SlotLimitExceeded,
            KeywardError::LastSlotProtected { .. } => ErrorCode::LastSlotProtected,
            KeywardError::NoUsableKey { .. } => ErrorCode::NoUsableKey,
            KeywardError::Unreachable(_) => ErrorCode::Unreachable,
            KeywardError::RejectedByOperator(_) => ErrorCode::RejectedByOperator,
            KeywardError::MissingKey(_) => ErrorCode::MissingKey,
            KeywardError::SlotNotFound { .. } => ErrorCode::SlotNotFound,
            KeywardError::InvalidState { .. } => ErrorCode::InvalidState,
            KeywardError::LeaseHeld(_) => ErrorCode::LeaseHeld,
            KeywardError::InvalidConfig(_)
            | KeywardError::TomlDe(_)
            | KeywardError::TomlSer(_)
            | KeywardError::Yaml(_) => ErrorCode::InvalidConfig,
            KeywardError::Provider(_) | KeywardError::Json(_) => ErrorCode::Provider,
            KeywardError::Io(_) => ErrorCode::Io,
        }
    }

    /// Whether retrying with different key material may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            KeywardError::AuthFailed { .. }
                | KeywardError::Conflict { .. }
                | KeywardError::Unreachable(_)
                | KeywardError::LeaseHeld(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_kebab_case() {
        let err = KeywardError::LastSlotProtected {
            device: "/dev/sdb1".into(),
            slot: 0,
        };
        assert_eq!(err.code(), ErrorCode::LastSlotProtected);
        assert_eq!(
            serde_json::to_string(&err.code()).unwrap(),
            format!("\"{}\"", err.code().as_str())
        );
    }

    #[test]
    fn parse_error_mentions_location() {
        let err = KeywardError::Parse {
            path: PathBuf::from("/etc/crypttab"),
            line: 3,
            reason: "expected at least 2 fields".into(),
        };
        assert_eq!(
            err.to_string(),
            "/etc/crypttab:3: expected at least 2 fields"
        );
        assert!(!err.is_retryable());
    }
}
