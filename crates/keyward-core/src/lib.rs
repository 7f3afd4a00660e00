//! Core of keyward: LUKS key-slot management and crypttab/fstab reconciliation.
//!
//! The crate owns the decisions (which slots may go, which flags a table entry
//! needs, how a device gets unlocked) and leaves the actual header and keyserver
//! work to the provider traits in `keyward-provider`, so the CLI and tests can
//! swap in their own backends.

mod atomic;
pub mod audit;
pub mod config;
pub mod error;
pub mod lease;
pub mod logging;
pub mod planner;
pub mod readiness;
pub mod slots;
pub mod tables;
pub mod vault;
pub mod worker;

#[cfg(test)]
mod testing;

pub use config::{ConfigFormat, KeywardConfig};
pub use error::{ErrorCode, KeywardError, KeywardResult};
pub use lease::{DeviceLease, LeaseRegistry};
pub use planner::{
    DesiredState, DeviceState, DeviceStatus, FormatReport, FormatRequest, KeyStrategy,
    KeyserverSpec, MountSpec, PassphrasePrompt, Plan, PlannerPolicy, StoredChoice, UnlockPlanner,
    UnlockReport, UnlockRequest,
};
pub use readiness::{MountIntent, Readiness};
pub use slots::{EditOutcome, KeySlotManager, Removal, RemovalOutcome};
pub use tables::{ConfigStore, CryptEntry, KeySource, MountEntry, Options, Snapshot, TableDiff};
pub use vault::{PassphraseVault, StoredPassphraseInfo};
pub use worker::{spawn_job, JobEvent, JobHandle, Progress};
