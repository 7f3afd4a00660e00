#![forbid(unsafe_code)]

//! Host-tool implementations of the keyward provider traits.
//!
//! Integrates with the host via:
//! - `cryptsetup` (headers, keyslots, mappings)
//! - `clevis luks` with the tang pin (network-bound keyslots)
//! - `mkfs` (filesystems on cleartext mappings)

mod clevis;
mod command;
mod cryptsetup;
pub mod dump;
mod mkfs;
mod system;

pub use clevis::SystemClevisBinder;
pub use dump::{LuksDump, Token};
pub use mkfs::SystemFilesystemMaker;
pub use system::SystemLuksBackend;
