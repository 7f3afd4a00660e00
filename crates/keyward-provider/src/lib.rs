#![forbid(unsafe_code)]

//! Collaborator contracts consumed by the keyward reconciliation engine.
//!
//! The engine never talks to `cryptsetup`, `clevis` or `mkfs` directly. It goes
//! through these traits so the orchestration logic can be exercised against
//! in-memory fakes and swapped onto other primitive libraries.

pub mod filesystem;
pub mod keyserver;
pub mod luks;

pub use filesystem::FilesystemMaker;
pub use keyserver::{Binding, KeyserverBinder};
pub use luks::{KeySlot, LuksBackend, LuksVersion, SlotKind};
