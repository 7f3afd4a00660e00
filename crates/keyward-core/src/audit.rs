//! Append-only journal of key-destroying operations.
//!
//! Forced slot removals, header re-initialisation and keyserver unbinds are
//! recorded as one JSON object per line so operators can reconstruct why a
//! device lost an unlock method. Journal failures are logged and swallowed.

use crate::config::project_dirs;
use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

const AUDIT_ROOT_ENV: &str = "KEYWARD_AUDIT_ROOT";
const AUDIT_DIR: &str = "audit";
const AUDIT_FILE: &str = "keyslots.jsonl";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuditAction {
    RemoveSlot,
    Reformat,
    Unbind,
}

/// One journal line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub device: String,
    pub action: AuditAction,
    pub slot: Option<u32>,
    pub forced: bool,
    pub note: Option<String>,
}

impl AuditEntry {
    pub fn new(device: &str, action: AuditAction) -> Self {
        Self {
            timestamp: Utc::now(),
            device: device.to_string(),
            action,
            slot: None,
            forced: false,
            note: None,
        }
    }

    pub fn slot(mut self, slot: u32) -> Self {
        self.slot = Some(slot);
        self
    }

    pub fn forced(mut self, forced: bool) -> Self {
        self.forced = forced;
        self
    }

    pub fn note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// Resolve the journal location, creating its directory when necessary.
pub fn journal_path() -> io::Result<PathBuf> {
    let base = std::env::var(AUDIT_ROOT_ENV)
        .map(PathBuf::from)
        .ok()
        .or_else(|| project_dirs().map(|dirs| dirs.data_local_dir().to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("/var/lib/keyward"));

    let root = base.join(AUDIT_DIR);
    fs::create_dir_all(&root)?;
    Ok(root.join(AUDIT_FILE))
}

/// Append `entry` to the journal. Errors are logged, never returned.
pub fn record(entry: &AuditEntry) {
    let outcome = journal_path().and_then(|path| append_jsonl(&path, entry));
    if let Err(err) = outcome {
        warn!(
            "failed to write audit entry for {} ({:?}): {err}",
            entry.device, entry.action
        );
    }
}

/// Read every journal entry, skipping lines that no longer parse.
pub fn read_entries() -> io::Result<Vec<AuditEntry>> {
    let path = journal_path()?;
    if !path.exists() {
        return Ok(Vec::new());
    }
    let data = fs::read_to_string(&path)?;
    Ok(data
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect())
}

fn append_jsonl(path: &Path, entry: &AuditEntry) -> io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let line = serde_json::to_string(entry)?;
    writeln!(file, "{line}")?;
    file.sync_data()
}


#[cfg(test)]
mod tests {
    use super::test_support::AuditRootGuard;
    use super::*;

    #[test]
    fn entries_are_appended_as_json_lines() {
        let guard = AuditRootGuard::new();
        record(
            &AuditEntry::new("/dev/sdb1", AuditAction::RemoveSlot)
                .slot(3)
                .forced(true),
        );
        record(&AuditEntry::new("/dev/sdb1", AuditAction::Reformat).note("new header"));

        let path = journal_path().unwrap();
        assert!(path.starts_with(guard.dir.path()));
        let raw = fs::read_to_string(&path).unwrap();
        assert_eq!(raw.lines().count(), 2);
        assert!(raw.contains("\"action\":\"remove-slot\""));

        let entries = read_entries().unwrap();
        assert_eq!(entries[0].slot, Some(3));
        assert!(entries[0].forced);
        assert_eq!(entries[1].note.as_deref(), Some("new header"));
    }

    #[test]
    fn unreadable_lines_are_skipped() {
        let _guard = AuditRootGuard::new();
        let path = journal_path().unwrap();
        fs::write(&path, "not json\n").unwrap();
        record(&AuditEntry::new("/dev/sdc1", AuditAction::Unbind).slot(1));
        let entries = read_entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, AuditAction::Unbind);
    }
}
