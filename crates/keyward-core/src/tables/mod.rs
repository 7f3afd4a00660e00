//! Line-oriented models of `/etc/crypttab` and `/etc/fstab`.
//!
//! Each file is a sequence of [`Line`]s: parsed records plus verbatim
//! passthrough lines (comments, blanks). Records that are never modified
//! re-render as their original bytes, so rewriting a table only changes the
//! lines a reconciliation actually touched.

mod crypttab;
mod fstab;
mod store;

pub use crypttab::{CryptEntry, KeySource};
pub use fstab::MountEntry;
pub use store::{ConfigStore, CryptChange, MountChange, Snapshot, TableDiff};

use crate::error::{KeywardError, KeywardResult};
use serde::Serialize;
use std::fmt;
use std::path::Path;

/// A record type that occupies one line of a table.
pub trait TableRecord: Clone + PartialEq {
    /// Parse a non-comment, non-blank line.
    fn parse_line(line: &str) -> Result<Self, String>;

    /// Render the record in canonical form.
    fn render(&self) -> String;
}

/// One line of a table file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line<T> {
    /// Parsed record. `raw` holds the original text until the entry is modified.
    Record { raw: Option<String>, entry: T },
    /// Comment, blank or otherwise opaque line kept verbatim.
    Passthrough(String),
}

/// Parsed table with enough information to rewrite it losslessly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table<T> {
    lines: Vec<Line<T>>,
    trailing_newline: bool,
}

impl<T> Default for Table<T> {
    fn default() -> Self {
        Self {
            lines: Vec::new(),
            trailing_newline: true,
        }
    }
}

impl<T: TableRecord> Table<T> {
    pub fn parse(path: &Path, contents: &str) -> KeywardResult<Self> {
        let mut lines = Vec::new();
        for (idx, line) in contents.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                lines.push(Line::Passthrough(line.to_string()));
                continue;
            }
            let entry = T::parse_line(trimmed).map_err(|reason| KeywardError::Parse {
                path: path.to_path_buf(),
                line: idx + 1,
                reason,
            })?;
            lines.push(Line::Record {
                raw: Some(line.to_string()),
                entry,
            });
        }

        Ok(Self {
            lines,
            trailing_newline: contents.is_empty() || contents.ends_with('\n'),
        })
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (idx, line) in self.lines.iter().enumerate() {
            if idx > 0 {
                out.push('\n');
            }
            match line {
                Line::Record { raw: Some(raw), .. } => out.push_str(raw),
                Line::Record { raw: None, entry } => out.push_str(&entry.render()),
                Line::Passthrough(text) => out.push_str(text),
            }
        }
        if self.trailing_newline && !self.lines.is_empty() {
            out.push('\n');
        }
        out
    }

    pub fn entries(&self) -> impl Iterator<Item = &T> {
        self.lines.iter().filter_map(|line| match line {
            Line::Record { entry, .. } => Some(entry),
            Line::Passthrough(_) => None,
        })
    }

    pub fn lines(&self) -> &[Line<T>] {
        &self.lines
    }

    pub fn find(&self, mut pred: impl FnMut(&T) -> bool) -> Option<&T> {
        self.entries().find(|entry| pred(entry))
    }

    /// Replace the first entry matching `pred` with `entry`, or append it.
    /// Returns `false` when an identical entry was already present.
    pub fn upsert_by(&mut self, mut pred: impl FnMut(&T) -> bool, entry: T) -> bool {
        for line in &mut self.lines {
            if let Line::Record {
                raw,
                entry: existing,
            } = line
            {
                if pred(existing) {
                    if *existing == entry {
                        return false;
                    }
                    *existing = entry;
                    *raw = None;
                    return true;
                }
            }
        }
        self.lines.push(Line::Record { raw: None, entry });
        true
    }

    /// Drop every entry matching `pred`. Returns whether anything was removed.
    pub fn remove_by(&mut self, mut pred: impl FnMut(&T) -> bool) -> bool {
        let before = self.lines.len();
        self.lines.retain(|line| match line {
            Line::Record { entry, .. } => !pred(entry),
            Line::Passthrough(_) => true,
        });
        before != self.lines.len()
    }
}

/// Comma-separated option list with set semantics and stable ordering.
///
/// `key=value` flags are matched by key; inserting a new flag appends it and
/// removing one keeps the order of the rest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Options(Vec<String>);

impl Options {
    pub fn parse(field: &str) -> Self {
        Self(
            field
                .split(',')
                .map(str::trim)
                .filter(|flag| !flag.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn contains(&self, flag: &str) -> bool {
        let key = flag_key(flag);
        self.0.iter().any(|existing| flag_key(existing) == key)
    }

    /// Value of a `key=value` flag.
    pub fn value(&self, key: &str) -> Option<&str> {
        self.0.iter().find_map(|existing| {
            existing
                .split_once('=')
                .filter(|(k, _)| *k == key)
                .map(|(_, v)| v)
        })
    }

    /// Add `flag`, replacing a flag with the same key. Returns whether the list changed.
    pub fn insert(&mut self, flag: &str) -> bool {
        let key = flag_key(flag);
        if let Some(existing) = self.0.iter_mut().find(|f| flag_key(f) == key) {
            if existing == flag {
                return false;
            }
            *existing = flag.to_string();
            return true;
        }
        self.0.push(flag.to_string());
        true
    }

    pub fn remove(&mut self, flag: &str) -> bool {
        let key = flag_key(flag);
        let before = self.0.len();
        self.0.retain(|existing| flag_key(existing) != key);
        before != self.0.len()
    }

    /// Insert or remove `flag` depending on `enabled`.
    pub fn set(&mut self, flag: &str, enabled: bool) -> bool {
        if enabled {
            self.insert(flag)
        } else {
            self.remove(flag)
        }
    }
}

impl fmt::Display for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(","))
    }
}

impl<'a> FromIterator<&'a str> for Options {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        let mut options = Options::default();
        for flag in iter {
            options.insert(flag);
        }
        options
    }
}

fn flag_key(flag: &str) -> &str {
    flag.split_once('=').map(|(key, _)| key).unwrap_or(flag)
}

/// Normalise a `UUID=...` reference or bare UUID into lowercase hex without dashes.
pub fn normalize_uuid(value: &str) -> Option<String> {
    let trimmed = value.trim();
    let without_prefix = if trimmed.len() >= 5 && trimmed[..5].eq_ignore_ascii_case("uuid=") {
        &trimmed[5..]
    } else {
        trimmed
    };
    let candidate = without_prefix.trim().trim_matches('"');
    if candidate.is_empty() {
        return None;
    }

    let mut hex_chars = 0usize;
    let mut has_dash = false;
    for ch in candidate.chars() {
        if ch == '-' {
            has_dash = true;
            continue;
        }
        if !ch.is_ascii_hexdigit() {
            return None;
        }
        hex_chars += 1;
    }

    if hex_chars == 0 || (!has_dash && hex_chars != 32) {
        return None;
    }

    Some(
        candidate
            .chars()
            .filter(|ch| *ch != '-')
            .map(|ch| ch.to_ascii_lowercase())
            .collect(),
    )
}

/// Whether two device references (`UUID=...`, bare UUIDs or paths) name the same device.
pub fn same_device(a: &str, b: &str) -> bool {
    match (normalize_uuid(a), normalize_uuid(b)) {
        (Some(left), Some(right)) => left == right,
        _ => a.trim() == b.trim(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_keep_order_and_match_keys() {
        let mut options = Options::parse("nofail,x-systemd.device-timeout=10,discard");
        assert!(options.contains("x-systemd.device-timeout=0"));
        assert_eq!(options.value("x-systemd.device-timeout"), Some("10"));

        assert!(!options.insert("nofail"));
        assert!(options.insert("_netdev"));
        assert!(options.remove("discard"));
        assert_eq!(
            options.to_string(),
            "nofail,x-systemd.device-timeout=10,_netdev"
        );

        assert!(options.insert("x-systemd.device-timeout=30"));
        assert_eq!(
            options.to_string(),
            "nofail,x-systemd.device-timeout=30,_netdev"
        );
    }

    #[test]
    fn options_parse_skips_empty_segments() {
        let options = Options::parse(",noauto,,ro,");
        assert_eq!(options.iter().collect::<Vec<_>>(), vec!["noauto", "ro"]);
    }

    #[test]
    fn uuid_normalisation_ignores_case_and_prefix() {
        assert_eq!(
            normalize_uuid("UUID=0F3C6C0E-1D2A-4B5C-8D9E-0A1B2C3D4E5F"),
            Some("0f3c6c0e1d2a4b5c8d9e0a1b2c3d4e5f".to_string())
        );
        assert!(same_device(
            "uuid=0f3c6c0e-1d2a-4b5c-8d9e-0a1b2c3d4e5f",
            "0F3C6C0E-1D2A-4B5C-8D9E-0A1B2C3D4E5F"
        ));
        assert!(normalize_uuid("/dev/sdb1").is_none());
        assert!(same_device("/dev/sdb1", " /dev/sdb1"));
        assert!(!same_device("/dev/sdb1", "/dev/sdc1"));
    }
}
