//! `/etc/crypttab` records: `<name> <device> <key-file|none|-> [<options>]`.

use super::{same_device, Options, TableRecord};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Where the unlock key for an entry comes from at boot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "path", rename_all = "snake_case")]
pub enum KeySource {
    /// Ask interactively (`none` or `-`).
    Prompt,
    /// Read the key from a file.
    File(PathBuf),
}

impl KeySource {
    fn parse(field: &str) -> Self {
        match field {
            "-" | "none" => KeySource::Prompt,
            path => KeySource::File(PathBuf::from(path)),
        }
    }

    fn render(&self) -> String {
        match self {
            KeySource::Prompt => "none".to_string(),
            KeySource::File(path) => path.display().to_string(),
        }
    }

    pub fn file(&self) -> Option<&Path> {
        match self {
            KeySource::Prompt => None,
            KeySource::File(path) => Some(path),
        }
    }
}

/// One line of `/etc/crypttab`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CryptEntry {
    /// Mapping name under `/dev/mapper`.
    pub name: String,
    /// Encrypted device, as `UUID=...` or a path.
    pub device: String,
    pub key: KeySource,
    pub options: Options,
}

impl CryptEntry {
    pub fn new(name: impl Into<String>, device: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            device: device.into(),
            key: KeySource::Prompt,
            options: Options::default(),
        }
    }

    pub fn refers_to(&self, device: &str) -> bool {
        same_device(&self.device, device)
    }

    /// Path of the cleartext mapping this entry produces.
    pub fn mapper_path(&self) -> String {
        format!("/dev/mapper/{}", self.name)
    }
}

impl TableRecord for CryptEntry {
    fn parse_line(line: &str) -> Result<Self, String> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 2 {
            return Err(format!(
                "expected at least 2 fields (name, device), found {}",
                fields.len()
            ));
        }
        if fields.len() > 4 {
            return Err(format!("expected at most 4 fields, found {}", fields.len()));
        }

        Ok(Self {
            name: fields[0].to_string(),
            device: fields[1].to_string(),
            key: fields
                .get(2)
                .map(|field| KeySource::parse(field))
                .unwrap_or(KeySource::Prompt),
            options: fields.get(3).map(|field| Options::parse(field)).unwrap_or_default(),
        })
    }

    fn render(&self) -> String {
        let mut line = format!("{} {} {}", self.name, self.device, self.key.render());
        if !self.options.is_empty() {
            line.push(' ');
            line.push_str(&self.options.to_string());
        }
        line
    }
}
