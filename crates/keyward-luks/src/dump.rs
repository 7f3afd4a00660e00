//! Parser for `cryptsetup luksDump` output (LUKS1 and LUKS2 layouts).

use keyward_core::error::{KeywardError, KeywardResult};
use keyward_provider::LuksVersion;
use regex::Regex;
use std::sync::OnceLock;

/// LUKS2 token attached to keyslots (e.g. a clevis binding).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub id: u32,
    pub kind: String,
    pub keyslots: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LuksDump {
    pub version: LuksVersion,
    pub uuid: String,
    /// Populated keyslots, ascending.
    pub slots: Vec<u32>,
    pub tokens: Vec<Token>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    Header,
    Keyslots,
    Tokens,
    Other,
}

fn field_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(Version|UUID):\s*(\S+)").expect("valid header regex"))
}

fn luks1_slot_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^Key Slot (\d+): (ENABLED|DISABLED)").expect("valid luks1 slot regex")
    })
}

fn entry_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s+(\d+): (\S+)").expect("valid entry regex"))
}

fn token_keyslot_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s+Keyslot:\s+(\d+)").expect("valid token keyslot regex"))
}

pub fn parse_dump(device: &str, output: &str) -> KeywardResult<LuksDump> {
    let mut version = None;
    let mut uuid = None;
    let mut slots = Vec::new();
    let mut tokens: Vec<Token> = Vec::new();
    let mut section = Section::Header;

    for line in output.lines() {
        if !line.starts_with(char::is_whitespace) && !line.is_empty() {
            section = match line.trim_end() {
                "Keyslots:" => Section::Keyslots,
                "Tokens:" => Section::Tokens,
                _ if line.ends_with(':') => Section::Other,
                _ => Section::Header,
            };
        }

        match section {
            Section::Header => {
                if let Some(caps) = field_re().captures(line) {
                    match &caps[1] {
                        "Version" => version = LuksVersion::parse(&caps[2]),
                        _ => uuid = Some(caps[2].to_string()),
                    }
                } else if let Some(caps) = luks1_slot_re().captures(line) {
                    if &caps[2] == "ENABLED" {
                        slots.push(parse_index(device, &caps[1])?);
                    }
                }
            }
            Section::Keyslots => {
                if let Some(caps) = entry_re().captures(line) {
                    slots.push(parse_index(device, &caps[1])?);
                }
            }
            Section::Tokens => {
                if let Some(caps) = entry_re().captures(line) {
                    tokens.push(Token {
                        id: parse_index(device, &caps[1])?,
                        kind: caps[2].to_string(),
                        keyslots: Vec::new(),
                    });
                } else if let Some(caps) = token_keyslot_re().captures(line) {
                    let slot = parse_index(device, &caps[1])?;
                    if let Some(token) = tokens.last_mut() {
                        token.keyslots.push(slot);
                    }
                }
            }
            Section::Other => {}
        }
    }

    let version = version.ok_or_else(|| {
        KeywardError::Provider(format!("luksDump of {device} has no recognised Version field"))
    })?;
    let uuid = uuid
        .ok_or_else(|| KeywardError::Provider(format!("luksDump of {device} has no UUID field")))?;
    slots.sort_unstable();
    slots.dedup();
    Ok(LuksDump {
        version,
        uuid,
        slots,
        tokens,
    })
}

fn parse_index(device: &str, raw: &str) -> KeywardResult<u32> {
    raw.parse()
        .map_err(|_| KeywardError::Provider(format!("luksDump of {device}: bad index `{raw}`")))
}
