//! Typed wrapper around the `cryptsetup` subcommands keyward needs.
//!
//! Key material always travels over stdin (`--key-file -`). The one exception
//! is the *new* key of `luksAddKey`/`luksChangeKey`, which cryptsetup only reads
//! from a file argument; that goes through a private [`KeyFile`].

use crate::command::{
    action_unsupported, dev_mapper_node_exists, permission_denied, KeyFile, Output, ToolCommand,
};
use crate::dump::{parse_dump, LuksDump};
use keyward_core::error::{KeywardError, KeywardResult};
use keyward_provider::LuksVersion;
use log::{debug, info};
use regex::Regex;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

/// cryptsetup exit status for "no permission (bad passphrase)".
const EXIT_BAD_PASSPHRASE: i32 = 2;
/// cryptsetup exit status for "wrong or missing parameters" (no header on `isLuks`).
const EXIT_WRONG_PARAMETERS: i32 = 1;
/// cryptsetup exit status for "wrong device specified" (inactive mapping on `status`).
const EXIT_WRONG_DEVICE: i32 = 4;

#[derive(Debug, Clone)]
pub(crate) struct Cryptsetup {
    tool: ToolCommand,
}

impl Cryptsetup {
    pub(crate) fn new(binary: PathBuf, timeout: Duration) -> Self {
        Self {
            tool: ToolCommand::new(binary, timeout),
        }
    }

    pub(crate) fn format(&self, device: &str, version: LuksVersion, key: &[u8]) -> KeywardResult<()> {
        if key.is_empty() {
            return Err(KeywardError::MissingKey(format!(
                "refusing to format {device} with an empty passphrase"
            )));
        }
        let out = self.tool.run(
            &[
                "luksFormat",
                "--batch-mode",
                "--type",
                version.as_str(),
                "--key-file",
                "-",
                device,
            ],
            Some(key),
        )?;
        if out.success() {
            info!("wrote {version} header on {device}");
            return Ok(());
        }
        Err(failure("initialise a LUKS header on", device, &out))
    }

    pub(crate) fn open(&self, device: &str, name: &str, key: &[u8]) -> KeywardResult<()> {
        if dev_mapper_node_exists(name) {
            return Err(KeywardError::Provider(format!(
                "mapping `{name}` is already active under /dev/mapper"
            )));
        }

        let primary = [
            "open", "--type", "luks", "--batch-mode", "--key-file", "-", device, name,
        ];
        let mut out = self.tool.run(&primary, Some(key))?;
        if !out.success() && action_unsupported(&out) {
            let fallback = ["luksOpen", "--batch-mode", "--key-file", "-", device, name];
            out = self.tool.run(&fallback, Some(key))?;
        }

        if out.success() {
            return Ok(());
        }
        if key_rejected(&out) {
            return Err(KeywardError::AuthFailed {
                device: device.to_string(),
            });
        }
        if out.diagnostic_lower().contains("already exists") {
            return Err(KeywardError::Provider(format!(
                "mapping `{name}` already exists; cryptsetup reported: {}",
                out.describe()
            )));
        }
        Err(failure(&format!("open mapping `{name}` from"), device, &out))
    }

    /// Closing a mapping that is not active succeeds.
    pub(crate) fn close(&self, name: &str) -> KeywardResult<()> {
        let mut out = self.tool.run(&["close", name], None)?;
        if !out.success() && action_unsupported(&out) {
            out = self.tool.run(&["luksClose", name], None)?;
        }
        if out.success() || inactive(&out) {
            return Ok(());
        }
        Err(failure("close mapping", name, &out))
    }

    pub(crate) fn is_open(&self, name: &str) -> KeywardResult<bool> {
        if dev_mapper_node_exists(name) {
            return Ok(true);
        }
        let out = self.tool.run(&["status", name], None)?;
        match out.status {
            0 => Ok(true),
            EXIT_WRONG_DEVICE => Ok(false),
            _ if inactive(&out) => Ok(false),
            _ => Err(KeywardError::Provider(format!(
                "cryptsetup status {name} failed: {}",
                out.describe()
            ))),
        }
    }

    pub(crate) fn add_key(
        &self,
        device: &str,
        auth_key: &[u8],
        new_key: &[u8],
        slot: Option<u32>,
    ) -> KeywardResult<u32> {
        let before = self.dump(device)?;
        let new_file = KeyFile::write(new_key)?;
        let new_arg = new_file.path_arg();
        let slot_arg = slot.map(|slot| slot.to_string());

        let mut args = vec!["luksAddKey", "--batch-mode", "--key-file", "-"];
        if let Some(slot_arg) = &slot_arg {
            args.extend(["--key-slot", slot_arg.as_str()]);
        }
        args.extend([device, new_arg.as_str()]);
        let out = self.tool.run(&args, Some(auth_key))?;
        drop(new_file);

        if !out.success() {
            let lower = out.diagnostic_lower();
            if key_rejected(&out) {
                return Err(KeywardError::AuthFailed {
                    device: device.to_string(),
                });
            }
            if let Some(slot) = slot {
                if lower.contains("is full") || lower.contains("already in use") {
                    return Err(KeywardError::Provider(format!(
                        "keyslot {slot} of {device} is already in use"
                    )));
                }
            }
            if slots_exhausted(&lower) {
                return Err(KeywardError::SlotLimitExceeded {
                    device: device.to_string(),
                    max: before.version.max_slots(),
                });
            }
            return Err(failure("add a key to", device, &out));
        }

        if let Some(slot) = slot {
            return Ok(slot);
        }
        let after = self.dump(device)?;
        after
            .slots
            .iter()
            .copied()
            .find(|slot| !before.slots.contains(slot))
            .ok_or_else(|| {
                KeywardError::Provider(format!(
                    "luksAddKey succeeded on {device} but no new keyslot appeared"
                ))
            })
    }

    pub(crate) fn kill_slot(
        &self,
        device: &str,
        slot: u32,
        auth_key: Option<&[u8]>,
    ) -> KeywardResult<()> {
        let slot_arg = slot.to_string();
        let out = match auth_key {
            Some(key) => self.tool.run(
                &["luksKillSlot", "--key-file", "-", device, slot_arg.as_str()],
                Some(key),
            )?,
            // Batch mode skips the "any remaining passphrase" check.
            None => self
                .tool
                .run(&["luksKillSlot", "--batch-mode", device, slot_arg.as_str()], None)?,
        };
        if out.success() {
            debug!("killed keyslot {slot} of {device}");
            return Ok(());
        }
        if slot_inactive(&out) {
            return Err(KeywardError::SlotNotFound {
                device: device.to_string(),
                slot,
            });
        }
        if key_rejected(&out) {
            return Err(KeywardError::AuthFailed {
                device: device.to_string(),
            });
        }
        Err(failure(&format!("remove keyslot {slot} of"), device, &out))
    }

    pub(crate) fn change_key(
        &self,
        device: &str,
        slot: u32,
        old_key: &[u8],
        new_key: &[u8],
    ) -> KeywardResult<()> {
        let slot_arg = slot.to_string();
        let new_file = KeyFile::write(new_key)?;
        let new_arg = new_file.path_arg();
        let out = self.tool.run(
            &[
                "luksChangeKey",
                "--batch-mode",
                "--key-file",
                "-",
                "--key-slot",
                slot_arg.as_str(),
                device,
                new_arg.as_str(),
            ],
            Some(old_key),
        )?;
        drop(new_file);

        if out.success() {
            return Ok(());
        }
        if slot_inactive(&out) {
            return Err(KeywardError::SlotNotFound {
                device: device.to_string(),
                slot,
            });
        }
        if key_rejected(&out) {
            return Err(KeywardError::AuthFailed {
                device: device.to_string(),
            });
        }
        Err(failure(&format!("change keyslot {slot} of"), device, &out))
    }

    pub(crate) fn is_luks(&self, device: &str) -> KeywardResult<bool> {
        let out = self.tool.run(&["isLuks", device], None)?;
        if out.success() {
            return Ok(true);
        }
        if no_header(&out) {
            return Ok(false);
        }
        Err(failure("inspect", device, &out))
    }

    pub(crate) fn uuid(&self, device: &str) -> KeywardResult<String> {
        let out = self.tool.run(&["luksUUID", device], None)?;
        if !out.success() {
            return Err(failure("read the header UUID of", device, &out));
        }
        let uuid = out.stdout_text().trim().to_string();
        if uuid.is_empty() {
            return Err(KeywardError::Provider(format!(
                "cryptsetup luksUUID printed nothing for {device}"
            )));
        }
        Ok(uuid)
    }

    pub(crate) fn dump(&self, device: &str) -> KeywardResult<LuksDump> {
        let out = self.tool.run(&["luksDump", device], None)?;
        if !out.success() {
            return Err(failure("read the header of", device, &out));
        }
        parse_dump(device, &out.stdout_text())
    }

    pub(crate) fn test_key(&self, device: &str, key: &[u8]) -> KeywardResult<Option<u32>> {
        let out = self.tool.run(
            &[
                "open",
                "--test-passphrase",
                "--verbose",
                "--batch-mode",
                "--key-file",
                "-",
                device,
            ],
            Some(key),
        )?;
        if !out.success() {
            if key_rejected(&out) {
                return Ok(None);
            }
            return Err(failure("test a key against", device, &out));
        }
        if let Some(slot) = unlocked_slot(&out) {
            return Ok(Some(slot));
        }

        // Quiet builds do not report the slot; probe each one.
        for slot in self.dump(device)?.slots {
            let slot_arg = slot.to_string();
            let probe = self.tool.run(
                &[
                    "open",
                    "--test-passphrase",
                    "--batch-mode",
                    "--key-slot",
                    slot_arg.as_str(),
                    "--key-file",
                    "-",
                    device,
                ],
                Some(key),
            )?;
            if probe.success() {
                return Ok(Some(slot));
            }
        }
        Err(KeywardError::Provider(format!(
            "key opens {device} but no keyslot accepted it individually"
        )))
    }
}

fn unlocked_slot(out: &Output) -> Option<u32> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"(?i)key slot (\d+) unlocked").expect("valid unlocked-slot regex")
    });
    let text = format!("{}\n{}", out.stdout_text(), out.stderr);
    re.captures(&text)
        .and_then(|caps| caps[1].parse().ok())
}

fn key_rejected(out: &Output) -> bool {
    let lower = out.diagnostic_lower();
    out.status == EXIT_BAD_PASSPHRASE
        || lower.contains("no key available")
        || lower.contains("wrong key")
        || lower.contains("passphrase is incorrect")
        || lower.contains("invalid passphrase")
}

fn slots_exhausted(lower: &str) -> bool {
    lower.contains("all key slots full")
        || lower.contains("no free key slot")
        || lower.contains("no free keyslot")
        || lower.contains("no remaining keyslot")
}

fn slot_inactive(out: &Output) -> bool {
    let lower = out.diagnostic_lower();
    (lower.contains("key slot") || lower.contains("keyslot")) && lower.contains("not active")
}

/// `isLuks` on a readable device without a header.
fn no_header(out: &Output) -> bool {
    let lower = out.diagnostic_lower();
    if permission_denied(&lower) || lower.contains("cannot open device") || lower.contains("no such file") {
        return false;
    }
    out.status == EXIT_WRONG_PARAMETERS || lower.contains("not a valid luks device")
}

fn inactive(out: &Output) -> bool {
    let lower = out.diagnostic_lower();
    lower.contains("is inactive")
        || lower.contains("not active")
        || lower.contains("does not exist")
        || lower.contains("doesn't exist")
}

/// Turn a failed invocation into an error with an operator hint.
fn failure(action: &str, subject: &str, out: &Output) -> KeywardError {
    let lower = out.diagnostic_lower();
    let detail = out.describe();
    if permission_denied(&lower) {
        return KeywardError::Provider(format!(
            "cryptsetup could not {action} `{subject}`: {detail}. This usually requires root"
        ));
    }
    if lower.contains("not a valid luks device") || lower.contains("is not a luks device") {
        return KeywardError::Provider(format!("`{subject}` is not a LUKS device: {detail}"));
    }
    if lower.contains("no such file")
        || lower.contains("cannot open device")
        || lower.contains("not found")
    {
        return KeywardError::Provider(format!(
            "cryptsetup could not access `{subject}` to {action} it: {detail}. Confirm the device is present"
        ));
    }
    if lower.contains("device or resource busy") || lower.contains("is in use") {
        return KeywardError::Provider(format!(
            "`{subject}` is busy; unmount or close it first: {detail}"
        ));
    }
    KeywardError::Provider(format!("cryptsetup failed to {action} `{subject}`: {detail}"))
}
