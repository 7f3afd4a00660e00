//! Tang keyserver bindings through `clevis luks`.

use crate::command::{permission_denied, Output, ToolCommand};
use keyward_core::config::{detect_clevis_path, KeywardConfig};
use keyward_core::error::{KeywardError, KeywardResult};
use keyward_provider::{Binding, KeyserverBinder};
use log::{debug, info, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

/// Pin configuration as passed to and printed by `clevis luks`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct TangPin {
    url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    thp: Option<String>,
}

/// [`KeyserverBinder`] backed by the host `clevis` binary and its tang pin.
///
/// Without clevis installed the binder reports no bindings, so passphrase
/// unlock keeps working; binding or recovering fails with `InvalidConfig`.
#[derive(Debug, Clone)]
pub struct SystemClevisBinder {
    clevis: Option<ToolCommand>,
}

impl SystemClevisBinder {
    pub fn new(binary: PathBuf, timeout: Duration) -> Self {
        Self {
            clevis: Some(ToolCommand::new(binary, timeout).timeout_as(KeywardError::Unreachable)),
        }
    }

    pub fn from_config(config: &KeywardConfig) -> Self {
        match config
            .keyserver
            .clevis_path
            .clone()
            .or_else(detect_clevis_path)
        {
            Some(binary) => Self::new(PathBuf::from(binary), config.keyserver_timeout()),
            None => {
                debug!("clevis not found; keyserver slots are unavailable");
                Self { clevis: None }
            }
        }
    }

    pub fn is_available(&self) -> bool {
        self.clevis.is_some()
    }

    fn tool(&self) -> KeywardResult<&ToolCommand> {
        self.clevis.as_ref().ok_or_else(|| {
            KeywardError::InvalidConfig(
                "clevis not found; install clevis-luks or set [keyserver] clevis_path".into(),
            )
        })
    }

    fn list(&self, device: &str) -> KeywardResult<Vec<Binding>> {
        let Some(clevis) = &self.clevis else {
            return Ok(Vec::new());
        };
        let out = clevis.run(&["luks", "list", "-d", device], None)?;
        if !out.success() {
            // clevis exits non-zero when the device simply has no bindings.
            if out.diagnostic().is_empty() || out.diagnostic_lower().contains("no clevis") {
                return Ok(Vec::new());
            }
            return Err(clevis_failure("list bindings of", device, &out));
        }
        Ok(parse_list(&out.stdout_text()))
    }
}

impl KeyserverBinder for SystemClevisBinder {
    type Error = KeywardError;

    fn bind(
        &self,
        device: &str,
        url: &str,
        trusted_thumbprint: Option<&str>,
        existing_key: &[u8],
    ) -> KeywardResult<Binding> {
        let pin = TangPin {
            url: url.to_string(),
            thp: trusted_thumbprint.map(str::to_string),
        };
        let config = serde_json::to_string(&pin)?;
        self.tool()?;
        let before = self.list(device)?;

        let mut args = vec!["luks", "bind", "-d", device, "-k", "-"];
        if trusted_thumbprint.is_none() {
            // Trust on first use; the thumbprint is recorded from the binding.
            args.push("-y");
        }
        args.extend(["tang", config.as_str()]);
        let out = self.tool()?.run(&args, Some(existing_key))?;
        if !out.success() {
            return Err(bind_failure(device, url, &out));
        }

        let binding = self
            .list(device)?
            .into_iter()
            .find(|binding| !before.iter().any(|old| old.slot == binding.slot))
            .ok_or_else(|| {
                KeywardError::Provider(format!(
                    "clevis bound {device} to {url} but no new binding is listed"
                ))
            })?;
        let binding = Binding {
            thumbprint: if binding.thumbprint.is_empty() {
                trusted_thumbprint.unwrap_or_default().to_string()
            } else {
                binding.thumbprint
            },
            ..binding
        };
        if let Some(trusted) = trusted_thumbprint {
            if binding.thumbprint != trusted {
                warn!(
                    "{device}: keyserver {url} bound with thumbprint {} instead of {trusted}",
                    binding.thumbprint
                );
            }
        }
        info!("bound keyslot {} of {device} to {url}", binding.slot);
        Ok(binding)
    }

    fn unbind(&self, device: &str, slot: u32) -> KeywardResult<()> {
        let slot_arg = slot.to_string();
        let out = self.tool()?.run(
            &["luks", "unbind", "-f", "-d", device, "-s", slot_arg.as_str()],
            None,
        )?;
        if out.success() {
            return Ok(());
        }
        let lower = out.diagnostic_lower();
        if lower.contains("not bound") || lower.contains("no binding") {
            return Err(KeywardError::SlotNotFound {
                device: device.to_string(),
                slot,
            });
        }
        Err(clevis_failure(&format!("unbind keyslot {slot} of"), device, &out))
    }

    fn bindings(&self, device: &str) -> KeywardResult<Vec<Binding>> {
        self.list(device)
    }

    fn recover_key(&self, device: &str, slot: u32) -> KeywardResult<Vec<u8>> {
        let slot_arg = slot.to_string();
        let out = self
            .tool()?
            .run(&["luks", "pass", "-d", device, "-s", slot_arg.as_str()], None)?;
        if !out.success() {
            if unreachable(&out.diagnostic_lower()) {
                return Err(KeywardError::Unreachable(format!(
                    "keyserver for {device} slot {slot}: {}",
                    out.describe()
                )));
            }
            return Err(clevis_failure(
                &format!("recover the passphrase of keyslot {slot} of"),
                device,
                &out,
            ));
        }
        if out.stdout.is_empty() {
            return Err(KeywardError::Provider(format!(
                "clevis released an empty passphrase for {device} slot {slot}"
            )));
        }
        Ok(out.stdout.to_vec())
    }
}

fn list_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*(\d+):\s+(\S+)\s+'(.*)'\s*$").expect("valid clevis list regex")
    })
}

/// Parse `clevis luks list` output, keeping only tang pins.
fn parse_list(output: &str) -> Vec<Binding> {
    output
        .lines()
        .filter_map(|line| {
            let caps = list_line_re().captures(line)?;
            if &caps[2] != "tang" {
                return None;
            }
            let slot = caps[1].parse().ok()?;
            let pin: TangPin = serde_json::from_str(&caps[3]).ok()?;
            Some(Binding {
                slot,
                url: pin.url,
                thumbprint: pin.thp.unwrap_or_default(),
            })
        })
        .collect()
}

fn unreachable(lower: &str) -> bool {
    lower.contains("unable to fetch advertisement")
        || lower.contains("error communicating with server")
        || lower.contains("connection refused")
        || lower.contains("could not resolve host")
        || lower.contains("timed out")
        || lower.contains("no route to host")
}

fn bind_failure(device: &str, url: &str, out: &Output) -> KeywardError {
    let lower = out.diagnostic_lower();
    if lower.contains("not trusted")
        || lower.contains("thumbprint")
        || lower.contains("thp")
        || lower.contains("advertisement is untrusted")
    {
        return KeywardError::RejectedByOperator(format!(
            "keyserver {url} did not present the trusted key: {}",
            out.describe()
        ));
    }
    if unreachable(&lower) {
        return KeywardError::Unreachable(format!("{url}: {}", out.describe()));
    }
    if lower.contains("no key available") || lower.contains("invalid passphrase") {
        return KeywardError::AuthFailed {
            device: device.to_string(),
        };
    }
    if lower.contains("no free") || lower.contains("slots full") {
        return KeywardError::Provider(format!(
            "{device} has no free keyslot for a keyserver binding: {}",
            out.describe()
        ));
    }
    clevis_failure(&format!("bind {url} to"), device, out)
}

fn clevis_failure(action: &str, device: &str, out: &Output) -> KeywardError {
    let detail = out.describe();
    if permission_denied(&out.diagnostic_lower()) {
        return KeywardError::Provider(format!(
            "clevis could not {action} `{device}`: {detail}. This usually requires root"
        ));
    }
    KeywardError::Provider(format!("clevis failed to {action} `{device}`: {detail}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_output_keeps_tang_pins() {
        let output = "1: tang '{\"url\":\"http://tang.lan\",\"thp\":\"abc123\"}'\n\
                      2: sss '{\"t\":1,\"pins\":{}}'\n\
                      3: tang '{\"url\":\"http://backup.lan\"}'\n";
        assert_eq!(
            parse_list(output),
            vec![
                Binding {
                    slot: 1,
                    url: "http://tang.lan".into(),
                    thumbprint: "abc123".into(),
                },
                Binding {
                    slot: 3,
                    url: "http://backup.lan".into(),
                    thumbprint: String::new(),
                },
            ]
        );
    }

    #[test]
    fn pin_config_omits_missing_thumbprint() {
        let pin = TangPin {
            url: "http://tang.lan".into(),
            thp: None,
        };
        assert_eq!(
            serde_json::to_string(&pin).unwrap(),
            r#"{"url":"http://tang.lan"}"#
        );
    }

    #[test]
    fn missing_clevis_means_no_bindings() {
        let binder = SystemClevisBinder { clevis: None };
        assert!(!binder.is_available());
        assert!(binder.bindings("/dev/sdb1").unwrap().is_empty());
        assert!(matches!(
            binder.bind("/dev/sdb1", "http://tang.lan", None, b"pass"),
            Err(KeywardError::InvalidConfig(_))
        ));
    }

    #[test]
    fn network_failures_count_as_unreachable() {
        assert!(unreachable("error communicating with server http://tang.lan"));
        assert!(unreachable("curl: (7) failed to connect: connection refused"));
        assert!(!unreachable("invalid passphrase"));
    }
}
