//! `/etc/fstab` records: `<source> <mountpoint> <fstype> <options> [<dump> [<pass>]]`.

use super::{Options, TableRecord};
use serde::Serialize;

/// One line of `/etc/fstab`. Mount points are stored unescaped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountEntry {
    /// Block device or spec being mounted, e.g. `/dev/mapper/data`.
    pub source: String,
    pub mount_point: String,
    pub fstype: String,
    pub options: Options,
    /// dump(8) frequency; 0 when the column is absent.
    pub dump: u32,
    /// fsck pass number: 1 for `/`, 2 for other checked filesystems, 0 to skip.
    pub pass: u32,
}

impl MountEntry {
    pub fn new(
        source: impl Into<String>,
        mount_point: impl Into<String>,
        fstype: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            mount_point: mount_point.into(),
            fstype: fstype.into(),
            options: Options::default(),
            dump: 0,
            pass: 0,
        }
    }

    /// Name of the crypt mapping backing this entry, if the source is one.
    pub fn mapping_name(&self) -> Option<&str> {
        self.source.strip_prefix("/dev/mapper/")
    }
}

impl TableRecord for MountEntry {
    fn parse_line(line: &str) -> Result<Self, String> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            return Err(format!(
                "expected at least 4 fields (source, mountpoint, type, options), found {}",
                fields.len()
            ));
        }
        if fields.len() > 6 {
            return Err(format!("expected at most 6 fields, found {}", fields.len()));
        }

        let number = |idx: usize, name: &str| -> Result<u32, String> {
            match fields.get(idx) {
                Some(raw) => raw
                    .parse::<u32>()
                    .map_err(|_| format!("{name} field must be a number, found `{raw}`")),
                None => Ok(0),
            }
        };

        Ok(Self {
            source: unescape(fields[0]),
            mount_point: unescape(fields[1]),
            fstype: fields[2].to_string(),
            options: Options::parse(fields[3]),
            dump: number(4, "dump")?,
            pass: number(5, "pass")?,
        })
    }

    fn render(&self) -> String {
        let options = if self.options.is_empty() {
            "defaults".to_string()
        } else {
            self.options.to_string()
        };
        format!(
            "{} {} {} {} {} {}",
            escape(&self.source),
            escape(&self.mount_point),
            self.fstype,
            options,
            self.dump,
            self.pass
        )
    }
}

/// Decode the octal escapes fstab uses for whitespace (`\040`, `\011`, ...).
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        if bytes[idx] == b'\\' && idx + 4 <= bytes.len() {
            let digits = &bytes[idx + 1..idx + 4];
            if digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = digits
                    .iter()
                    .fold(0u16, |acc, digit| acc * 8 + u16::from(digit - b'0'));
                if let Ok(byte) = u8::try_from(value) {
                    out.push(byte);
                    idx += 4;
                    continue;
                }
            }
        }
        out.push(bytes[idx]);
        idx += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn escape(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    for ch in field.chars() {
        match ch {
            ' ' => out.push_str("\\040"),
            '\t' => out.push_str("\\011"),
            '\n' => out.push_str("\\012"),
            '\\' => out.push_str("\\134"),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_optional_dump_and_pass() {
        let entry = MountEntry::parse_line("/dev/mapper/data /srv/data ext4 defaults").unwrap();
        assert_eq!((entry.dump, entry.pass), (0, 0));
        assert_eq!(entry.mapping_name(), Some("data"));

        let entry = MountEntry::parse_line("UUID=1234 / ext4 errors=remount-ro 0 1").unwrap();
        assert_eq!(entry.pass, 1);
        assert_eq!(entry.mapping_name(), None);
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(MountEntry::parse_line("/dev/sda1 /boot ext4").is_err());
        assert!(MountEntry::parse_line("/dev/sda1 /boot ext4 defaults x 0").is_err());
        assert!(MountEntry::parse_line("a b c d 0 0 extra").is_err());
    }

    #[test]
    fn mount_points_with_spaces_round_trip() {
        let entry =
            MountEntry::parse_line("/dev/mapper/media /mnt/My\\040Files ext4 nofail 0 2").unwrap();
        assert_eq!(entry.mount_point, "/mnt/My Files");
        assert_eq!(
            entry.render(),
            "/dev/mapper/media /mnt/My\\040Files ext4 nofail 0 2"
        );
    }

    #[test]
    fn empty_options_render_as_defaults() {
        let entry = MountEntry::new("/dev/mapper/x", "/x", "xfs");
        assert_eq!(entry.render(), "/dev/mapper/x /x xfs defaults 0 0");
    }
}
