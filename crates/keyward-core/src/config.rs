//! Configuration model and helpers used by keyward services.

use crate::error::{KeywardError, KeywardResult};
use directories_next::ProjectDirs;
use keyward_provider::LuksVersion;
use log::{info, warn};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/keyward.toml";
const KEY_DIR_ENV: &str = "KEYWARD_KEY_DIR";
const BOOTSTRAP_FILE_NAME: &str = "keyward.toml";
const APP_QUALIFIER: &str = "io";
const APP_ORGANIZATION: &str = "Keyward";
const APP_NAME: &str = "keyward";
pub(crate) const KNOWN_CRYPTSETUP_PATHS: &[&str] = &[
    "/usr/sbin/cryptsetup",
    "/usr/bin/cryptsetup",
    "/sbin/cryptsetup",
    "/bin/cryptsetup",
    "/usr/local/sbin/cryptsetup",
];
pub(crate) const KNOWN_CLEVIS_PATHS: &[&str] = &[
    "/usr/bin/clevis",
    "/bin/clevis",
    "/usr/local/bin/clevis",
];

pub(crate) fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
}

pub(crate) fn detect_binary_path(candidates: &[&str]) -> Option<String> {
    candidates
        .iter()
        .map(Path::new)
        .find(|path| path.exists())
        .map(|path| path.to_string_lossy().into_owned())
}

pub fn detect_cryptsetup_path() -> Option<String> {
    detect_binary_path(KNOWN_CRYPTSETUP_PATHS)
}

pub fn detect_clevis_path() -> Option<String> {
    detect_binary_path(KNOWN_CLEVIS_PATHS)
}

pub fn default_config_path() -> &'static str {
    DEFAULT_CONFIG_PATH
}

/// Lightweight sanity check for device-mapper names.
pub fn looks_like_mapping_name(name: &str) -> bool {
    let trimmed = name.trim();
    !trimmed.is_empty()
        && trimmed.len() <= 127
        && !trimmed.starts_with('-')
        && trimmed
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.' | '+'))
}

fn render_bootstrap_template() -> String {
    let cryptsetup =
        detect_cryptsetup_path().unwrap_or_else(|| "/usr/sbin/cryptsetup".to_string());
    let clevis = detect_clevis_path().unwrap_or_else(|| "/usr/bin/clevis".to_string());

    format!(
        "# Auto-generated keyward configuration bootstrap.\n\n[tables]\ncrypttab_path = \"/etc/crypttab\"\nfstab_path = \"/etc/fstab\"\n\n[vault]\n# Stored passphrases land in <key_dir>/<prefix>-<luks uuid>.\nkey_dir = \"/etc/luks-keys\"\nprefix = \"luks\"\n\n[luks]\ncryptsetup_path = \"{cryptsetup}\"\ndefault_version = \"luks2\"\ntimeout_secs = 120\n\n[keyserver]\nclevis_path = \"{clevis}\"\n# Slow keyservers fall back to local passphrases after this many seconds.\ntimeout_secs = 10\n\n[mount]\nnofail_secondary = true\n"
    )
}

pub fn bootstrap_template() -> String {
    render_bootstrap_template()
}

/// Locations of the crypt-unlock and mount tables.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TablesCfg {
    #[serde(default = "default_crypttab_path")]
    pub crypttab_path: String,

    #[serde(default = "default_fstab_path")]
    pub fstab_path: String,
}

fn default_crypttab_path() -> String {
    "/etc/crypttab".to_string()
}

fn default_fstab_path() -> String {
    "/etc/fstab".to_string()
}

impl Default for TablesCfg {
    fn default() -> Self {
        Self {
            crypttab_path: default_crypttab_path(),
            fstab_path: default_fstab_path(),
        }
    }
}

/// Where stored passphrases for unattended unlock live.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct VaultCfg {
    #[serde(default = "default_key_dir")]
    pub key_dir: String,

    #[serde(default = "default_key_prefix")]
    pub prefix: String,
}

fn default_key_dir() -> String {
    "/etc/luks-keys".to_string()
}

fn default_key_prefix() -> String {
    "luks".to_string()
}

impl Default for VaultCfg {
    fn default() -> Self {
        Self {
            key_dir: default_key_dir(),
            prefix: default_key_prefix(),
        }
    }
}

/// `cryptsetup` integration knobs.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct LuksCfg {
    #[serde(default)]
    pub cryptsetup_path: Option<String>,

    #[serde(default = "default_luks_version")]
    #[schemars(with = "String")]
    pub default_version: LuksVersion,

    #[serde(default = "default_luks_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_luks_version() -> LuksVersion {
    LuksVersion::Luks2
}

fn default_luks_timeout_secs() -> u64 {
    120
}

impl Default for LuksCfg {
    fn default() -> Self {
        Self {
            cryptsetup_path: None,
            default_version: default_luks_version(),
            timeout_secs: default_luks_timeout_secs(),
        }
    }
}

/// Network-bound unlock (Clevis/Tang) integration knobs.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct KeyserverCfg {
    #[serde(default)]
    pub clevis_path: Option<String>,

    #[serde(default = "default_keyserver_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_keyserver_timeout_secs() -> u64 {
    10
}

impl Default for KeyserverCfg {
    fn default() -> Self {
        Self {
            clevis_path: None,
            timeout_secs: default_keyserver_timeout_secs(),
        }
    }
}

/// Mount readiness defaults.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MountCfg {
    /// Add `nofail` to filesystems that are not boot critical.
    #[serde(default = "default_true")]
    pub nofail_secondary: bool,
}

fn default_true() -> bool {
    true
}

impl Default for MountCfg {
    fn default() -> Self {
        Self {
            nofail_secondary: true,
        }
    }
}

/// Top-level configuration snapshot loaded from disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct KeywardConfig {
    #[serde(default)]
    pub tables: TablesCfg,

    #[serde(default)]
    pub vault: VaultCfg,

    #[serde(default)]
    pub luks: LuksCfg,

    #[serde(default)]
    pub keyserver: KeyserverCfg,

    #[serde(default)]
    pub mount: MountCfg,

    #[serde(skip)]
    pub path: PathBuf,

    #[serde(skip)]
    pub format: ConfigFormat,
}

/// Tracks whether we parsed TOML or YAML so writes preserve format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConfigFormat {
    #[default]
    Toml,
    Yaml,
}

impl KeywardConfig {
    /// Return the canonical system-wide configuration path.
    pub fn default_path() -> &'static Path {
        Path::new(DEFAULT_CONFIG_PATH)
    }

    /// Resolve the per-user configuration path used for bootstrapping.
    pub fn user_config_path() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().join(BOOTSTRAP_FILE_NAME))
    }

    /// Load configuration from disk, creating a bootstrap copy when missing.
    ///
    /// When the caller asks for the global default and the process cannot
    /// create it, a per-user configuration is written instead.
    pub fn load_or_bootstrap<P: AsRef<Path>>(path: P) -> KeywardResult<Self> {
        let target = path.as_ref();
        if target.exists() {
            return Self::load(target);
        }

        match ensure_bootstrap_file(target) {
            Ok(created) => {
                if created {
                    info!("keyward config bootstrap created at {}", target.display());
                }
                Self::load(target)
            }
            Err(err) => {
                if target != Self::default_path() {
                    return Err(KeywardError::InvalidConfig(format!(
                        "failed to initialise configuration at {}: {err}",
                        target.display()
                    )));
                }

                let user_path = Self::user_config_path().ok_or_else(|| {
                    KeywardError::InvalidConfig(
                        "unable to determine user configuration directory; create /etc/keyward.toml manually"
                            .to_string(),
                    )
                })?;

                let created_user = ensure_bootstrap_file(&user_path).map_err(|io_err| {
                    KeywardError::InvalidConfig(format!(
                        "failed to prepare bootstrap configuration at {}: {io_err}",
                        user_path.display()
                    ))
                })?;
                if created_user {
                    info!("keyward config bootstrap created at {}", user_path.display());
                }

                warn!(
                    "configuration missing at {}; using per-user bootstrap at {}",
                    target.display(),
                    user_path.display()
                );
                Self::load(&user_path)
            }
        }
    }

    /// Read a config file from disk and detect its format.
    pub fn load<P: AsRef<Path>>(path: P) -> KeywardResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let is_yaml = matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some(ext) if ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml")
        );
        let mut cfg = if is_yaml {
            serde_yaml::from_str::<Self>(&contents)?
        } else {
            toml::from_str::<Self>(&contents)?
        };

        cfg.path = path.to_path_buf();
        cfg.format = if is_yaml {
            ConfigFormat::Yaml
        } else {
            ConfigFormat::Toml
        };

        let issues = cfg.validate();
        if let Some(first) = issues.first() {
            return Err(KeywardError::InvalidConfig(first.clone()));
        }
        Ok(cfg)
    }

    /// Perform a best-effort validation pass and return human-readable issues.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        for (field, value) in [
            ("tables.crypttab_path", &self.tables.crypttab_path),
            ("tables.fstab_path", &self.tables.fstab_path),
            ("vault.key_dir", &self.vault.key_dir),
        ] {
            if value.trim().is_empty() {
                issues.push(format!("{field} must not be empty"));
            } else if !value.starts_with('/') {
                issues.push(format!("{field} must be an absolute path (got {value})"));
            }
        }

        let prefix = self.vault.prefix.trim();
        if prefix.is_empty() || prefix.contains('/') {
            issues.push("vault.prefix must be a non-empty file name prefix".to_string());
        }

        if self.luks.timeout_secs == 0 {
            issues.push("luks.timeout_secs must be greater than 0".to_string());
        }
        if self.keyserver.timeout_secs == 0 {
            issues.push("keyserver.timeout_secs must be greater than 0".to_string());
        }

        issues
    }

    pub fn crypttab_path(&self) -> PathBuf {
        PathBuf::from(&self.tables.crypttab_path)
    }

    pub fn fstab_path(&self) -> PathBuf {
        PathBuf::from(&self.tables.fstab_path)
    }

    /// Resolve the stored-passphrase directory, honouring `KEYWARD_KEY_DIR`.
    pub fn key_dir(&self) -> PathBuf {
        if let Ok(override_path) = env::var(KEY_DIR_ENV) {
            if !override_path.is_empty() {
                return PathBuf::from(override_path);
            }
        }
        PathBuf::from(&self.vault.key_dir)
    }

    pub fn luks_timeout(&self) -> Duration {
        Duration::from_secs(self.luks.timeout_secs)
    }

    pub fn keyserver_timeout(&self) -> Duration {
        Duration::from_secs(self.keyserver.timeout_secs)
    }

    /// Persist the configuration back to its original on-disk format.
    pub fn save(&self) -> KeywardResult<()> {
        let payload = match self.format {
            ConfigFormat::Toml => toml::to_string_pretty(self)?,
            ConfigFormat::Yaml => serde_yaml::to_string(self)?,
        };
        fs::write(&self.path, payload)?;
        Ok(())
    }
}

fn ensure_bootstrap_file(path: &Path) -> io::Result<bool> {
    if path.exists() {
        return Ok(false);
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    match OpenOptions::new().create_new(true).write(true).open(path) {
        Ok(mut file) => {
            file.write_all(bootstrap_template().as_bytes())?;
            file.flush()?;
            #[cfg(unix)]
            {
                let mode = if path.starts_with("/etc/") {
                    0o640
                } else {
                    0o600
                };
                fs::set_permissions(path, PermissionsExt::from_mode(mode))?;
            }
            Ok(true)
        }
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(err),
    }
}
