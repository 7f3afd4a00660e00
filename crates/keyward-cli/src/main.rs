//! keyward command-line interface for keyslot, unlock and table maintenance.

use anyhow::{bail, ensure, Context, Result};
use clap::{Parser, Subcommand};
use keyward_core::{
    config::{looks_like_mapping_name, DEFAULT_CONFIG_PATH},
    logging, spawn_job, DesiredState, DeviceState, DeviceStatus, FormatReport, FormatRequest,
    KeyserverSpec, KeywardConfig, KeywardError, KeywardResult, LeaseRegistry, MountSpec, Options,
    PassphrasePrompt, Progress, Removal, StoredChoice, UnlockPlanner, UnlockRequest,
};
use keyward_luks::{SystemClevisBinder, SystemFilesystemMaker, SystemLuksBackend};
use keyward_provider::{LuksVersion, SlotKind};
use log::warn;
use rpassword::prompt_password;
use schemars::schema_for;
use serde_json::to_string_pretty;
use std::collections::HashSet;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use zeroize::Zeroizing;

type Planner = UnlockPlanner<SystemLuksBackend, SystemClevisBinder, SystemFilesystemMaker>;

fn load_cli_config(path: &Path) -> Result<KeywardConfig> {
    let config = KeywardConfig::load_or_bootstrap(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;

    if config.path != path {
        println!(
            "Using bootstrap configuration at {} (pass --config to override).",
            config.path.display()
        );
    }

    Ok(config)
}

fn build_planner(config: &KeywardConfig) -> Result<Planner> {
    let backend = SystemLuksBackend::from_config(config)?;
    let binder = SystemClevisBinder::from_config(config);
    if !binder.is_available() {
        warn!("clevis is not installed; keyserver slots cannot be used");
    }
    let mkfs = SystemFilesystemMaker::from_config(config);
    Ok(UnlockPlanner::from_config(config, backend, binder, mkfs))
}

/// Top-level command-line options shared by every subcommand.
#[derive(Parser, Debug)]
#[command(
    name = "keyward",
    version,
    about = "LUKS keyslot management and crypttab/fstab reconciliation."
)]
struct Cli {
    /// Path to the keyward configuration file.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show header, keyslots, table entries and unlock state of a device.
    Status {
        /// Encrypted block device (e.g. /dev/sdb1).
        device: String,

        #[arg(long)]
        json: bool,
    },

    /// Inspect and modify keyslots.
    Slots {
        #[command(subcommand)]
        command: SlotCommands,
    },

    /// Open the device, trying keyserver, stored passphrase and prompt in turn.
    Unlock {
        device: String,

        /// Mapping name; defaults to the crypttab name or luks-<uuid>.
        #[arg(long)]
        name: Option<String>,

        /// Passphrase to try before prompting.
        #[arg(long)]
        passphrase: Option<String>,

        #[arg(long)]
        no_keyserver: bool,

        /// Ignore the stored passphrase.
        #[arg(long)]
        no_stored: bool,

        /// Leave noauto on the table entries untouched.
        #[arg(long)]
        no_persist: bool,

        /// Fail instead of asking for a passphrase.
        #[arg(long)]
        no_prompt: bool,
    },

    /// Close the mapping and mark the entries noauto.
    Lock { device: String },

    /// Create a filesystem, re-initialising the LUKS header unless --keep-keys.
    Format {
        device: String,

        #[arg(long)]
        fstype: String,

        #[arg(long)]
        label: Option<String>,

        /// Mapping name written to crypttab.
        #[arg(long)]
        name: Option<String>,

        /// Add an fstab entry for this mount point.
        #[arg(long)]
        mount_point: Option<String>,

        #[arg(long)]
        read_only: bool,

        /// Boot waits for this device (no nofail).
        #[arg(long)]
        boot_critical: bool,

        /// Do not unlock or mount at boot.
        #[arg(long)]
        no_auto: bool,

        /// Write a LUKS1 header instead of the configured default.
        #[arg(long)]
        luks1: bool,

        /// Keep header and keyslots; only recreate the filesystem.
        #[arg(long)]
        keep_keys: bool,

        /// Existing passphrase (needed with --keep-keys on a locked device).
        #[arg(long)]
        old_passphrase: Option<String>,

        /// Passphrase for the fresh header.
        #[arg(long)]
        new_passphrase: Option<String>,

        /// Store the new passphrase for unattended unlock.
        #[arg(long)]
        store_passphrase: bool,

        /// Tang server to bind after formatting.
        #[arg(long)]
        keyserver: Option<String>,

        #[arg(long, requires = "keyserver")]
        thumbprint: Option<String>,

        /// Skip the destruction confirmation.
        #[arg(long)]
        yes: bool,
    },

    /// Manage the passphrase stored for unattended unlock.
    Passphrase {
        #[command(subcommand)]
        command: PassphraseCommands,
    },

    /// Bring crypttab and fstab in line with the requested configuration.
    Configure {
        device: String,

        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        mount_point: Option<String>,

        /// Filesystem type for a new fstab entry.
        #[arg(long)]
        fstype: Option<String>,

        /// Extra mount options (comma separated).
        #[arg(long)]
        options: Option<String>,

        #[arg(long)]
        read_only: bool,

        #[arg(long)]
        boot_critical: bool,

        /// Drop the fstab entry.
        #[arg(long, conflicts_with = "mount_point")]
        no_mount: bool,

        #[arg(long)]
        no_auto: bool,

        /// Print the plan without applying it.
        #[arg(long)]
        dry_run: bool,
    },

    /// Consistency checks on configuration and tables.
    Tables {
        #[command(subcommand)]
        command: TableCommands,
    },

    /// Print the JSON schema of the configuration file.
    Schema,
}

#[derive(Subcommand, Debug)]
enum SlotCommands {
    /// List populated keyslots.
    List {
        device: String,

        #[arg(long)]
        json: bool,
    },

    /// Add a passphrase slot.
    Add {
        device: String,

        /// Passphrase that opens an existing slot.
        #[arg(long)]
        passphrase: Option<String>,

        #[arg(long)]
        new_passphrase: Option<String>,
    },

    /// Bind a slot to a tang keyserver.
    AddKeyserver {
        device: String,

        #[arg(long)]
        url: String,

        /// Trusted advertisement thumbprint; trust on first use when omitted.
        #[arg(long)]
        thumbprint: Option<String>,

        #[arg(long)]
        passphrase: Option<String>,
    },

    /// Remove a slot.
    Remove {
        device: String,
        slot: u32,

        /// Passphrase authorising the removal.
        #[arg(long, conflicts_with = "force")]
        passphrase: Option<String>,

        /// Skip authorisation and last-slot protection.
        #[arg(long)]
        force: bool,

        #[arg(long)]
        yes: bool,
    },

    /// Replace the passphrase in a slot.
    Edit {
        device: String,
        slot: u32,

        #[arg(long)]
        old_passphrase: Option<String>,

        #[arg(long)]
        new_passphrase: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum PassphraseCommands {
    /// Store a passphrase that opens one of the slots.
    Store {
        device: String,

        #[arg(long)]
        passphrase: Option<String>,
    },

    /// Change the stored passphrase together with its slot.
    Change {
        device: String,

        #[arg(long)]
        new_passphrase: Option<String>,
    },

    /// Delete the stored passphrase; boot falls back to prompting.
    Clear { device: String },
}

#[derive(Subcommand, Debug)]
enum TableCommands {
    /// Validate the configuration and cross-check crypttab against fstab.
    Check,
}

/// Asks on the controlling terminal. An empty answer cancels.
struct TerminalPrompt;

impl PassphrasePrompt for TerminalPrompt {
    fn prompt(&self, device: &str, attempt: u32) -> KeywardResult<Option<Zeroizing<Vec<u8>>>> {
        let label = if attempt > 1 {
            format!("Passphrase for {device} (attempt {attempt}, empty to cancel): ")
        } else {
            format!("Passphrase for {device}: ")
        };
        let value = Zeroizing::new(prompt_password(label)?);
        if value.is_empty() {
            return Ok(None);
        }
        Ok(Some(Zeroizing::new(value.as_bytes().to_vec())))
    }
}

fn main() {
    if let Err(err) = run() {
        let code = err
            .downcast_ref::<KeywardError>()
            .map(|err| err.code().as_str())
            .unwrap_or("error");
        eprintln!("error[{code}]: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    logging::init("info");
    let cli = Cli::parse();

    if let Commands::Schema = cli.command {
        let schema = schema_for!(KeywardConfig);
        println!("{}", to_string_pretty(&schema)?);
        return Ok(());
    }

    let config = load_cli_config(&cli.config)?;
    match cli.command {
        Commands::Tables {
            command: TableCommands::Check,
        } => check_tables(&config),
        command => run_device(Arc::new(build_planner(&config)?), command),
    }
}

fn run_device(planner: Arc<Planner>, command: Commands) -> Result<()> {
    let leases = LeaseRegistry::new();

    match command {
        Commands::Status { device, json } => {
            let status = planner.status(&device)?;
            if json {
                println!("{}", to_string_pretty(&status)?);
            } else {
                print_status(&status);
            }
        }

        Commands::Slots { command } => run_slots(&planner, &leases, command)?,

        Commands::Unlock {
            device,
            name,
            passphrase,
            no_keyserver,
            no_stored,
            no_persist,
            no_prompt,
        } => {
            let lease = leases.try_acquire(&device)?;
            let supplied = passphrase.map(secret_bytes);
            let prompt = TerminalPrompt;
            let request = UnlockRequest {
                mapping: name,
                supplied_key: supplied.as_deref().map(Vec::as_slice),
                prompt: (!no_prompt).then_some(&prompt as &dyn PassphrasePrompt),
                use_keyserver: !no_keyserver,
                use_stored: !no_stored,
                persist_activation: !no_persist,
            };
            let report = planner.unlock(&lease, &request)?;
            for warning in &report.warnings {
                warn!("{warning}");
            }
            match report.slot {
                Some(slot) => println!(
                    "Unlocked {} as /dev/mapper/{} via {} (slot {slot}).",
                    report.device, report.mapping, report.strategy
                ),
                None => println!(
                    "Unlocked {} as /dev/mapper/{} via {}.",
                    report.device, report.mapping, report.strategy
                ),
            }
        }

        Commands::Lock { device } => {
            let lease = leases.try_acquire(&device)?;
            planner.lock(&lease)?;
            println!("Locked {device}.");
        }

        Commands::Format {
            device,
            fstype,
            label,
            name,
            mount_point,
            read_only,
            boot_critical,
            no_auto,
            luks1,
            keep_keys,
            old_passphrase,
            new_passphrase,
            store_passphrase,
            keyserver,
            thumbprint,
            yes,
        } => {
            if let Some(name) = &name {
                ensure!(
                    looks_like_mapping_name(name),
                    "`{name}` is not a valid mapping name"
                );
            }
            ensure!(
                !(keep_keys && luks1),
                "--luks1 only applies when the header is re-initialised"
            );
            let what = if keep_keys {
                "all data on the filesystem"
            } else {
                "all keyslots and all data"
            };
            if !yes && !confirm(&format!("This destroys {what} on {device}."))? {
                bail!("aborted");
            }

            let lease = leases.try_acquire(&device)?;
            let old = match old_passphrase {
                Some(value) => Some(secret_bytes(value)),
                None if keep_keys && planner.state(&device)? == DeviceState::Locked => {
                    Some(read_secret(None, &format!("Current passphrase for {device}: "))?)
                }
                None => None,
            };
            let new = if keep_keys {
                None
            } else {
                Some(read_new_secret(new_passphrase, &device)?)
            };

            let mount = mount_point.map(|point| MountSpec {
                read_only,
                boot_critical,
                ..MountSpec::new(point, fstype.clone())
            });
            let keyserver = keyserver.map(|url| KeyserverSpec { url, thumbprint });
            let job_planner = Arc::clone(&planner);
            let job = spawn_job("format", move |progress: &Progress<FormatReport>| {
                progress.report(format!("formatting {} as {fstype}", lease.device()));
                let mut request = FormatRequest::new(fstype);
                request.label = label;
                request.name = name;
                request.mount = mount;
                request.auto_unlock = !no_auto;
                request.version = luks1.then_some(LuksVersion::Luks1);
                request.keep_keys = keep_keys;
                request.old_passphrase = old.as_deref().map(Vec::as_slice);
                request.new_passphrase = new.as_deref().map(Vec::as_slice);
                request.store_passphrase = store_passphrase;
                request.keyserver = keyserver;
                job_planner.format(&lease, &request)
            })?;
            let report = job.wait_with(|line| println!("{line}"))?;
            for warning in &report.warnings {
                warn!("{warning}");
            }
            println!(
                "Formatted {} (UUID {}) as /dev/mapper/{}{}.",
                report.device,
                report.uuid,
                report.mapping,
                if report.reinitialised {
                    " with a fresh header"
                } else {
                    ""
                }
            );
            if let Some(stored) = &report.stored_passphrase {
                println!("Stored passphrase at {}.", stored.path.display());
            }
        }

        Commands::Passphrase { command } => run_passphrase(&planner, &leases, command)?,

        Commands::Configure {
            device,
            name,
            mount_point,
            fstype,
            options,
            read_only,
            boot_critical,
            no_mount,
            no_auto,
            dry_run,
        } => {
            let lease = leases.try_acquire(&device)?;
            let current = planner.current_desired(&device)?;
            let mount = if no_mount {
                None
            } else if let Some(point) = mount_point {
                let fstype = fstype
                    .or_else(|| current.mount.as_ref().map(|mount| mount.fstype.clone()))
                    .context("--fstype is required for a new mount point")?;
                Some(MountSpec {
                    options: options.as_deref().map(Options::parse).unwrap_or_default(),
                    read_only,
                    boot_critical,
                    ..MountSpec::new(point, fstype)
                })
            } else {
                current.mount.clone().map(|mut mount| {
                    if let Some(fstype) = fstype {
                        mount.fstype = fstype;
                    }
                    if let Some(options) = options.as_deref() {
                        mount.options = Options::parse(options);
                    }
                    mount.read_only |= read_only;
                    mount.boot_critical |= boot_critical;
                    mount
                })
            };
            let desired = DesiredState {
                name: name.or(current.name),
                auto_unlock: !no_auto,
                stored: StoredChoice::Keep,
                mount,
            };

            let plan = planner.plan(&lease, &desired)?;
            if plan.is_empty() {
                println!("{device} is already configured.");
                return Ok(());
            }
            for step in plan.describe() {
                println!("  {step}");
            }
            if dry_run {
                println!("Dry run; nothing written.");
                return Ok(());
            }
            let report = planner.execute(&lease, plan)?;
            match report.generation {
                Some(generation) => println!(
                    "Applied {} step(s); tables at generation {generation}.",
                    report.steps.len()
                ),
                None => println!("Applied {} step(s).", report.steps.len()),
            }
        }

        Commands::Tables { .. } | Commands::Schema => bail!("not a device command"),
    }

    Ok(())
}

fn run_slots(planner: &Planner, leases: &LeaseRegistry, command: SlotCommands) -> Result<()> {
    match command {
        SlotCommands::List { device, json } => {
            let slots = planner.slots().list_slots(&device)?;
            if json {
                println!("{}", to_string_pretty(&slots)?);
            } else {
                print_slots(&slots);
            }
        }

        SlotCommands::Add {
            device,
            passphrase,
            new_passphrase,
        } => {
            let lease = leases.try_acquire(&device)?;
            let auth = read_secret(passphrase, &format!("Existing passphrase for {device}: "))?;
            let new = read_new_secret(new_passphrase, &device)?;
            let slot = planner.add_key(&lease, &new, &auth)?;
            println!("Added passphrase in slot {} of {device}.", slot.index);
        }

        SlotCommands::AddKeyserver {
            device,
            url,
            thumbprint,
            passphrase,
        } => {
            let lease = leases.try_acquire(&device)?;
            let auth = read_secret(passphrase, &format!("Existing passphrase for {device}: "))?;
            let slot = planner.add_keyserver(&lease, &url, thumbprint.as_deref(), &auth)?;
            if let SlotKind::Keyserver { thumbprint, .. } = &slot.kind {
                println!(
                    "Bound slot {} of {device} to {url} (thumbprint {thumbprint}).",
                    slot.index
                );
            }
        }

        SlotCommands::Remove {
            device,
            slot,
            passphrase,
            force,
            yes,
        } => {
            let lease = leases.try_acquire(&device)?;
            let outcome = if force {
                if !yes
                    && !confirm(&format!(
                        "Forcibly removing slot {slot} of {device} skips every safety check."
                    ))?
                {
                    bail!("aborted");
                }
                planner.remove_key(&lease, slot, Removal::Force)?
            } else {
                let auth = read_secret(
                    passphrase,
                    &format!("Passphrase authorising removal of slot {slot}: "),
                )?;
                planner.remove_key(&lease, slot, Removal::Key(&auth))?
            };
            println!(
                "Removed slot {} of {device}; {} slot(s) remain ({} keyserver).",
                outcome.removed.index, outcome.remaining, outcome.remaining_keyserver
            );
        }

        SlotCommands::Edit {
            device,
            slot,
            old_passphrase,
            new_passphrase,
        } => {
            let lease = leases.try_acquire(&device)?;
            let old = read_secret(
                old_passphrase,
                &format!("Current passphrase of slot {slot}: "),
            )?;
            let new = read_new_secret(new_passphrase, &device)?;
            let outcome = planner.change_key(&lease, slot, &old, &new)?;
            for warning in &outcome.warnings {
                warn!("{warning}");
            }
            if outcome.relocated {
                println!("Passphrase changed; it now lives in slot {}.", outcome.slot);
            } else {
                println!("Passphrase in slot {} changed.", outcome.slot);
            }
        }
    }
    Ok(())
}

fn run_passphrase(
    planner: &Planner,
    leases: &LeaseRegistry,
    command: PassphraseCommands,
) -> Result<()> {
    match command {
        PassphraseCommands::Store { device, passphrase } => {
            let lease = leases.try_acquire(&device)?;
            let value = read_secret(passphrase, &format!("Passphrase to store for {device}: "))?;
            let info = planner.store_passphrase(&lease, &value)?;
            println!("Stored passphrase at {}.", info.path.display());
        }
        PassphraseCommands::Change {
            device,
            new_passphrase,
        } => {
            let lease = leases.try_acquire(&device)?;
            let new = read_new_secret(new_passphrase, &device)?;
            let outcome = planner.change_stored_passphrase(&lease, &new)?;
            println!(
                "Stored passphrase and slot {} of {device} updated.",
                outcome.slot
            );
        }
        PassphraseCommands::Clear { device } => {
            let lease = leases.try_acquire(&device)?;
            if planner.clear_stored_passphrase(&lease)? {
                println!("Cleared the stored passphrase of {device}; boot will prompt.");
            } else {
                println!("{device} has no stored passphrase.");
            }
        }
    }
    Ok(())
}

/// Validate the config, then cross-check the tables it points at.
fn check_tables(config: &KeywardConfig) -> Result<()> {
    let mut issues = config.validate();
    if issues.is_empty() {
        let store = keyward_core::ConfigStore::from_config(config);
        let vault = keyward_core::PassphraseVault::from_config(config);
        let snapshot = store.load()?;

        let mut names = HashSet::new();
        for entry in snapshot.crypttab.entries() {
            if !names.insert(entry.name.as_str()) {
                issues.push(format!("crypttab: mapping `{}` is listed twice", entry.name));
            }
            if let Some(file) = entry.key.file() {
                if vault.owns(file) && !file.exists() {
                    issues.push(format!(
                        "crypttab: `{}` points at missing key file {}",
                        entry.name,
                        file.display()
                    ));
                }
            }
        }
        for mount in snapshot.fstab.entries() {
            if let Some(mapping) = mount.mapping_name() {
                if !names.contains(mapping) {
                    issues.push(format!(
                        "fstab: {} mounts /dev/mapper/{mapping}, which has no crypttab entry",
                        mount.mount_point
                    ));
                }
            }
        }
    }

    if issues.is_empty() {
        println!("Configuration and tables are consistent.");
        return Ok(());
    }
    for issue in &issues {
        println!("  - {issue}");
    }
    bail!(KeywardError::InvalidConfig(format!(
        "{} issue(s) found",
        issues.len()
    )))
}

fn secret_bytes(value: String) -> Zeroizing<Vec<u8>> {
    let value = Zeroizing::new(value);
    Zeroizing::new(value.as_bytes().to_vec())
}

fn read_secret(flag: Option<String>, prompt: &str) -> Result<Zeroizing<Vec<u8>>> {
    let value = match flag {
        Some(value) => secret_bytes(value),
        None => secret_bytes(prompt_password(prompt)?),
    };
    ensure!(!value.is_empty(), "passphrase must not be empty");
    Ok(value)
}

/// New passphrases are prompted twice unless given on the command line.
fn read_new_secret(flag: Option<String>, device: &str) -> Result<Zeroizing<Vec<u8>>> {
    if let Some(value) = flag {
        return read_secret(Some(value), "");
    }
    let first = read_secret(None, &format!("New passphrase for {device}: "))?;
    let second = read_secret(None, "Repeat new passphrase: ")?;
    ensure!(first == second, "passphrases do not match");
    Ok(first)
}

fn confirm(message: &str) -> Result<bool> {
    print!("{message} Type `yes` to continue: ");
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(answer.trim() == "yes")
}

fn print_slots(slots: &[keyward_provider::KeySlot]) {
    println!("{:<6} {:<12} DETAIL", "SLOT", "KIND");
    for slot in slots {
        match &slot.kind {
            SlotKind::Passphrase => println!("{:<6} {:<12}", slot.index, "passphrase"),
            SlotKind::Keyserver { url, thumbprint } => {
                println!("{:<6} {:<12} {url} ({thumbprint})", slot.index, "keyserver")
            }
        }
    }
}

fn print_status(status: &DeviceStatus) {
    println!("Device:     {}", status.device);
    println!("UUID:       {}", status.uuid);
    println!("Header:     {}", status.version);
    println!("State:      {}", status.state.label());
    if status.failed_attempts > 0 {
        println!("Rejected:   {} key(s) since last unlock", status.failed_attempts);
    }
    match &status.crypttab {
        Some(entry) => println!(
            "crypttab:   {} ({})",
            entry.name,
            if entry.options.is_empty() {
                "-".to_string()
            } else {
                entry.options.to_string()
            }
        ),
        None => println!("crypttab:   -"),
    }
    match &status.fstab {
        Some(entry) => println!(
            "fstab:      {} {} ({})",
            entry.mount_point, entry.fstype, entry.options
        ),
        None => println!("fstab:      -"),
    }
    match &status.stored_passphrase {
        Some(info) => println!(
            "Stored:     {} (updated {})",
            info.path.display(),
            info.modified.format("%Y-%m-%d %H:%M:%S UTC")
        ),
        None => println!("Stored:     -"),
    }
    if status.requires_network {
        println!("Network:    keyserver slots present (_netdev)");
    }
    println!();
    print_slots(&status.slots);
}
