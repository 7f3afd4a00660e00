use super::*;
use crate::audit::test_support::AuditRootGuard;
use crate::lease::LeaseRegistry;
use crate::tables::KeySource;
use crate::testing::{FakeBinder, FakeLuks, FakeMkfs};
use std::fs;
use tempfile::TempDir;

const DEV: &str = "/dev/sdb1";
const PASS: &[u8] = b"correct horse";

struct Harness {
    _dir: TempDir,
    luks: FakeLuks,
    binder: FakeBinder,
    mkfs: FakeMkfs,
    leases: LeaseRegistry,
    planner: UnlockPlanner<FakeLuks, FakeBinder, FakeMkfs>,
}

impl Harness {
    fn new(version: LuksVersion) -> Self {
        let dir = TempDir::new().unwrap();
        let luks = FakeLuks::with_volume(DEV, version, PASS);
        let binder = FakeBinder::new(luks.clone());
        let mkfs = FakeMkfs::default();
        let planner = UnlockPlanner::new(
            luks.clone(),
            binder.clone(),
            mkfs.clone(),
            ConfigStore::new(dir.path().join("crypttab"), dir.path().join("fstab")),
            PassphraseVault::new(dir.path().join("keys"), "luks"),
        );
        Self {
            _dir: dir,
            luks,
            binder,
            mkfs,
            leases: LeaseRegistry::new(),
            planner,
        }
    }

    fn uuid(&self) -> String {
        self.luks.uuid(DEV).unwrap()
    }

    fn crypt_entry(&self) -> Option<CryptEntry> {
        self.planner
            .tables()
            .query_device(&format!("UUID={}", self.uuid()))
            .unwrap()
    }

    fn mount_entry(&self, point: &str) -> Option<MountEntry> {
        self.planner.tables().query_mountpoint(point).unwrap()
    }

    /// Write crypttab/fstab entries named `data` mounted at `/srv/data`.
    fn configure(&self) {
        let lease = self.leases.acquire(DEV);
        let desired = DesiredState {
            name: Some("data".into()),
            mount: Some(MountSpec::new("/srv/data", "ext4")),
            ..DesiredState::default()
        };
        let plan = self.planner.plan(&lease, &desired).unwrap();
        self.planner.execute(&lease, plan).unwrap();
    }
}

struct ScriptedPrompt {
    answers: Mutex<Vec<&'static [u8]>>,
}

impl ScriptedPrompt {
    fn new(answers: &[&'static [u8]]) -> Self {
        let mut answers = answers.to_vec();
        answers.reverse();
        Self {
            answers: Mutex::new(answers),
        }
    }
}

impl PassphrasePrompt for ScriptedPrompt {
    fn prompt(&self, _device: &str, _attempt: u32) -> KeywardResult<Option<Zeroizing<Vec<u8>>>> {
        Ok(self
            .answers
            .lock()
            .unwrap()
            .pop()
            .map(|answer| Zeroizing::new(answer.to_vec())))
    }
}

#[test]
fn added_passphrase_unlocks_device_without_tables() {
    let h = Harness::new(LuksVersion::Luks2);
    let lease = h.leases.acquire(DEV);
    h.planner.add_key(&lease, b"second", PASS).unwrap();

    let report = h
        .planner
        .unlock(&lease, &UnlockRequest::with_key(b"second"))
        .unwrap();
    assert_eq!(report.strategy, KeyStrategy::SuppliedKey);
    assert_eq!(report.mapping, format!("luks-{}", h.uuid()));
    assert_eq!(
        h.planner.state(DEV).unwrap(),
        DeviceState::Unlocked {
            mapping: report.mapping.clone()
        }
    );
    assert_eq!(h.luks.mapping(&report.mapping).as_deref(), Some(DEV));
}

#[test]
fn wrong_key_fails_auth_and_counts_attempts() {
    let h = Harness::new(LuksVersion::Luks2);
    let lease = h.leases.acquire(DEV);
    assert!(matches!(
        h.planner.unlock(&lease, &UnlockRequest::with_key(b"wrong")),
        Err(KeywardError::AuthFailed { .. })
    ));
    assert_eq!(h.planner.attempts(DEV), 1);
    assert_eq!(h.planner.state(DEV).unwrap(), DeviceState::Locked);

    let report = h
        .planner
        .unlock(&lease, &UnlockRequest::with_key(PASS))
        .unwrap();
    assert_eq!(report.failed_attempts, 1);
    assert_eq!(h.planner.attempts(DEV), 0);
}

#[test]
fn nothing_to_try_is_no_usable_key() {
    let h = Harness::new(LuksVersion::Luks2);
    let lease = h.leases.acquire(DEV);
    assert!(matches!(
        h.planner.unlock(&lease, &UnlockRequest::default()),
        Err(KeywardError::NoUsableKey { .. })
    ));
    assert_eq!(h.planner.state(DEV).unwrap(), DeviceState::Locked);
}

#[test]
fn unreachable_keyserver_falls_back_to_passphrase() {
    let h = Harness::new(LuksVersion::Luks2);
    let lease = h.leases.acquire(DEV);
    h.planner
        .add_keyserver(&lease, "http://tang.lan", None, PASS)
        .unwrap();
    h.binder.set_reachable(false);

    let report = h
        .planner
        .unlock(&lease, &UnlockRequest::with_key(PASS))
        .unwrap();
    assert_eq!(report.strategy, KeyStrategy::SuppliedKey);
    assert_eq!(report.attempts[0].strategy, KeyStrategy::Keyserver);
    assert_eq!(report.attempts[0].outcome, AttemptOutcome::Unavailable);
    assert_eq!(h.planner.attempts(DEV), 0);
}

#[test]
fn failed_binding_listing_falls_through_to_supplied_key() {
    let h = Harness::new(LuksVersion::Luks2);
    let lease = h.leases.acquire(DEV);
    h.planner
        .add_keyserver(&lease, "http://tang.lan", None, PASS)
        .unwrap();
    h.binder.set_listing_fails(true);

    let report = h
        .planner
        .unlock(&lease, &UnlockRequest::with_key(PASS))
        .unwrap();
    assert_eq!(report.strategy, KeyStrategy::SuppliedKey);
    assert_eq!(report.attempts[0].strategy, KeyStrategy::Keyserver);
    assert_eq!(report.attempts[0].outcome, AttemptOutcome::Unavailable);
    assert!(report.attempts[0]
        .detail
        .as_deref()
        .is_some_and(|detail| detail.contains("timed out")));
}

#[test]
fn unreadable_stored_passphrase_falls_through_to_supplied_key() {
    let h = Harness::new(LuksVersion::Luks2);
    let lease = h.leases.acquire(DEV);
    // A directory in place of the key file makes the read fail.
    fs::create_dir_all(h.planner.vault().path_for(&h.uuid())).unwrap();

    let report = h
        .planner
        .unlock(&lease, &UnlockRequest::with_key(PASS))
        .unwrap();
    assert_eq!(report.strategy, KeyStrategy::SuppliedKey);
    assert!(report.attempts.iter().any(|attempt| {
        attempt.strategy == KeyStrategy::StoredPassphrase
            && attempt.outcome == AttemptOutcome::Unavailable
            && attempt.detail.is_some()
    }));
}

#[test]
fn unreachable_keyserver_falls_back_to_stored_passphrase() {
    let h = Harness::new(LuksVersion::Luks2);
    let lease = h.leases.acquire(DEV);
    h.planner
        .add_keyserver(&lease, "http://tang.lan", None, PASS)
        .unwrap();
    h.planner.store_passphrase(&lease, PASS).unwrap();
    h.binder.set_reachable(false);

    let report = h
        .planner
        .unlock(&lease, &UnlockRequest::default())
        .unwrap();
    assert_eq!(report.strategy, KeyStrategy::StoredPassphrase);
    assert_eq!(report.attempts[0].strategy, KeyStrategy::Keyserver);
    assert_eq!(report.attempts[0].outcome, AttemptOutcome::Unavailable);
    assert_eq!(h.planner.attempts(DEV), 0);
}

#[test]
fn reachable_keyserver_unlocks_first() {
    let h = Harness::new(LuksVersion::Luks2);
    let lease = h.leases.acquire(DEV);
    let slot = h
        .planner
        .add_keyserver(&lease, "http://tang.lan", None, PASS)
        .unwrap();

    let report = h
        .planner
        .unlock(&lease, &UnlockRequest::with_key(PASS))
        .unwrap();
    assert_eq!(report.strategy, KeyStrategy::Keyserver);
    assert_eq!(report.slot, Some(slot.index));
}

#[test]
fn prompt_is_retried_until_the_right_passphrase() {
    let h = Harness::new(LuksVersion::Luks2);
    let lease = h.leases.acquire(DEV);
    let prompt = ScriptedPrompt::new(&[b"typo", PASS]);
    let request = UnlockRequest {
        prompt: Some(&prompt),
        ..UnlockRequest::default()
    };

    let report = h.planner.unlock(&lease, &request).unwrap();
    assert_eq!(report.strategy, KeyStrategy::Prompt);
    assert_eq!(report.failed_attempts, 1);
}

#[test]
fn cancelled_prompt_after_rejection_is_auth_failure() {
    let h = Harness::new(LuksVersion::Luks2);
    let lease = h.leases.acquire(DEV);
    let prompt = ScriptedPrompt::new(&[b"typo"]);
    let request = UnlockRequest {
        prompt: Some(&prompt),
        ..UnlockRequest::default()
    };
    assert!(matches!(
        h.planner.unlock(&lease, &request),
        Err(KeywardError::AuthFailed { .. })
    ));
}

#[test]
fn lock_sets_noauto_and_unlock_clears_it() {
    let h = Harness::new(LuksVersion::Luks2);
    h.configure();
    assert_eq!(h.crypt_entry().unwrap().options.to_string(), "nofail");

    let lease = h.leases.acquire(DEV);
    let report = h
        .planner
        .unlock(&lease, &UnlockRequest::with_key(PASS))
        .unwrap();
    assert_eq!(report.mapping, "data");

    h.planner.lock(&lease).unwrap();
    assert_eq!(h.planner.state(DEV).unwrap(), DeviceState::Locked);
    assert!(h.crypt_entry().unwrap().options.contains("noauto"));
    assert!(h
        .mount_entry("/srv/data")
        .unwrap()
        .options
        .contains("noauto"));

    h.planner
        .unlock(&lease, &UnlockRequest::with_key(PASS))
        .unwrap();
    assert!(!h.crypt_entry().unwrap().options.contains("noauto"));
    assert!(!h
        .mount_entry("/srv/data")
        .unwrap()
        .options
        .contains("noauto"));
}

#[test]
fn lock_requires_unlocked_device() {
    let h = Harness::new(LuksVersion::Luks2);
    let lease = h.leases.acquire(DEV);
    assert!(matches!(
        h.planner.lock(&lease),
        Err(KeywardError::InvalidState { action: "lock", .. })
    ));
}

#[test]
fn keyserver_slots_drive_netdev() {
    let _audit = AuditRootGuard::new();
    let h = Harness::new(LuksVersion::Luks2);
    h.configure();
    let lease = h.leases.acquire(DEV);

    let slot = h
        .planner
        .add_keyserver(&lease, "http://tang.lan", None, PASS)
        .unwrap();
    assert_eq!(
        h.crypt_entry().unwrap().options.to_string(),
        "nofail,_netdev"
    );
    assert!(h
        .mount_entry("/srv/data")
        .unwrap()
        .options
        .contains("_netdev"));

    let outcome = h
        .planner
        .remove_key(&lease, slot.index, Removal::Key(PASS))
        .unwrap();
    assert_eq!(outcome.remaining_keyserver, 0);
    assert_eq!(h.crypt_entry().unwrap().options.to_string(), "nofail");
}

#[test]
fn last_slot_removal_is_refused_and_state_kept() {
    let h = Harness::new(LuksVersion::Luks2);
    let lease = h.leases.acquire(DEV);
    assert!(matches!(
        h.planner.remove_key(&lease, 0, Removal::Key(PASS)),
        Err(KeywardError::LastSlotProtected { .. })
    ));
    assert_eq!(
        h.planner.slots().list_slots(DEV).unwrap(),
        vec![KeySlot::passphrase(0)]
    );
    h.planner
        .unlock(&lease, &UnlockRequest::with_key(PASS))
        .unwrap();
}

#[test]
fn removing_the_stored_passphrase_slot_clears_the_vault() {
    let h = Harness::new(LuksVersion::Luks2);
    let lease = h.leases.acquire(DEV);
    h.planner.add_key(&lease, b"unattended", PASS).unwrap();
    let info = h.planner.store_passphrase(&lease, b"unattended").unwrap();
    assert_eq!(
        h.crypt_entry().unwrap().key,
        KeySource::File(info.path.clone())
    );

    h.planner
        .remove_key(&lease, 1, Removal::Key(b"unattended"))
        .unwrap();
    assert!(!info.path.exists());
    assert_eq!(h.crypt_entry().unwrap().key, KeySource::Prompt);
}

#[test]
fn change_key_keeps_matching_stored_passphrase_in_sync() {
    let h = Harness::new(LuksVersion::Luks1);
    let lease = h.leases.acquire(DEV);
    h.planner.store_passphrase(&lease, PASS).unwrap();

    h.planner.change_key(&lease, 0, PASS, b"rotated").unwrap();
    let uuid = h.uuid();
    assert_eq!(
        h.planner.vault().read(&uuid).unwrap().unwrap().as_slice(),
        b"rotated"
    );

    h.planner.change_stored_passphrase(&lease, b"again").unwrap();
    assert_eq!(
        h.planner.slots().verify_key(DEV, b"again").unwrap(),
        Some(0)
    );
    assert_eq!(
        h.planner.vault().read(&uuid).unwrap().unwrap().as_slice(),
        b"again"
    );
}

#[test]
fn store_passphrase_rejects_keys_that_open_nothing() {
    let h = Harness::new(LuksVersion::Luks2);
    let lease = h.leases.acquire(DEV);
    assert!(matches!(
        h.planner.store_passphrase(&lease, b"not a key"),
        Err(KeywardError::AuthFailed { .. })
    ));
    assert!(h.planner.vault().read(&h.uuid()).unwrap().is_none());
}

#[test]
fn clear_stored_passphrase_falls_back_to_prompt() {
    let h = Harness::new(LuksVersion::Luks2);
    let lease = h.leases.acquire(DEV);
    h.planner.store_passphrase(&lease, PASS).unwrap();
    assert!(h.planner.clear_stored_passphrase(&lease).unwrap());
    assert_eq!(h.crypt_entry().unwrap().key, KeySource::Prompt);
    assert!(matches!(
        h.planner.unlock(&lease, &UnlockRequest::default()),
        Err(KeywardError::NoUsableKey { .. })
    ));
}

#[test]
fn converged_device_plans_nothing() {
    let h = Harness::new(LuksVersion::Luks2);
    h.configure();
    let lease = h.leases.acquire(DEV);
    let current = h.planner.current_desired(DEV).unwrap();
    assert_eq!(current.name.as_deref(), Some("data"));
    assert!(h.planner.plan(&lease, &current).unwrap().is_empty());

    let report = h
        .planner
        .execute(&lease, h.planner.plan(&lease, &current).unwrap())
        .unwrap();
    assert!(report.generation.is_none());
}

#[test]
fn plan_puts_vault_steps_before_tables() {
    let h = Harness::new(LuksVersion::Luks2);
    let lease = h.leases.acquire(DEV);
    let desired = DesiredState {
        stored: StoredChoice::Store(PASS),
        mount: Some(MountSpec::new("/srv/data", "xfs")),
        ..DesiredState::default()
    };
    let plan = h.planner.plan(&lease, &desired).unwrap();
    assert!(matches!(
        plan.steps(),
        [PlanStep::StorePassphrase { .. }, PlanStep::UpdateTables(_)]
    ));
}

#[test]
fn failed_table_write_rolls_back_stored_passphrase() {
    let h = Harness::new(LuksVersion::Luks2);
    let lease = h.leases.acquire(DEV);
    let desired = DesiredState {
        stored: StoredChoice::Store(PASS),
        ..DesiredState::default()
    };
    let plan = h.planner.plan(&lease, &desired).unwrap();

    fs::write(h.planner.tables().crypttab_path(), "# edited by hand\n").unwrap();
    assert!(matches!(
        h.planner.execute(&lease, plan),
        Err(KeywardError::Conflict { .. })
    ));
    assert!(h.planner.vault().read(&h.uuid()).unwrap().is_none());
    assert_eq!(
        fs::read_to_string(h.planner.tables().crypttab_path()).unwrap(),
        "# edited by hand\n"
    );
}

#[test]
fn plan_refuses_mapping_names_used_elsewhere() {
    let h = Harness::new(LuksVersion::Luks2);
    let mut diff = h.planner.tables().load().unwrap().diff();
    diff.upsert_crypt(CryptEntry::new("data", "UUID=11111111-2222-4333-8444-555555555555"));
    h.planner.tables().apply(&diff).unwrap();

    let lease = h.leases.acquire(DEV);
    let desired = DesiredState {
        name: Some("data".into()),
        ..DesiredState::default()
    };
    assert!(matches!(
        h.planner.plan(&lease, &desired),
        Err(KeywardError::InvalidConfig(_))
    ));
}

#[test]
fn plan_refuses_mount_points_used_by_other_devices() {
    let h = Harness::new(LuksVersion::Luks2);
    h.luks.add_volume("/dev/sdc1", LuksVersion::Luks2, b"other key");
    {
        let other = h.leases.acquire("/dev/sdc1");
        let desired = DesiredState {
            name: Some("archive".into()),
            mount: Some(MountSpec::new("/srv/data", "ext4")),
            ..DesiredState::default()
        };
        let plan = h.planner.plan(&other, &desired).unwrap();
        h.planner.execute(&other, plan).unwrap();
    }

    let lease = h.leases.acquire(DEV);
    let desired = DesiredState {
        name: Some("data".into()),
        mount: Some(MountSpec::new("/srv/data", "xfs")),
        ..DesiredState::default()
    };
    assert!(matches!(
        h.planner.plan(&lease, &desired),
        Err(KeywardError::InvalidConfig(_))
    ));
    let mount = h.mount_entry("/srv/data").unwrap();
    assert_eq!(mount.source, "/dev/mapper/archive");
    assert_eq!(mount.fstype, "ext4");
}

#[test]
fn renamed_mapping_keeps_its_own_mount_point() {
    let h = Harness::new(LuksVersion::Luks2);
    h.configure();
    let lease = h.leases.acquire(DEV);
    let desired = DesiredState {
        name: Some("vault".into()),
        mount: Some(MountSpec::new("/srv/data", "ext4")),
        ..DesiredState::default()
    };
    let plan = h.planner.plan(&lease, &desired).unwrap();
    h.planner.execute(&lease, plan).unwrap();
    assert_eq!(h.mount_entry("/srv/data").unwrap().source, "/dev/mapper/vault");
}

#[test]
fn clearing_stored_passphrase_rewrites_tables_before_deleting_the_file() {
    let h = Harness::new(LuksVersion::Luks2);
    let lease = h.leases.acquire(DEV);
    let info = h.planner.store_passphrase(&lease, PASS).unwrap();
    let desired = DesiredState {
        stored: StoredChoice::Clear,
        ..DesiredState::default()
    };

    let plan = h.planner.plan(&lease, &desired).unwrap();
    assert!(matches!(
        plan.steps(),
        [PlanStep::UpdateTables(_), PlanStep::ClearPassphrase { .. }]
    ));

    // crypttab still names the key file, so the file must survive.
    let before = fs::read_to_string(h.planner.tables().crypttab_path()).unwrap();
    fs::write(h.planner.tables().crypttab_path(), format!("{before}# touched\n")).unwrap();
    assert!(matches!(
        h.planner.execute(&lease, plan),
        Err(KeywardError::Conflict { .. })
    ));
    assert!(info.path.exists());

    let plan = h.planner.plan(&lease, &desired).unwrap();
    h.planner.execute(&lease, plan).unwrap();
    assert!(!info.path.exists());
    assert_eq!(h.crypt_entry().unwrap().key, KeySource::Prompt);
}

#[test]
fn keep_keys_format_needs_old_passphrase_on_locked_device() {
    let h = Harness::new(LuksVersion::Luks2);
    let lease = h.leases.acquire(DEV);
    h.planner.store_passphrase(&lease, PASS).unwrap();

    let mut request = FormatRequest::new("ext4");
    request.keep_keys = true;
    assert!(matches!(
        h.planner.format(&lease, &request),
        Err(KeywardError::MissingKey(_))
    ));
    assert_eq!(h.planner.state(DEV).unwrap(), DeviceState::Locked);

    request.old_passphrase = Some(b"wrong");
    assert!(matches!(
        h.planner.format(&lease, &request),
        Err(KeywardError::AuthFailed { .. })
    ));
    assert_eq!(h.planner.state(DEV).unwrap(), DeviceState::Locked);

    request.old_passphrase = Some(PASS);
    let report = h.planner.format(&lease, &request).unwrap();
    assert!(!report.reinitialised);
    assert!(report.stored_passphrase.is_some());
    let mapping = format!("luks-{}", h.uuid());
    assert_eq!(
        h.mkfs.calls(),
        vec![(format!("/dev/mapper/{mapping}"), "ext4".to_string())]
    );

    h.planner.lock(&lease).unwrap();
    let unlocked = h
        .planner
        .unlock(&lease, &UnlockRequest::default())
        .unwrap();
    assert_eq!(unlocked.strategy, KeyStrategy::StoredPassphrase);
}

#[test]
fn fresh_format_moves_entries_to_new_header() {
    let audit = AuditRootGuard::new();
    let h = Harness::new(LuksVersion::Luks2);
    h.configure();
    let lease = h.leases.acquire(DEV);
    let old_uuid = h.uuid();
    let old_file = h.planner.store_passphrase(&lease, PASS).unwrap().path;

    let mut request = FormatRequest::new("xfs");
    request.new_passphrase = Some(b"fresh start");
    request.store_passphrase = true;
    let report = h.planner.format(&lease, &request).unwrap();

    assert!(report.reinitialised);
    assert_ne!(report.uuid, old_uuid);
    assert_eq!(report.mapping, "data");
    assert!(!old_file.exists());

    let snapshot = h.planner.tables().load().unwrap();
    let entries: Vec<&CryptEntry> = snapshot.crypttab.entries().collect();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].device, format!("UUID={}", report.uuid));
    assert_eq!(
        entries[0].key,
        KeySource::File(h.planner.vault().path_for(&report.uuid))
    );
    let mount = h.mount_entry("/srv/data").unwrap();
    assert_eq!(mount.fstype, "xfs");
    assert_eq!(mount.source, "/dev/mapper/data");

    assert_eq!(
        h.planner.state(DEV).unwrap(),
        DeviceState::Unlocked {
            mapping: "data".into()
        }
    );
    let journal = crate::audit::read_entries().unwrap();
    assert!(journal
        .iter()
        .any(|entry| entry.action == crate::audit::AuditAction::Reformat));
    drop(audit);
}

#[test]
fn fresh_format_requires_new_passphrase() {
    let h = Harness::new(LuksVersion::Luks2);
    let lease = h.leases.acquire(DEV);
    let request = FormatRequest::new("ext4");
    assert!(matches!(
        h.planner.format(&lease, &request),
        Err(KeywardError::MissingKey(_))
    ));
    assert_eq!(h.planner.state(DEV).unwrap(), DeviceState::Locked);
    assert!(h.mkfs.calls().is_empty());
}

#[test]
fn rejected_format_keeps_the_old_header_usable() {
    let _audit = AuditRootGuard::new();
    let h = Harness::new(LuksVersion::Luks2);
    let lease = h.leases.acquire(DEV);
    let old_uuid = h.uuid();
    h.luks.fail_next("format");

    let mut request = FormatRequest::new("ext4");
    request.new_passphrase = Some(b"fresh start");
    assert!(h.planner.format(&lease, &request).is_err());
    assert_eq!(h.planner.state(DEV).unwrap(), DeviceState::Locked);
    assert_eq!(h.uuid(), old_uuid);
    h.planner
        .unlock(&lease, &UnlockRequest::with_key(PASS))
        .unwrap();
}

#[test]
fn header_write_failure_leaves_device_failed() {
    let _audit = AuditRootGuard::new();
    let h = Harness::new(LuksVersion::Luks2);
    let lease = h.leases.acquire(DEV);
    h.luks.tear_next_format();

    let mut request = FormatRequest::new("ext4");
    request.new_passphrase = Some(b"fresh start");
    assert!(h.planner.format(&lease, &request).is_err());
    assert!(matches!(
        h.planner.state(DEV).unwrap(),
        DeviceState::Failed { .. }
    ));
    assert!(matches!(
        h.planner.unlock(&lease, &UnlockRequest::with_key(PASS)),
        Err(KeywardError::InvalidState { .. })
    ));

    // A header restored out of band makes the device usable again.
    h.luks.add_volume(DEV, LuksVersion::Luks2, PASS);
    assert_eq!(h.planner.state(DEV).unwrap(), DeviceState::Locked);
    h.planner
        .unlock(&lease, &UnlockRequest::with_key(PASS))
        .unwrap();
}

#[test]
fn unreadable_device_is_not_formatted() {
    let h = Harness::new(LuksVersion::Luks2);
    let lease = h.leases.acquire(DEV);
    let old_uuid = h.uuid();
    h.luks.fail_next("is_luks");

    let mut request = FormatRequest::new("ext4");
    request.new_passphrase = Some(b"fresh start");
    assert!(matches!(
        h.planner.format(&lease, &request),
        Err(KeywardError::Provider(_))
    ));
    assert_eq!(h.uuid(), old_uuid);
    assert!(h.mkfs.calls().is_empty());
    assert_eq!(h.planner.state(DEV).unwrap(), DeviceState::Locked);
}

#[test]
fn status_reports_slots_and_tables() {
    let h = Harness::new(LuksVersion::Luks1);
    h.configure();
    let status = h.planner.status(DEV).unwrap();
    assert_eq!(status.version, LuksVersion::Luks1);
    assert_eq!(status.state, DeviceState::Locked);
    assert_eq!(status.slots, vec![KeySlot::passphrase(0)]);
    assert_eq!(status.crypttab.unwrap().name, "data");
    assert!(!status.requires_network);
}
