use kp_codec::{Argon2Kdf, Argon2Request};
use kp_core::app_error::AppResult;
use kp_core::config::KeeperConfig;
use kp_keeper::{
    Keeper, MemoryTokenStore, NullClipboard, RecordingAlarms, Request, Response, ResponseData,
    SessionTokenStore, ALARM_AUTO_LOCK, ALARM_CLIPBOARD_CLEAR, ALARM_HOURLY_SNAPSHOT,
};
use kp_store::dual::DualStore;
use kp_store::journal;
use kp_store::primary::MemoryPrimaryStore;
use kp_store::secondary::open_secondary;
use sha2::{Digest, Sha256};
use std::cell::RefCell;
use std::rc::Rc;
use uuid::Uuid;

const T0: i64 = 1_709_296_245_000; // 2024-03-01T12:30:45Z
const MINUTE: i64 = 60_000;

/// Deterministic stand-in for the Argon2 callback; the codec only sees the
/// trait, so tests trade memory-hardness for speed.
struct FakeKdf;

impl Argon2Kdf for FakeKdf {
    fn derive(&self, request: &Argon2Request<'_>) -> AppResult<Vec<u8>> {
        let mut hasher = Sha256::new();
        hasher.update(request.passphrase);
        hasher.update(request.salt);
        hasher.update(request.memory_kib.to_le_bytes());
        hasher.update(request.iterations.to_le_bytes());
        hasher.update([request.variant.type_code() as u8]);
        Ok(hasher.finalize().to_vec())
    }
}

struct Harness {
    dir: tempfile::TempDir,
    alarms: Rc<RefCell<RecordingAlarms>>,
    clipboard: Rc<RefCell<NullClipboard>>,
    tokens: Rc<RefCell<MemoryTokenStore>>,
    primary: Rc<RefCell<MemoryPrimaryStore>>,
}

impl Harness {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("tempdir"),
            alarms: Rc::new(RefCell::new(RecordingAlarms::new())),
            clipboard: Rc::new(RefCell::new(NullClipboard::default())),
            tokens: Rc::new(RefCell::new(MemoryTokenStore::new())),
            primary: Rc::new(RefCell::new(MemoryPrimaryStore::new())),
        }
    }

    fn secondary_path(&self) -> std::path::PathBuf {
        self.dir.path().join("secondary.sqlite")
    }

    /// Build a keeper over the harness stores. Calling it again models a
    /// host restart: the sqlite file and the shared primary/token stores
    /// survive, everything in-memory is rebuilt.
    fn keeper(&self, now_ms: i64) -> Keeper {
        let conn = open_secondary(&self.secondary_path()).expect("open secondary");
        let store = DualStore::new(conn, Box::new(self.primary.clone()));
        Keeper::open(
            KeeperConfig::default(),
            store,
            Box::new(FakeKdf),
            Box::new(self.alarms.clone()),
            Box::new(self.clipboard.clone()),
            Box::new(self.tokens.clone()),
            now_ms,
        )
        .expect("open keeper")
    }

}

fn request(json: serde_json::Value) -> Request {
    serde_json::from_value(json).expect("request parses")
}

fn state_of(response: &Response) -> (&str, Option<&str>, Option<usize>) {
    match response.data().expect("success") {
        ResponseData::State(state) | ResponseData::Created { state, .. } => (
            state.status.as_str(),
            state.meta.as_ref().map(|m| m.name.as_str()),
            state.meta.as_ref().map(|m| m.entry_count),
        ),
        other => panic!("expected state, got {other:?}"),
    }
}

fn entry_of(response: &Response) -> &kp_core::entry::EntryView {
    match response.data().expect("success") {
        ResponseData::Entry { entry } => entry,
        other => panic!("expected entry, got {other:?}"),
    }
}

fn entries_of(response: &Response) -> &[kp_core::entry::EntryView] {
    match response.data().expect("success") {
        ResponseData::Entries { entries } => entries,
        other => panic!("expected entries, got {other:?}"),
    }
}

fn create_database(keeper: &mut Keeper, now_ms: i64) -> Response {
    keeper.handle(
        request(serde_json::json!({
            "type": "CREATE_DATABASE",
            "payload": { "name": "My Work Passwords", "password": "s3cret-pass" }
        })),
        now_ms,
    )
}

fn create_entry(keeper: &mut Keeper, title: &str, url: &str, now_ms: i64) -> Uuid {
    let response = keeper.handle(
        request(serde_json::json!({
            "type": "CREATE_ENTRY",
            "payload": {
                "title": title,
                "username": "u@x",
                "password": "p",
                "url": url,
                "tags": ["mail"]
            }
        })),
        now_ms,
    );
    assert!(response.success(), "create failed: {:?}", response.error());
    entry_of(&response).id
}

#[test]
fn scenario_create_and_read() {
    let harness = Harness::new();
    let mut keeper = harness.keeper(T0);

    let created = create_database(&mut keeper, T0);
    assert!(created.success());
    let (status, name, count) = state_of(&created);
    assert_eq!(status, "unlocked");
    assert_eq!(name, Some("My Work Passwords"));
    assert_eq!(count, Some(0));
    match created.data().expect("success") {
        ResponseData::Created { recovery_code, .. } => {
            assert!(recovery_code.as_ref().is_some_and(|c| c.len() == 35));
        }
        other => panic!("expected created, got {other:?}"),
    }

    let state = keeper.handle(request(serde_json::json!({ "type": "GET_STATE" })), T0 + 1);
    let (status, name, count) = state_of(&state);
    assert_eq!((status, name, count), ("unlocked", Some("My Work Passwords"), Some(0)));

    let export = keeper.handle(request(serde_json::json!({ "type": "EXPORT_DATABASE" })), T0 + 2);
    match export.data().expect("success") {
        ResponseData::Export { filename, blob } => {
            assert_eq!(filename, "My Work Passwords-2024-03-01.kdbx");
            assert!(!blob.is_empty());
        }
        other => panic!("expected export, got {other:?}"),
    }
}

#[test]
fn scenario_add_persist_lock_unlock_read() {
    let harness = Harness::new();
    let mut keeper = harness.keeper(T0);
    create_database(&mut keeper, T0);
    let id = create_entry(&mut keeper, "Gmail", "gmail.com", T0 + 1_000);

    let locked = keeper.handle(request(serde_json::json!({ "type": "LOCK" })), T0 + 2_000);
    assert_eq!(state_of(&locked).0, "locked");

    let unlocked = keeper.handle(
        request(serde_json::json!({ "type": "UNLOCK", "payload": { "password": "s3cret-pass" } })),
        T0 + 3_000,
    );
    assert_eq!(state_of(&unlocked).0, "unlocked");

    let response = keeper.handle(
        request(serde_json::json!({ "type": "GET_ENTRY", "payload": { "id": id } })),
        T0 + 4_000,
    );
    let entry = entry_of(&response);
    assert_eq!(entry.title, "Gmail");
    assert_eq!(entry.username, "u@x");
    assert_eq!(entry.password, "p");
    assert_eq!(entry.url, "gmail.com");
    assert_eq!(entry.tags, vec!["mail"]);
}

#[test]
fn scenario_wrong_key_keeps_the_session_locked() {
    let harness = Harness::new();
    let mut keeper = harness.keeper(T0);
    create_database(&mut keeper, T0);
    keeper.handle(request(serde_json::json!({ "type": "LOCK" })), T0 + 1_000);

    let response = keeper.handle(
        request(serde_json::json!({ "type": "UNLOCK", "payload": { "password": "wrong" } })),
        T0 + 2_000,
    );
    assert!(!response.success());
    assert_eq!(response.error(), Some("Wrong password. Try again."));

    let state = keeper.handle(request(serde_json::json!({ "type": "GET_STATE" })), T0 + 3_000);
    assert_eq!(state_of(&state).0, "locked");
}

#[test]
fn scenario_host_lookup() {
    let harness = Harness::new();
    let mut keeper = harness.keeper(T0);
    create_database(&mut keeper, T0);
    create_entry(&mut keeper, "Italki", "italki.com", T0 + 1_000);

    let hits = keeper.handle(
        request(serde_json::json!({
            "type": "GET_ENTRIES_FOR_URL",
            "payload": { "url": "https://www.italki.com/lesson/42" }
        })),
        T0 + 2_000,
    );
    let entries = entries_of(&hits);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].title, "Italki");

    let misses = keeper.handle(
        request(serde_json::json!({
            "type": "GET_ENTRIES_FOR_URL",
            "payload": { "url": "https://example.org/" }
        })),
        T0 + 3_000,
    );
    assert!(entries_of(&misses).is_empty());

    let fill = keeper.handle(
        request(serde_json::json!({
            "type": "FILL_IN_TAB",
            "payload": { "url": "https://www.italki.com/" }
        })),
        T0 + 4_000,
    );
    assert_eq!(entries_of(&fill).len(), 1);
}

#[test]
fn scenario_edit_threshold_snapshot_and_restore() {
    let harness = Harness::new();
    let mut keeper = harness.keeper(T0);
    create_database(&mut keeper, T0);

    // creation persists with reason=create; the tenth entry is edit #10
    let mut last_id = None;
    for i in 0..10 {
        last_id = Some(create_entry(
            &mut keeper,
            &format!("Entry {i}"),
            "site.example",
            T0 + (i + 1) * 1_000,
        ));
    }

    let history = keeper.handle(
        request(serde_json::json!({ "type": "GET_BACKUP_HISTORY" })),
        T0 + 20_000,
    );
    let snapshot_ts = match history.data().expect("success") {
        ResponseData::Snapshots { snapshots } => {
            assert!(!snapshots.is_empty());
            assert_eq!(snapshots[0].reason, "edit_threshold");
            snapshots[0].timestamp_ms
        }
        other => panic!("expected snapshots, got {other:?}"),
    };

    let deleted = keeper.handle(
        request(serde_json::json!({
            "type": "DELETE_ENTRY",
            "payload": { "id": last_id.expect("ten entries created") }
        })),
        T0 + 21_000,
    );
    assert!(deleted.success());
    let listed = keeper.handle(
        request(serde_json::json!({ "type": "GET_ENTRIES" })),
        T0 + 22_000,
    );
    assert_eq!(entries_of(&listed).len(), 9);

    let restored = keeper.handle(
        request(serde_json::json!({
            "type": "RESTORE_FROM_BACKUP",
            "payload": { "timestampMs": snapshot_ts, "password": "s3cret-pass" }
        })),
        T0 + 23_000,
    );
    assert!(restored.success(), "restore failed: {:?}", restored.error());

    let listed = keeper.handle(
        request(serde_json::json!({ "type": "GET_ENTRIES" })),
        T0 + 24_000,
    );
    assert_eq!(entries_of(&listed).len(), 10);
}

#[test]
fn scenario_crash_between_secondary_and_primary_writes() {
    let harness = Harness::new();
    let mut keeper = harness.keeper(T0);
    create_database(&mut keeper, T0);
    create_entry(&mut keeper, "Base", "base.example", T0 + 1_000);

    harness.primary.borrow_mut().fail_writes = true;
    let failed = keeper.handle(
        request(serde_json::json!({
            "type": "CREATE_ENTRY",
            "payload": { "title": "Half", "password": "x" }
        })),
        T0 + 2_000,
    );
    assert!(!failed.success());
    harness.primary.borrow_mut().fail_writes = false;

    // the reverted session hides the half-written entry immediately
    let listed = keeper.handle(
        request(serde_json::json!({ "type": "GET_ENTRIES" })),
        T0 + 3_000,
    );
    assert!(entries_of(&listed).iter().all(|e| e.title != "Half"));

    // restart: journal holds the rollback, nothing incomplete remains, and
    // the primary store still serves the last verified blob
    drop(keeper);
    let mut keeper = harness.keeper(T0 + 10_000);
    harness.tokens.borrow_mut().clear().expect("fresh session");
    let unlocked = keeper.handle(
        request(serde_json::json!({ "type": "UNLOCK", "payload": { "password": "s3cret-pass" } })),
        T0 + 11_000,
    );
    assert!(unlocked.success());

    let listed = keeper.handle(
        request(serde_json::json!({ "type": "GET_ENTRIES" })),
        T0 + 12_000,
    );
    let titles: Vec<&str> = entries_of(&listed).iter().map(|e| e.title.as_str()).collect();
    assert!(titles.contains(&"Base"));
    assert!(!titles.contains(&"Half"));

    let conn = open_secondary(&harness.secondary_path()).expect("assert conn");
    assert_eq!(journal::incomplete_count(&conn).expect("count"), 0);
    assert!(journal::count_by_status(&conn, journal::STATUS_ROLLED_BACK).expect("count") >= 1);
}

#[test]
fn journal_closure_after_normal_mutations() {
    let harness = Harness::new();
    let mut keeper = harness.keeper(T0);
    create_database(&mut keeper, T0);
    for i in 0..3 {
        create_entry(&mut keeper, &format!("E{i}"), "e.example", T0 + (i + 1) * 1_000);
    }

    let conn = open_secondary(&harness.secondary_path()).expect("assert conn");
    assert_eq!(journal::incomplete_count(&conn).expect("count"), 0);
    // create_database + three entry creations
    assert_eq!(
        journal::count_by_status(&conn, journal::STATUS_COMPLETED).expect("count"),
        4
    );
}

#[test]
fn auto_lock_clears_the_session_and_token() {
    let harness = Harness::new();
    let mut keeper = harness.keeper(T0);
    create_database(&mut keeper, T0);

    let armed_at = harness.alarms.borrow().armed[ALARM_AUTO_LOCK];
    assert_eq!(armed_at, T0 + 15 * MINUTE);

    keeper.handle_alarm(ALARM_AUTO_LOCK, armed_at);
    let state = keeper.handle(request(serde_json::json!({ "type": "GET_STATE" })), armed_at + 1);
    assert_eq!(state_of(&state).0, "locked");
    assert!(harness.tokens.borrow().get().expect("get").is_none());

    let guarded = keeper.handle(
        request(serde_json::json!({ "type": "GET_ENTRIES" })),
        armed_at + 2,
    );
    assert_eq!(guarded.error(), Some("NOT_UNLOCKED"));
}

#[test]
fn data_operations_rearm_the_idle_timer() {
    let harness = Harness::new();
    let mut keeper = harness.keeper(T0);
    create_database(&mut keeper, T0);

    keeper.handle(
        request(serde_json::json!({ "type": "GET_ENTRIES" })),
        T0 + 5 * MINUTE,
    );
    assert_eq!(
        harness.alarms.borrow().armed[ALARM_AUTO_LOCK],
        T0 + 20 * MINUTE
    );
}

#[test]
fn auto_unlock_survives_a_host_restart_until_the_token_expires() {
    let harness = Harness::new();
    let mut keeper = harness.keeper(T0);
    create_database(&mut keeper, T0);
    create_entry(&mut keeper, "Gmail", "gmail.com", T0 + 1_000);
    drop(keeper);

    // restart within the token ttl: the first state query re-unlocks
    let mut keeper = harness.keeper(T0 + 2_000);
    let state = keeper.handle(request(serde_json::json!({ "type": "GET_STATE" })), T0 + 3_000);
    assert_eq!(state_of(&state).0, "unlocked");
    drop(keeper);

    // restart past the ttl: the token is cleared and the session stays locked
    let hour = 3_600_000;
    let mut keeper = harness.keeper(T0 + hour + 4_000);
    let state = keeper.handle(
        request(serde_json::json!({ "type": "GET_STATE" })),
        T0 + hour + 5_000,
    );
    assert_eq!(state_of(&state).0, "locked");
    assert!(harness.tokens.borrow().get().expect("get").is_none());
}

#[test]
fn locked_url_queries_return_empty_rather_than_errors() {
    let harness = Harness::new();
    let mut keeper = harness.keeper(T0);
    create_database(&mut keeper, T0);
    create_entry(&mut keeper, "Gmail", "gmail.com", T0 + 1_000);
    keeper.handle(request(serde_json::json!({ "type": "LOCK" })), T0 + 2_000);

    let response = keeper.handle(
        request(serde_json::json!({
            "type": "GET_ENTRIES_FOR_URL",
            "payload": { "url": "https://gmail.com/" }
        })),
        T0 + 3_000,
    );
    assert!(response.success());
    assert!(entries_of(&response).is_empty());
}

#[test]
fn clipboard_clear_fires_once_via_the_alarm() {
    let harness = Harness::new();
    let mut keeper = harness.keeper(T0);

    let copied = keeper.handle(
        request(serde_json::json!({
            "type": "COPY_TO_CLIPBOARD",
            "payload": { "text": "hunter2" }
        })),
        T0,
    );
    assert!(copied.success());
    assert_eq!(harness.clipboard.borrow().last.as_deref(), Some("hunter2"));
    let armed_at = harness.alarms.borrow().armed[ALARM_CLIPBOARD_CLEAR];
    assert_eq!(armed_at, T0 + 15_000);

    keeper.handle_alarm(ALARM_CLIPBOARD_CLEAR, armed_at);
    assert_eq!(harness.clipboard.borrow().last.as_deref(), Some(""));
}

#[test]
fn hourly_snapshot_fires_when_due_and_rearms() {
    let harness = Harness::new();
    let mut keeper = harness.keeper(T0);
    create_database(&mut keeper, T0);

    let hour = 3_600_000;
    keeper.handle_alarm(ALARM_HOURLY_SNAPSHOT, T0 + hour + 1);

    let history = keeper.handle(
        request(serde_json::json!({ "type": "GET_BACKUP_HISTORY" })),
        T0 + hour + 2,
    );
    match history.data().expect("success") {
        ResponseData::Snapshots { snapshots } => {
            assert_eq!(snapshots.len(), 1);
            assert_eq!(snapshots[0].reason, "hourly");
        }
        other => panic!("expected snapshots, got {other:?}"),
    }
    assert_eq!(
        harness.alarms.borrow().armed[ALARM_HOURLY_SNAPSHOT],
        T0 + 2 * hour + 1
    );
}

#[test]
fn manual_snapshots_join_the_history() {
    let harness = Harness::new();
    let mut keeper = harness.keeper(T0);
    create_database(&mut keeper, T0);

    keeper.snapshot_now(T0 + 1_000).expect("snapshot");

    let history = keeper.handle(
        request(serde_json::json!({ "type": "GET_BACKUP_HISTORY" })),
        T0 + 2_000,
    );
    match history.data().expect("success") {
        ResponseData::Snapshots { snapshots } => {
            assert_eq!(snapshots.len(), 1);
            assert_eq!(snapshots[0].reason, "manual");
        }
        other => panic!("expected snapshots, got {other:?}"),
    }
}

#[test]
fn generate_password_honors_options_without_a_session() {
    let harness = Harness::new();
    let mut keeper = harness.keeper(T0);

    let response = keeper.handle(
        request(serde_json::json!({
            "type": "GENERATE_PASSWORD",
            "payload": { "length": 24, "includeSpecial": true, "excludeAmbiguous": true }
        })),
        T0,
    );
    match response.data().expect("success") {
        ResponseData::Password { password, strength } => {
            assert_eq!(password.chars().count(), 24);
            assert!(!password.contains(['O', '0', 'l', '1', 'I']));
            assert!(*strength >= 3);
        }
        other => panic!("expected password, got {other:?}"),
    }
}

#[test]
fn delete_database_returns_to_no_database() {
    let harness = Harness::new();
    let mut keeper = harness.keeper(T0);
    create_database(&mut keeper, T0);
    create_entry(&mut keeper, "Gmail", "gmail.com", T0 + 1_000);

    let response = keeper.handle(request(serde_json::json!({ "type": "DELETE_DATABASE" })), T0 + 2_000);
    assert_eq!(state_of(&response).0, "no_database");

    let state = keeper.handle(request(serde_json::json!({ "type": "GET_STATE" })), T0 + 3_000);
    assert_eq!(state_of(&state).0, "no_database");

    let guarded = keeper.handle(request(serde_json::json!({ "type": "GET_ENTRIES" })), T0 + 4_000);
    assert_eq!(guarded.error(), Some("No database found"));
}

#[test]
fn download_export_works_while_locked() {
    let harness = Harness::new();
    let mut keeper = harness.keeper(T0);
    create_database(&mut keeper, T0);
    keeper.handle(request(serde_json::json!({ "type": "LOCK" })), T0 + 1_000);
    harness.tokens.borrow_mut().clear().expect("drop token");

    let response = keeper.handle(
        request(serde_json::json!({ "type": "DOWNLOAD_EXPORT" })),
        T0 + 2_000,
    );
    match response.data().expect("success") {
        ResponseData::Export { filename, blob } => {
            assert_eq!(filename, "My Work Passwords-2024-03-01.kdbx");
            assert!(!blob.is_empty());
        }
        other => panic!("expected export, got {other:?}"),
    }
}

#[test]
fn recovery_status_reports_the_provisioned_code() {
    let harness = Harness::new();
    let mut keeper = harness.keeper(T0);

    let before = keeper.handle(
        request(serde_json::json!({ "type": "GET_RECOVERY_STATUS" })),
        T0,
    );
    match before.data().expect("success") {
        ResponseData::RecoveryStatus { configured, .. } => assert!(!configured),
        other => panic!("expected recovery status, got {other:?}"),
    }

    create_database(&mut keeper, T0 + 1_000);
    let after = keeper.handle(
        request(serde_json::json!({ "type": "GET_RECOVERY_STATUS" })),
        T0 + 2_000,
    );
    match after.data().expect("success") {
        ResponseData::RecoveryStatus {
            configured,
            created_at_ms,
        } => {
            assert!(configured);
            assert_eq!(*created_at_ms, Some(T0 + 1_000));
        }
        other => panic!("expected recovery status, got {other:?}"),
    }
}

#[test]
fn storage_health_reflects_persists() {
    let harness = Harness::new();
    let mut keeper = harness.keeper(T0);
    create_database(&mut keeper, T0);
    create_entry(&mut keeper, "Gmail", "gmail.com", T0 + 1_000);

    let response = keeper.handle(
        request(serde_json::json!({ "type": "GET_STORAGE_HEALTH" })),
        T0 + 2_000,
    );
    match response.data().expect("success") {
        ResponseData::Health(report) => {
            assert_eq!(report.integrity, "healthy");
            assert_eq!(report.latest_version, 2);
            assert_eq!(report.version_count, 2);
            assert!(report.primary_bytes > 0);
            assert_eq!(report.last_checksum.len(), 64);
        }
        other => panic!("expected health, got {other:?}"),
    }
}
