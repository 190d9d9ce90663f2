use crate::hosts::{AlarmHost, ClipboardHost, SessionTokenStore, UnlockTokenRecord};
use crate::messages::{
    BackupHistoryPayload, CreateDatabasePayload, ImportDatabasePayload, Request, Response,
    ResponseData, RestorePayload, StateView,
};
use crate::session::{SessionMeta, SessionState};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use kp_codec::Argon2Kdf;
use kp_core::app_error::{AppError, AppResult};
use kp_core::checksum::sha256_hex;
use kp_core::config::KeeperConfig;
use kp_core::entry::EntryData;
use kp_core::passgen::{generate_password, password_strength};
use kp_core::random::random_recovery_code;
use kp_core::timefmt::{date_stamp, iso8601_ms};
use kp_store::backup::{
    insert_snapshot, prune_snapshots, snapshot_at, BackupScheduler, SnapshotRecord,
    REASON_EDIT_THRESHOLD, REASON_HOURLY, REASON_MANUAL,
};
use kp_store::dual::{BlobMetadata, DualStore, PersistOutcome, PersistReason};
use kp_store::journal;
use kp_store::journal::RecoverySummary;
use kp_store::secondary::{read_current, read_recovery_code, write_recovery_code};
use serde_json::json;
use uuid::Uuid;
use zeroize::Zeroizing;

pub const ALARM_AUTO_LOCK: &str = "keeper:auto-lock";
pub const ALARM_CLIPBOARD_CLEAR: &str = "keeper:clipboard-clear";
pub const ALARM_HOURLY_SNAPSHOT: &str = "keeper:hourly-snapshot";

const EXPORT_FALLBACK_NAME: &str = "keepass-export";

/// What storage initialization found; the host may surface it but never
/// blocks on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitReport {
    pub journal: RecoverySummary,
}

fn no_database() -> AppError {
    AppError::new(
        "KP_NOT_FOUND",
        "session",
        "No database found",
        false,
        json!({}),
    )
}

fn entry_not_found() -> AppError {
    AppError::new("KP_NOT_FOUND", "vault", "Entry not found", false, json!({}))
}

/// The keeper: sole owner of the decrypted vault, the session state machine
/// and the persistence pipeline. One instance lives on one task loop; every
/// request passes through [`Keeper::handle`] with a host-supplied clock.
pub struct Keeper {
    config: KeeperConfig,
    store: DualStore,
    scheduler: BackupScheduler,
    session: SessionState,
    passphrase: Option<Zeroizing<String>>,
    kdf: Box<dyn Argon2Kdf>,
    alarms: Box<dyn AlarmHost>,
    clipboard: Box<dyn ClipboardHost>,
    tokens: Box<dyn SessionTokenStore>,
    init: InitReport,
}

impl Keeper {
    /// Storage-init barrier: migrations, journal startup recovery, snapshot
    /// schedule rehydration and state detection all complete before the
    /// first request is dispatched. Idempotent across restarts.
    pub fn open(
        config: KeeperConfig,
        store: DualStore,
        kdf: Box<dyn Argon2Kdf>,
        mut alarms: Box<dyn AlarmHost>,
        clipboard: Box<dyn ClipboardHost>,
        tokens: Box<dyn SessionTokenStore>,
        now_ms: i64,
    ) -> AppResult<Self> {
        let current_checksum = store.current_checksum()?;
        let summary =
            journal::recover_on_startup(store.conn(), current_checksum.as_deref(), now_ms)?;
        let scheduler = BackupScheduler::rehydrate(store.conn(), &config)?;

        let session = match store.load()? {
            Some(loaded) => SessionState::Locked {
                meta: meta_from_value(&loaded.metadata),
            },
            None => SessionState::NoDatabase,
        };

        alarms.arm(
            ALARM_HOURLY_SNAPSHOT,
            scheduler.next_hourly_deadline(now_ms),
        );

        Ok(Self {
            config,
            store,
            scheduler,
            session,
            passphrase: None,
            kdf,
            alarms,
            clipboard,
            tokens,
            init: InitReport { journal: summary },
        })
    }

    pub fn init_report(&self) -> InitReport {
        self.init
    }

    pub fn state_view(&self) -> StateView {
        let meta = match &self.session {
            SessionState::NoDatabase => None,
            SessionState::Locked { meta } => Some(meta.clone()),
            SessionState::Unlocked { vault } => Some(SessionMeta {
                name: vault.meta.name.clone(),
                last_modified: iso8601_ms(vault.meta.last_mod_time_ms),
                entry_count: vault.entry_count(),
            }),
        };
        StateView {
            status: self.session.status().to_string(),
            meta,
        }
    }

    /// Sole ingress. Errors never escape: they are rendered into the
    /// failure envelope here.
    pub fn handle(&mut self, request: Request, now_ms: i64) -> Response {
        match self.dispatch(request, now_ms) {
            Ok(data) => Response::ok(data),
            Err(error) => Response::from_error(&error),
        }
    }

    /// Snapshot on explicit host request, outside the hourly and
    /// edit-threshold policies. No-op while no database is stored.
    pub fn snapshot_now(&mut self, now_ms: i64) -> AppResult<()> {
        self.create_snapshot(REASON_MANUAL, now_ms)
    }

    /// Host callback when a persistent alarm fires.
    pub fn handle_alarm(&mut self, name: &str, now_ms: i64) {
        match name {
            ALARM_AUTO_LOCK => self.lock(),
            ALARM_CLIPBOARD_CLEAR => {
                let _ = self.clipboard.write("");
            }
            ALARM_HOURLY_SNAPSHOT => {
                if self.scheduler.hourly_due(now_ms) {
                    let _ = self.create_snapshot(REASON_HOURLY, now_ms);
                }
                let deadline = self.scheduler.next_hourly_deadline(now_ms);
                self.alarms.arm(ALARM_HOURLY_SNAPSHOT, deadline);
            }
            _ => {}
        }
    }

    fn dispatch(&mut self, request: Request, now_ms: i64) -> AppResult<ResponseData> {
        match request {
            Request::GetState => {
                self.try_auto_unlock(now_ms);
                Ok(ResponseData::State(self.state_view()))
            }
            Request::CreateDatabase(payload) => self.create_database(payload, now_ms),
            Request::ImportDatabase(payload) => self.import_database(payload, now_ms),
            Request::Unlock(payload) => self.unlock(&payload.password, now_ms),
            Request::Lock => {
                self.lock();
                Ok(ResponseData::State(self.state_view()))
            }
            Request::GetEntries(filter) => {
                self.ensure_unlocked(now_ms)?;
                let vault = self.session.vault().expect("unlocked above");
                Ok(ResponseData::Entries {
                    entries: vault.list_entries(&filter.unwrap_or_default()),
                })
            }
            Request::GetEntry(payload) => {
                self.ensure_unlocked(now_ms)?;
                let vault = self.session.vault().expect("unlocked above");
                match vault.get_entry(payload.id) {
                    Some(entry) => Ok(ResponseData::Entry { entry }),
                    None => Err(entry_not_found()),
                }
            }
            Request::CreateEntry(data) => self.create_entry(data, now_ms),
            Request::UpdateEntry(data) => self.update_entry(data, now_ms),
            Request::DeleteEntry(payload) => self.delete_entry(payload.id, now_ms),
            Request::GetGroups => {
                self.ensure_unlocked(now_ms)?;
                let vault = self.session.vault().expect("unlocked above");
                Ok(ResponseData::Groups {
                    groups: vault.list_groups(),
                })
            }
            Request::GeneratePassword(options) => {
                let options = options.unwrap_or_default();
                let password = generate_password(&options)?;
                let strength = password_strength(&password);
                Ok(ResponseData::Password { password, strength })
            }
            Request::CopyToClipboard(payload) => {
                self.clipboard.write(&payload.text)?;
                self.alarms.arm(
                    ALARM_CLIPBOARD_CLEAR,
                    now_ms + self.config.clipboard_clear_ms(),
                );
                Ok(ResponseData::Ack {})
            }
            Request::ExportDatabase => self.export_database(now_ms),
            Request::GetEntriesForUrl(payload) => Ok(self.entries_for_url(&payload.url, now_ms)),
            Request::FillInTab(payload) => Ok(self.entries_for_url(&payload.url, now_ms)),
            Request::GetBackupHistory(payload) => self.backup_history(payload, now_ms),
            Request::RestoreFromBackup(payload) => self.restore_from_backup(payload, now_ms),
            Request::GetStorageHealth => Ok(ResponseData::Health(self.store.health()?)),
            Request::GetRecoveryStatus => {
                let status = read_recovery_code(self.store.conn())?;
                Ok(ResponseData::RecoveryStatus {
                    configured: status.is_some(),
                    created_at_ms: status.map(|(_, created)| created),
                })
            }
            Request::DeleteDatabase => self.delete_database(now_ms),
            Request::DownloadExport => self.download_export(now_ms),
        }
    }

    // -- session transitions ------------------------------------------------

    fn lock(&mut self) {
        let meta = match &self.session {
            SessionState::Unlocked { vault } => Some(SessionMeta {
                name: vault.meta.name.clone(),
                last_modified: iso8601_ms(vault.meta.last_mod_time_ms),
                entry_count: vault.entry_count(),
            }),
            SessionState::Locked { meta } => Some(meta.clone()),
            SessionState::NoDatabase => None,
        };

        self.passphrase = None;
        let _ = self.tokens.clear();
        self.alarms.clear(ALARM_AUTO_LOCK);
        self.session = match meta {
            Some(meta) => SessionState::Locked { meta },
            None => SessionState::NoDatabase,
        };
    }

    fn unlock(&mut self, password: &str, now_ms: i64) -> AppResult<ResponseData> {
        let loaded = self.store.load()?.ok_or_else(no_database)?;
        let vault = kp_codec::load(&loaded.blob, password, self.kdf.as_ref())?;
        self.session = SessionState::Unlocked { vault };
        self.establish_session(password, now_ms);
        Ok(ResponseData::State(self.state_view()))
    }

    /// Transparent re-unlock with the session token. Quiet by contract:
    /// failure clears the token and leaves the session locked.
    fn try_auto_unlock(&mut self, now_ms: i64) -> bool {
        match &self.session {
            SessionState::Unlocked { .. } => return true,
            SessionState::Locked { .. } => {}
            SessionState::NoDatabase => return false,
        }

        let Ok(Some(record)) = self.tokens.get() else {
            return false;
        };
        if record.expired(now_ms) {
            let _ = self.tokens.clear();
            return false;
        }
        let Ok(Some(loaded)) = self.store.load() else {
            return false;
        };

        let credential = record.token.reveal();
        match kp_codec::load(&loaded.blob, credential.as_str(), self.kdf.as_ref()) {
            Ok(vault) => {
                self.session = SessionState::Unlocked { vault };
                self.passphrase = Some(Zeroizing::new(credential.as_str().to_string()));
                self.arm_auto_lock(now_ms);
                true
            }
            Err(_) => {
                let _ = self.tokens.clear();
                false
            }
        }
    }

    fn ensure_unlocked(&mut self, now_ms: i64) -> AppResult<()> {
        match self.session {
            SessionState::Unlocked { .. } => {
                self.arm_auto_lock(now_ms);
                Ok(())
            }
            SessionState::NoDatabase => Err(no_database()),
            SessionState::Locked { .. } => {
                if self.try_auto_unlock(now_ms) {
                    Ok(())
                } else {
                    Err(AppError::not_unlocked())
                }
            }
        }
    }

    fn arm_auto_lock(&mut self, now_ms: i64) {
        self.alarms
            .arm(ALARM_AUTO_LOCK, now_ms + self.config.auto_lock_ms());
    }

    /// Hold the passphrase for saves, mint the unlock token and start the
    /// idle timer. Token storage is best-effort: a host without an
    /// exit-bound store simply loses transparent re-unlock.
    fn establish_session(&mut self, password: &str, now_ms: i64) {
        self.passphrase = Some(Zeroizing::new(password.to_string()));
        if let Ok(token) = kp_core::protected::ProtectedValue::new(password) {
            let _ = self.tokens.put(&UnlockTokenRecord {
                token,
                created_at_ms: now_ms,
                expires_at_ms: now_ms + self.config.unlock_token_ttl_ms(),
            });
        }
        self.arm_auto_lock(now_ms);
    }

    // -- persistence pipeline ----------------------------------------------

    /// Bracket a mutation with journal begin/complete/rollback. On failure
    /// the in-memory session reverts to its pre-mutation snapshot, so a
    /// half-written entry never survives in memory either.
    fn journaled<T>(
        &mut self,
        op_type: &str,
        payload: serde_json::Value,
        now_ms: i64,
        body: impl FnOnce(&mut Keeper) -> AppResult<(T, Option<String>)>,
    ) -> AppResult<T> {
        let checksum = self.store.current_checksum().unwrap_or(None);
        let op_id = journal::begin(
            self.store.conn(),
            op_type,
            &payload,
            checksum.as_deref(),
            now_ms,
        )?;
        let session_snapshot = self.session.clone();
        let passphrase_snapshot = self.passphrase.clone();

        match body(self) {
            Ok((value, result_checksum)) => {
                journal::complete(
                    self.store.conn(),
                    &op_id,
                    result_checksum.as_deref().unwrap_or(""),
                    now_ms,
                )?;
                journal::prune(self.store.conn(), self.config.journal_cap)?;
                Ok(value)
            }
            Err(error) => {
                self.session = session_snapshot;
                self.passphrase = passphrase_snapshot;
                let _ = journal::rollback(self.store.conn(), &op_id, &error.message, now_ms);
                Err(error)
            }
        }
    }

    /// Serialize the live vault and run the dual-store write path. The
    /// mutation only counts once both stores acknowledged and the read-back
    /// checksum matched.
    fn persist_current(
        &mut self,
        reason: PersistReason,
        now_ms: i64,
    ) -> AppResult<PersistOutcome> {
        let (blob, metadata) = {
            let vault = self.session.vault().ok_or_else(AppError::not_unlocked)?;
            let passphrase = self
                .passphrase
                .as_ref()
                .ok_or_else(|| AppError::internal("session passphrase is not available"))?;
            let blob = kp_codec::save(vault, passphrase, self.kdf.as_ref())?;
            let metadata = BlobMetadata {
                name: vault.meta.name.clone(),
                last_modified: iso8601_ms(now_ms),
                entry_count: vault.entry_count(),
            };
            (blob, metadata)
        };

        let outcome = self
            .store
            .persist(&blob, &metadata, reason, self.config.max_versions, now_ms)?;

        if !outcome.success() {
            return Err(AppError::new(
                "KP_STORAGE_SYNC_FAILED",
                "dual_store",
                "database write did not reach both stores",
                true,
                json!({ "warnings": outcome.warnings }),
            ));
        }
        if !outcome.checksum_match {
            return Err(AppError::new(
                "KP_CHECKSUM_MISMATCH",
                "dual_store",
                "primary store read-back did not match the written checksum",
                true,
                json!({ "warnings": outcome.warnings }),
            ));
        }

        if reason == PersistReason::Edit && self.scheduler.note_edit() {
            let _ = self.create_snapshot(REASON_EDIT_THRESHOLD, now_ms);
        }
        Ok(outcome)
    }

    fn create_snapshot(&mut self, reason: &str, now_ms: i64) -> AppResult<()> {
        let Some(current) = read_current(self.store.conn())? else {
            return Ok(());
        };
        insert_snapshot(
            self.store.conn(),
            &SnapshotRecord {
                ts_ms: now_ms,
                blob: current.blob,
                checksum: current.checksum,
                version: current.version,
                metadata_json: current.metadata_json,
                reason: reason.to_string(),
                edit_count: i64::from(self.scheduler.edit_counter()),
                auto_snapshot: reason != REASON_MANUAL,
            },
        )?;
        prune_snapshots(
            self.store.conn(),
            self.config.max_snapshots,
            self.config.snapshot_max_age_ms(),
            now_ms,
        )?;
        self.scheduler.record_snapshot(now_ms);
        let deadline = self.scheduler.next_hourly_deadline(now_ms);
        self.alarms.arm(ALARM_HOURLY_SNAPSHOT, deadline);
        Ok(())
    }

    // -- database lifecycle -------------------------------------------------

    fn create_database(
        &mut self,
        payload: CreateDatabasePayload,
        now_ms: i64,
    ) -> AppResult<ResponseData> {
        let password = payload.password.clone();
        self.journaled(
            "create_database",
            json!({ "name": payload.name.clone() }),
            now_ms,
            move |keeper| {
                let vault = kp_codec::create(&payload.name, now_ms);
                keeper.session = SessionState::Unlocked { vault };
                keeper.passphrase = Some(Zeroizing::new(payload.password.clone()));
                let outcome = keeper.persist_current(PersistReason::Create, now_ms)?;
                Ok(((), Some(outcome.checksum)))
            },
        )?;

        let code = random_recovery_code()?;
        write_recovery_code(self.store.conn(), &sha256_hex(code.as_bytes()), now_ms)?;
        self.establish_session(&password, now_ms);

        Ok(ResponseData::Created {
            state: self.state_view(),
            recovery_code: Some(code),
        })
    }

    fn import_database(
        &mut self,
        payload: ImportDatabasePayload,
        now_ms: i64,
    ) -> AppResult<ResponseData> {
        let blob = BASE64.decode(payload.blob.as_bytes()).map_err(|e| {
            AppError::new(
                "KP_BLOB_CORRUPT",
                "dispatcher",
                "import blob is not base64",
                false,
                json!({ "error": e.to_string() }),
            )
        })?;
        let password = payload.password.clone();

        self.journaled("import_database", json!({}), now_ms, move |keeper| {
            let vault = kp_codec::load(&blob, &payload.password, keeper.kdf.as_ref())?;
            keeper.session = SessionState::Unlocked { vault };
            keeper.passphrase = Some(Zeroizing::new(payload.password.clone()));
            let outcome = keeper.persist_current(PersistReason::Import, now_ms)?;
            Ok(((), Some(outcome.checksum)))
        })?;

        self.establish_session(&password, now_ms);
        Ok(ResponseData::State(self.state_view()))
    }

    fn delete_database(&mut self, now_ms: i64) -> AppResult<ResponseData> {
        self.journaled("delete_database", json!({}), now_ms, |keeper| {
            keeper.store.delete_all()?;
            keeper.session = SessionState::NoDatabase;
            keeper.passphrase = None;
            Ok(((), None))
        })?;

        let _ = self.tokens.clear();
        self.alarms.clear(ALARM_AUTO_LOCK);
        self.alarms.clear(ALARM_CLIPBOARD_CLEAR);
        Ok(ResponseData::State(self.state_view()))
    }

    // -- entry mutations ----------------------------------------------------

    fn create_entry(&mut self, data: EntryData, now_ms: i64) -> AppResult<ResponseData> {
        self.ensure_unlocked(now_ms)?;
        let entry = self.journaled(
            "create_entry",
            json!({ "title": data.title.clone() }),
            now_ms,
            move |keeper| {
                let vault = keeper
                    .session
                    .vault_mut()
                    .ok_or_else(AppError::not_unlocked)?;
                let view = vault.create_entry(&data, now_ms)?;
                let outcome = keeper.persist_current(PersistReason::Edit, now_ms)?;
                Ok((view, Some(outcome.checksum)))
            },
        )?;
        Ok(ResponseData::Entry { entry })
    }

    fn update_entry(&mut self, data: EntryData, now_ms: i64) -> AppResult<ResponseData> {
        self.ensure_unlocked(now_ms)?;
        let entry = self.journaled(
            "update_entry",
            json!({ "id": data.id }),
            now_ms,
            move |keeper| {
                let vault = keeper
                    .session
                    .vault_mut()
                    .ok_or_else(AppError::not_unlocked)?;
                let view = vault
                    .update_entry(&data, now_ms)?
                    .ok_or_else(entry_not_found)?;
                let outcome = keeper.persist_current(PersistReason::Edit, now_ms)?;
                Ok((view, Some(outcome.checksum)))
            },
        )?;
        Ok(ResponseData::Entry { entry })
    }

    fn delete_entry(&mut self, id: Uuid, now_ms: i64) -> AppResult<ResponseData> {
        self.ensure_unlocked(now_ms)?;
        let deleted = self.journaled(
            "delete_entry",
            json!({ "id": id }),
            now_ms,
            move |keeper| {
                let vault = keeper
                    .session
                    .vault_mut()
                    .ok_or_else(AppError::not_unlocked)?;
                if !vault.delete_entry(id, now_ms) {
                    return Ok((false, None));
                }
                let outcome = keeper.persist_current(PersistReason::Edit, now_ms)?;
                Ok((true, Some(outcome.checksum)))
            },
        )?;
        Ok(ResponseData::Deleted { deleted })
    }

    // -- reads, export, backup ----------------------------------------------

    fn entries_for_url(&mut self, url: &str, now_ms: i64) -> ResponseData {
        // quiet path: a locked session yields no matches, never an error
        self.try_auto_unlock(now_ms);
        let entries = match self.session.vault() {
            Some(vault) => vault.entries_for_host(url),
            None => Vec::new(),
        };
        ResponseData::Entries { entries }
    }

    fn export_filename(name: &str, now_ms: i64) -> String {
        let base = if name.is_empty() {
            EXPORT_FALLBACK_NAME
        } else {
            name
        };
        format!("{}-{}.kdbx", base, date_stamp(now_ms))
    }

    fn export_database(&mut self, now_ms: i64) -> AppResult<ResponseData> {
        self.ensure_unlocked(now_ms)?;
        let (blob, name) = {
            let vault = self.session.vault().expect("unlocked above");
            let passphrase = self
                .passphrase
                .as_ref()
                .ok_or_else(|| AppError::internal("session passphrase is not available"))?;
            (
                kp_codec::save(vault, passphrase, self.kdf.as_ref())?,
                vault.meta.name.clone(),
            )
        };
        Ok(ResponseData::Export {
            filename: Self::export_filename(&name, now_ms),
            blob: BASE64.encode(blob),
        })
    }

    /// Hand out the stored encrypted blob; available even while locked since
    /// the bytes never left their container.
    fn download_export(&mut self, now_ms: i64) -> AppResult<ResponseData> {
        let loaded = self.store.load()?.ok_or_else(no_database)?;
        let name = loaded
            .metadata
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        Ok(ResponseData::Export {
            filename: Self::export_filename(&name, now_ms),
            blob: BASE64.encode(loaded.blob),
        })
    }

    fn backup_history(
        &mut self,
        payload: Option<BackupHistoryPayload>,
        now_ms: i64,
    ) -> AppResult<ResponseData> {
        self.ensure_unlocked(now_ms)?;
        let limit = payload.and_then(|p| p.limit).unwrap_or(20);
        Ok(ResponseData::Snapshots {
            snapshots: kp_store::backup::history(self.store.conn(), limit)?,
        })
    }

    fn restore_from_backup(
        &mut self,
        payload: RestorePayload,
        now_ms: i64,
    ) -> AppResult<ResponseData> {
        let password = payload.password.clone();
        let timestamp_ms = payload.timestamp_ms;

        self.journaled(
            "restore_from_backup",
            json!({ "timestampMs": timestamp_ms }),
            now_ms,
            move |keeper| {
                let snapshot = snapshot_at(keeper.store.conn(), payload.timestamp_ms)?
                    .ok_or_else(|| {
                        AppError::new(
                            "KP_NOT_FOUND",
                            "backup",
                            "Backup snapshot not found",
                            false,
                            json!({ "timestampMs": payload.timestamp_ms }),
                        )
                    })?;
                let vault =
                    kp_codec::load(&snapshot.blob, &payload.password, keeper.kdf.as_ref())?;
                keeper.session = SessionState::Unlocked { vault };
                keeper.passphrase = Some(Zeroizing::new(payload.password.clone()));
                let outcome = keeper.persist_current(PersistReason::Recovery, now_ms)?;
                Ok(((), Some(outcome.checksum)))
            },
        )?;

        self.establish_session(&password, now_ms);
        Ok(ResponseData::Restored {
            restored: true,
            timestamp_ms,
        })
    }
}

fn meta_from_value(value: &serde_json::Value) -> SessionMeta {
    SessionMeta {
        name: value
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        last_modified: value
            .get("last_modified")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        entry_count: value
            .get("entry_count")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as usize,
    }
}
