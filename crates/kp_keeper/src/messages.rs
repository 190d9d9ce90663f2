use crate::session::SessionMeta;
use kp_core::app_error::AppError;
use kp_core::entry::{EntryData, EntryView, GroupView};
use kp_core::passgen::GeneratorOptions;
use kp_core::vault::EntryFilter;
use kp_store::backup::SnapshotInfo;
use kp_store::dual::HealthReport;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use uuid::Uuid;

/// Sentinel error string: the caller's cue to route to its unlock screen.
pub const NOT_UNLOCKED: &str = "NOT_UNLOCKED";
pub const WRONG_PASSWORD: &str = "Wrong password. Try again.";

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreateDatabasePayload {
    pub name: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ImportDatabasePayload {
    /// Base64 of the `.kdbx` bytes.
    pub blob: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UnlockPayload {
    pub password: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct IdPayload {
    pub id: Uuid,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TextPayload {
    pub text: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UrlPayload {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BackupHistoryPayload {
    #[serde(default)]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RestorePayload {
    pub timestamp_ms: i64,
    pub password: String,
}

/// The complete request surface; the wire shape is `{type, payload}`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload")]
pub enum Request {
    #[serde(rename = "GET_STATE")]
    GetState,
    #[serde(rename = "CREATE_DATABASE")]
    CreateDatabase(CreateDatabasePayload),
    #[serde(rename = "IMPORT_DATABASE")]
    ImportDatabase(ImportDatabasePayload),
    #[serde(rename = "UNLOCK")]
    Unlock(UnlockPayload),
    #[serde(rename = "LOCK")]
    Lock,
    #[serde(rename = "GET_ENTRIES")]
    GetEntries(Option<EntryFilter>),
    #[serde(rename = "GET_ENTRY")]
    GetEntry(IdPayload),
    #[serde(rename = "CREATE_ENTRY")]
    CreateEntry(EntryData),
    #[serde(rename = "UPDATE_ENTRY")]
    UpdateEntry(EntryData),
    #[serde(rename = "DELETE_ENTRY")]
    DeleteEntry(IdPayload),
    #[serde(rename = "GET_GROUPS")]
    GetGroups,
    #[serde(rename = "GENERATE_PASSWORD")]
    GeneratePassword(Option<GeneratorOptions>),
    #[serde(rename = "COPY_TO_CLIPBOARD")]
    CopyToClipboard(TextPayload),
    #[serde(rename = "EXPORT_DATABASE")]
    ExportDatabase,
    #[serde(rename = "GET_ENTRIES_FOR_URL")]
    GetEntriesForUrl(UrlPayload),
    #[serde(rename = "FILL_IN_TAB")]
    FillInTab(UrlPayload),
    #[serde(rename = "GET_BACKUP_HISTORY")]
    GetBackupHistory(Option<BackupHistoryPayload>),
    #[serde(rename = "RESTORE_FROM_BACKUP")]
    RestoreFromBackup(RestorePayload),
    #[serde(rename = "GET_STORAGE_HEALTH")]
    GetStorageHealth,
    #[serde(rename = "GET_RECOVERY_STATUS")]
    GetRecoveryStatus,
    #[serde(rename = "DELETE_DATABASE")]
    DeleteDatabase,
    #[serde(rename = "DOWNLOAD_EXPORT")]
    DownloadExport,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateView {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<SessionMeta>,
}

/// One branch per data shape the dispatcher can emit.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ResponseData {
    State(StateView),
    #[serde(rename_all = "camelCase")]
    Created {
        state: StateView,
        #[serde(skip_serializing_if = "Option::is_none")]
        recovery_code: Option<String>,
    },
    Entries {
        entries: Vec<EntryView>,
    },
    Entry {
        entry: EntryView,
    },
    Deleted {
        deleted: bool,
    },
    Groups {
        groups: Vec<GroupView>,
    },
    Password {
        password: String,
        strength: u8,
    },
    Export {
        filename: String,
        /// Base64 of the `.kdbx` bytes.
        blob: String,
    },
    Snapshots {
        snapshots: Vec<SnapshotInfo>,
    },
    #[serde(rename_all = "camelCase")]
    Restored {
        restored: bool,
        timestamp_ms: i64,
    },
    Health(HealthReport),
    #[serde(rename_all = "camelCase")]
    RecoveryStatus {
        configured: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        created_at_ms: Option<i64>,
    },
    Ack {},
}

/// Uniform envelope: `{success: true, data} | {success: false, error}`.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Ok { data: ResponseData },
    Err { error: String },
}

impl Response {
    pub fn ok(data: ResponseData) -> Self {
        Self::Ok { data }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self::Err {
            error: error.into(),
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, Response::Ok { .. })
    }

    pub fn data(&self) -> Option<&ResponseData> {
        match self {
            Response::Ok { data } => Some(data),
            Response::Err { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Response::Ok { .. } => None,
            Response::Err { error } => Some(error),
        }
    }

    /// Render an internal error into the envelope string the UI shows.
    pub fn from_error(error: &AppError) -> Self {
        let rendered = match error.code.as_str() {
            "KP_NOT_UNLOCKED" => NOT_UNLOCKED.to_string(),
            "KP_KEY_INVALID" => WRONG_PASSWORD.to_string(),
            _ => error.message.clone(),
        };
        Self::Err { error: rendered }
    }
}

impl Serialize for Response {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(2))?;
        match self {
            Response::Ok { data } => {
                map.serialize_entry("success", &true)?;
                map.serialize_entry("data", data)?;
            }
            Response::Err { error } => {
                map.serialize_entry("success", &false)?;
                map.serialize_entry("error", error)?;
            }
        }
        map.end()
    }
}
