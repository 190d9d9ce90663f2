use crate::app_error::AppResult;
use crate::protected::ProtectedValue;
use crate::random::new_uuid;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

pub const FIELD_TITLE: &str = "Title";
pub const FIELD_USERNAME: &str = "UserName";
pub const FIELD_PASSWORD: &str = "Password";
pub const FIELD_URL: &str = "URL";
pub const FIELD_NOTES: &str = "Notes";

pub const WELL_KNOWN_FIELDS: [&str; 5] = [
    FIELD_TITLE,
    FIELD_USERNAME,
    FIELD_PASSWORD,
    FIELD_URL,
    FIELD_NOTES,
];

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Plain(String),
    Protected(ProtectedValue),
}

impl FieldValue {
    pub fn cleartext(&self) -> String {
        match self {
            FieldValue::Plain(text) => text.clone(),
            FieldValue::Protected(value) => value.reveal().as_str().to_string(),
        }
    }

    pub fn is_protected(&self) -> bool {
        matches!(self, FieldValue::Protected(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryTimes {
    pub creation_time_ms: i64,
    pub last_mod_time_ms: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub id: Uuid,
    pub group: Uuid,
    pub icon_id: u32,
    pub fields: BTreeMap<String, FieldValue>,
    pub tags: Vec<String>,
    pub times: EntryTimes,
    pub history: Vec<Entry>,
}

impl Entry {
    pub fn new(group: Uuid, now_ms: i64) -> Self {
        Self {
            id: new_uuid(),
            group,
            icon_id: 0,
            fields: BTreeMap::new(),
            tags: Vec::new(),
            times: EntryTimes {
                creation_time_ms: now_ms,
                last_mod_time_ms: now_ms,
            },
            history: Vec::new(),
        }
    }

    pub fn get_field(&self, key: &str) -> Option<String> {
        self.fields.get(key).map(FieldValue::cleartext)
    }

    pub fn set_field(&mut self, key: &str, value: String) {
        self.fields.insert(key.to_string(), FieldValue::Plain(value));
    }

    pub fn set_protected_field(&mut self, key: &str, cleartext: &str) -> AppResult<()> {
        self.fields.insert(
            key.to_string(),
            FieldValue::Protected(ProtectedValue::new(cleartext)?),
        );
        Ok(())
    }

    /// Snapshot the current state into history. Must run before any field of
    /// the entry is overwritten; the snapshot itself carries no history so
    /// the structure stays flat. Oldest snapshots fall off past `max_items`.
    pub fn push_history(&mut self, max_items: usize) {
        let mut snapshot = self.clone();
        snapshot.history = Vec::new();
        self.history.push(snapshot);
        while self.history.len() > max_items {
            self.history.remove(0);
        }
    }

    pub fn title(&self) -> String {
        self.get_field(FIELD_TITLE).unwrap_or_default()
    }

    pub fn url(&self) -> String {
        self.get_field(FIELD_URL).unwrap_or_default()
    }

    /// Case-insensitive substring match against title, username, URL, notes
    /// and every tag.
    pub fn matches_search(&self, needle: &str) -> bool {
        let needle = needle.to_lowercase();
        for key in [FIELD_TITLE, FIELD_USERNAME, FIELD_URL, FIELD_NOTES] {
            if let Some(value) = self.get_field(key) {
                if value.to_lowercase().contains(&needle) {
                    return true;
                }
            }
        }
        self.tags
            .iter()
            .any(|tag| tag.to_lowercase().contains(&needle))
    }

    pub fn to_view(&self) -> EntryView {
        let mut custom = BTreeMap::new();
        for (key, value) in &self.fields {
            if !WELL_KNOWN_FIELDS.contains(&key.as_str()) {
                custom.insert(key.clone(), value.cleartext());
            }
        }
        EntryView {
            id: self.id,
            group_id: self.group,
            title: self.get_field(FIELD_TITLE).unwrap_or_default(),
            username: self.get_field(FIELD_USERNAME).unwrap_or_default(),
            password: self.get_field(FIELD_PASSWORD).unwrap_or_default(),
            url: self.get_field(FIELD_URL).unwrap_or_default(),
            notes: self.get_field(FIELD_NOTES).unwrap_or_default(),
            tags: self.tags.clone(),
            custom,
            creation_time_ms: self.times.creation_time_ms,
            last_mod_time_ms: self.times.last_mod_time_ms,
            history_len: self.history.len(),
        }
    }
}

/// Read-only projection handed across the dispatcher boundary. Cleartext by
/// construction; callers only receive it while the session is unlocked.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EntryView {
    pub id: Uuid,
    pub group_id: Uuid,
    pub title: String,
    pub username: String,
    pub password: String,
    pub url: String,
    pub notes: String,
    pub tags: Vec<String>,
    pub custom: BTreeMap<String, String>,
    pub creation_time_ms: i64,
    pub last_mod_time_ms: i64,
    pub history_len: usize,
}

/// Input shape for entry creation and update.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EntryData {
    #[serde(default)]
    pub id: Option<Uuid>,
    #[serde(default)]
    pub group_id: Option<Uuid>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub custom: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GroupView {
    pub id: Uuid,
    pub name: String,
    pub parent_id: Option<Uuid>,
    pub icon_id: u32,
    pub entry_count: usize,
}
