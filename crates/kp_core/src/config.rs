use serde::{Deserialize, Serialize};

/// Tunables for the keeper. Hosts deserialize this from their own settings
/// surface; every field falls back to the documented default.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeeperConfig {
    #[serde(default = "default_auto_lock_minutes")]
    pub auto_lock_minutes: u32,
    #[serde(default = "default_clipboard_clear_seconds")]
    pub clipboard_clear_seconds: u32,
    #[serde(default = "default_snapshot_interval_seconds")]
    pub snapshot_interval_seconds: u32,
    #[serde(default = "default_edit_threshold")]
    pub edit_threshold: u32,
    #[serde(default = "default_max_versions")]
    pub max_versions: u32,
    #[serde(default = "default_max_snapshots")]
    pub max_snapshots: u32,
    #[serde(default = "default_snapshot_max_age_days")]
    pub snapshot_max_age_days: u32,
    #[serde(default = "default_journal_cap")]
    pub journal_cap: u32,
    #[serde(default = "default_unlock_token_ttl_seconds")]
    pub unlock_token_ttl_seconds: u32,
    #[serde(default = "default_history_max_items")]
    pub history_max_items: u32,
}

fn default_auto_lock_minutes() -> u32 {
    15
}

fn default_clipboard_clear_seconds() -> u32 {
    15
}

fn default_snapshot_interval_seconds() -> u32 {
    3600
}

fn default_edit_threshold() -> u32 {
    10
}

fn default_max_versions() -> u32 {
    5
}

fn default_max_snapshots() -> u32 {
    10
}

fn default_snapshot_max_age_days() -> u32 {
    30
}

fn default_journal_cap() -> u32 {
    500
}

fn default_unlock_token_ttl_seconds() -> u32 {
    3600
}

fn default_history_max_items() -> u32 {
    10
}

impl Default for KeeperConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).expect("defaults are total")
    }
}

impl KeeperConfig {
    pub fn auto_lock_ms(&self) -> i64 {
        i64::from(self.auto_lock_minutes) * 60_000
    }

    pub fn clipboard_clear_ms(&self) -> i64 {
        i64::from(self.clipboard_clear_seconds) * 1_000
    }

    pub fn snapshot_interval_ms(&self) -> i64 {
        i64::from(self.snapshot_interval_seconds) * 1_000
    }

    pub fn snapshot_max_age_ms(&self) -> i64 {
        i64::from(self.snapshot_max_age_days) * 86_400_000
    }

    pub fn unlock_token_ttl_ms(&self) -> i64 {
        i64::from(self.unlock_token_ttl_seconds) * 1_000
    }
}
