use kp_core::vault::Vault;
use serde::Serialize;

/// Current-database metadata exposed while the session itself is locked.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMeta {
    pub name: String,
    pub last_modified: String,
    pub entry_count: usize,
}

/// The session sum type. `Unlocked` is the only variant holding decrypted
/// material; leaving it drops the vault and with it every protected buffer.
#[derive(Clone)]
pub enum SessionState {
    NoDatabase,
    Locked { meta: SessionMeta },
    Unlocked { vault: Vault },
}

impl SessionState {
    pub fn status(&self) -> &'static str {
        match self {
            SessionState::NoDatabase => "no_database",
            SessionState::Locked { .. } => "locked",
            SessionState::Unlocked { .. } => "unlocked",
        }
    }

    pub fn vault(&self) -> Option<&Vault> {
        match self {
            SessionState::Unlocked { vault } => Some(vault),
            _ => None,
        }
    }

    pub fn vault_mut(&mut self) -> Option<&mut Vault> {
        match self {
            SessionState::Unlocked { vault } => Some(vault),
            _ => None,
        }
    }
}
