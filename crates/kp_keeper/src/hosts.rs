use kp_core::app_error::AppResult;
use kp_core::protected::ProtectedValue;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

/// Persistent alarm facility provided by the host. Deadlines are absolute
/// wall-clock milliseconds; the host calls `Keeper::handle_alarm` when one
/// fires. The keeper re-derives and re-arms its deadlines from persisted
/// state at startup, so alarms survive process termination.
pub trait AlarmHost {
    fn arm(&mut self, name: &str, at_ms: i64);
    fn clear(&mut self, name: &str);
}

/// Best-effort clipboard access.
pub trait ClipboardHost {
    fn write(&mut self, text: &str) -> AppResult<()>;
}

/// Opaque credential material enabling transparent re-unlock after a host
/// restart. The wrapped passphrase never appears in cleartext at rest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnlockTokenRecord {
    pub token: ProtectedValue,
    pub created_at_ms: i64,
    pub expires_at_ms: i64,
}

impl UnlockTokenRecord {
    pub fn expired(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at_ms
    }
}

/// Process-restart-survivable, process-exit-cleared storage for the unlock
/// token. Production hosts back this with an exit-bound session store or an
/// OS keychain.
pub trait SessionTokenStore {
    fn put(&mut self, record: &UnlockTokenRecord) -> AppResult<()>;
    fn get(&self) -> AppResult<Option<UnlockTokenRecord>>;
    fn clear(&mut self) -> AppResult<()>;
}

/// In-memory token store; doubles as the restart-survivable store in tests,
/// where "restart" keeps the store alive and rebuilds the keeper.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    record: Option<UnlockTokenRecord>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionTokenStore for MemoryTokenStore {
    fn put(&mut self, record: &UnlockTokenRecord) -> AppResult<()> {
        self.record = Some(record.clone());
        Ok(())
    }

    fn get(&self) -> AppResult<Option<UnlockTokenRecord>> {
        Ok(self.record.clone())
    }

    fn clear(&mut self) -> AppResult<()> {
        self.record = None;
        Ok(())
    }
}

/// Alarm host that records the armed deadlines; tests read them back and
/// fire `Keeper::handle_alarm` by hand.
#[derive(Debug, Default)]
pub struct RecordingAlarms {
    pub armed: BTreeMap<String, i64>,
}

impl RecordingAlarms {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AlarmHost for RecordingAlarms {
    fn arm(&mut self, name: &str, at_ms: i64) {
        self.armed.insert(name.to_string(), at_ms);
    }

    fn clear(&mut self, name: &str) {
        self.armed.remove(name);
    }
}

/// Clipboard that remembers the last write; the default when the host has
/// no clipboard surface.
#[derive(Debug, Default)]
pub struct NullClipboard {
    pub last: Option<String>,
}

impl ClipboardHost for NullClipboard {
    fn write(&mut self, text: &str) -> AppResult<()> {
        self.last = Some(text.to_string());
        Ok(())
    }
}

// The keeper runs on a single cooperative task loop, so hosts may be shared
// with the embedding test or UI through Rc<RefCell<..>>.

impl<T: AlarmHost> AlarmHost for Rc<RefCell<T>> {
    fn arm(&mut self, name: &str, at_ms: i64) {
        self.borrow_mut().arm(name, at_ms);
    }

    fn clear(&mut self, name: &str) {
        self.borrow_mut().clear(name);
    }
}

impl<T: ClipboardHost> ClipboardHost for Rc<RefCell<T>> {
    fn write(&mut self, text: &str) -> AppResult<()> {
        self.borrow_mut().write(text)
    }
}

impl<T: SessionTokenStore> SessionTokenStore for Rc<RefCell<T>> {
    fn put(&mut self, record: &UnlockTokenRecord) -> AppResult<()> {
        self.borrow_mut().put(record)
    }

    fn get(&self) -> AppResult<Option<UnlockTokenRecord>> {
        self.borrow().get()
    }

    fn clear(&mut self) -> AppResult<()> {
        self.borrow_mut().clear()
    }
}
