pub mod argon;
pub mod hosts;
pub mod keeper;
pub mod messages;
pub mod session;

pub use argon::Argon2Engine;
pub use hosts::{
    AlarmHost, ClipboardHost, MemoryTokenStore, NullClipboard, RecordingAlarms,
    SessionTokenStore, UnlockTokenRecord,
};
pub use keeper::{Keeper, ALARM_AUTO_LOCK, ALARM_CLIPBOARD_CLEAR, ALARM_HOURLY_SNAPSHOT};
pub use messages::{Request, Response, ResponseData};
pub use session::SessionState;
