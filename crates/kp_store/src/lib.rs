pub mod backup;
pub mod dual;
pub mod journal;
pub mod primary;
pub mod secondary;

pub use dual::{BlobMetadata, DualStore, LoadedDatabase, PersistOutcome, PersistReason};
pub use journal::{JournalRecord, RecoverySummary};
pub use primary::{FilePrimaryStore, MemoryPrimaryStore, PrimaryRecord, PrimaryStore};
