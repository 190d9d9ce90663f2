use kp_core::app_error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

fn io_error(message: &str, e: impl ToString) -> AppError {
    AppError::new(
        "KP_IO",
        "primary_store",
        message,
        true,
        serde_json::json!({ "error": e.to_string() }),
    )
}

/// The flat envelope: the base64 blob text plus its metadata record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrimaryRecord {
    pub blob_text: String,
    pub metadata: serde_json::Value,
}

/// Flat key/value persistence for the current database. Small values,
/// guaranteed durability; the indexed store handles anything heavier.
pub trait PrimaryStore {
    fn put(&mut self, record: &PrimaryRecord) -> AppResult<()>;
    fn read(&self) -> AppResult<Option<PrimaryRecord>>;
    fn clear(&mut self) -> AppResult<()>;
    fn bytes_in_use(&self) -> AppResult<u64>;
}

#[derive(Serialize, Deserialize)]
struct PrimaryDocument {
    kdbx_database: String,
    kdbx_meta: serde_json::Value,
}

/// File-backed primary store: one JSON document, written atomically via a
/// temp file in the same directory, restricted to the owner on unix.
pub struct FilePrimaryStore {
    path: PathBuf,
}

impl FilePrimaryStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn atomic_write(&self, bytes: &[u8]) -> AppResult<()> {
        let parent = self
            .path
            .parent()
            .ok_or_else(|| AppError::internal("primary store path has no parent directory"))?;
        fs::create_dir_all(parent)
            .map_err(|e| io_error("failed creating primary store directory", e))?;

        let mut temp = tempfile::NamedTempFile::new_in(parent)
            .map_err(|e| io_error("failed creating temp file", e))?;
        temp.write_all(bytes)
            .map_err(|e| io_error("failed writing primary store", e))?;
        temp.flush()
            .map_err(|e| io_error("failed flushing primary store", e))?;
        temp.as_file()
            .sync_all()
            .map_err(|e| io_error("failed syncing primary store", e))?;
        temp.persist(&self.path)
            .map_err(|e| io_error("failed promoting primary store write", e.error))?;
        restrict_file(&self.path)?;
        Ok(())
    }
}

fn restrict_file(path: &Path) -> AppResult<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if path.exists() {
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))
                .map_err(|e| io_error("failed restricting primary store permissions", e))?;
        }
    }
    let _ = path;
    Ok(())
}

impl PrimaryStore for FilePrimaryStore {
    fn put(&mut self, record: &PrimaryRecord) -> AppResult<()> {
        let doc = PrimaryDocument {
            kdbx_database: record.blob_text.clone(),
            kdbx_meta: record.metadata.clone(),
        };
        let bytes = serde_json::to_vec(&doc)
            .map_err(|e| io_error("failed serializing primary store document", e))?;
        self.atomic_write(&bytes)
    }

    fn read(&self) -> AppResult<Option<PrimaryRecord>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let bytes =
            fs::read(&self.path).map_err(|e| io_error("failed reading primary store", e))?;
        let doc: PrimaryDocument = serde_json::from_slice(&bytes)
            .map_err(|e| io_error("failed parsing primary store document", e))?;
        Ok(Some(PrimaryRecord {
            blob_text: doc.kdbx_database,
            metadata: doc.kdbx_meta,
        }))
    }

    fn clear(&mut self) -> AppResult<()> {
        if self.path.exists() {
            fs::remove_file(&self.path).map_err(|e| io_error("failed clearing primary store", e))?;
        }
        Ok(())
    }

    fn bytes_in_use(&self) -> AppResult<u64> {
        if !self.path.exists() {
            return Ok(0);
        }
        fs::metadata(&self.path)
            .map(|m| m.len())
            .map_err(|e| io_error("failed reading primary store size", e))
    }
}

/// Test double with switchable read/write faults, used for the crash and
/// fallback scenarios.
#[derive(Default)]
pub struct MemoryPrimaryStore {
    record: Option<PrimaryRecord>,
    pub fail_writes: bool,
    pub fail_reads: bool,
}

impl MemoryPrimaryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PrimaryStore for MemoryPrimaryStore {
    fn put(&mut self, record: &PrimaryRecord) -> AppResult<()> {
        if self.fail_writes {
            return Err(io_error("primary store write fault injected", "fault"));
        }
        self.record = Some(record.clone());
        Ok(())
    }

    fn read(&self) -> AppResult<Option<PrimaryRecord>> {
        if self.fail_reads {
            return Err(io_error("primary store read fault injected", "fault"));
        }
        Ok(self.record.clone())
    }

    fn clear(&mut self) -> AppResult<()> {
        self.record = None;
        Ok(())
    }

    fn bytes_in_use(&self) -> AppResult<u64> {
        Ok(self
            .record
            .as_ref()
            .map(|r| r.blob_text.len() as u64)
            .unwrap_or(0))
    }
}

// The keeper runs single-threaded; a primary store may be shared with the
// embedding host or a test through Rc<RefCell<..>>.
impl<T: PrimaryStore> PrimaryStore for std::rc::Rc<std::cell::RefCell<T>> {
    fn put(&mut self, record: &PrimaryRecord) -> AppResult<()> {
        self.borrow_mut().put(record)
    }

    fn read(&self) -> AppResult<Option<PrimaryRecord>> {
        self.borrow().read()
    }

    fn clear(&mut self) -> AppResult<()> {
        self.borrow_mut().clear()
    }

    fn bytes_in_use(&self) -> AppResult<u64> {
        self.borrow().bytes_in_use()
    }
}
