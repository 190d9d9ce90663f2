use crate::primary::{PrimaryRecord, PrimaryStore};
use crate::secondary::{
    append_version, clear_all, max_version, prune_versions, read_current, read_sync_status,
    usage_estimate, version_blob, version_count, write_current, write_sync_status, CurrentRecord,
    SyncStatus, VersionRecord,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use kp_core::app_error::{AppError, AppResult};
use kp_core::checksum::sha256_hex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

pub const INTEGRITY_HEALTHY: &str = "healthy";
pub const INTEGRITY_DEGRADED: &str = "degraded";
pub const INTEGRITY_CORRUPTED: &str = "corrupted";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistReason {
    /// Entry or vault mutation; the only reason that advances the
    /// edit-threshold counter.
    Edit,
    Create,
    Import,
    Recovery,
}

impl PersistReason {
    pub fn as_str(self) -> &'static str {
        match self {
            PersistReason::Edit => "edit",
            PersistReason::Create => "create",
            PersistReason::Import => "import",
            PersistReason::Recovery => "recovery",
        }
    }
}

/// Metadata persisted next to the blob in both stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobMetadata {
    pub name: String,
    pub last_modified: String,
    pub entry_count: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PersistOutcome {
    pub primary_ok: bool,
    pub secondary_ok: bool,
    pub checksum_match: bool,
    pub version: i64,
    pub checksum: String,
    pub warnings: Vec<String>,
}

impl PersistOutcome {
    pub fn success(&self) -> bool {
        self.primary_ok && self.secondary_ok
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadSource {
    Primary,
    Secondary,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadedDatabase {
    pub blob: Vec<u8>,
    pub metadata: serde_json::Value,
    pub source: LoadSource,
    pub version: i64,
    pub checksum: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub primary_bytes: u64,
    pub secondary_bytes: i64,
    pub last_sync_ms: i64,
    pub last_checksum: String,
    pub version_count: i64,
    pub latest_version: i64,
    pub integrity: String,
    pub warnings: Vec<String>,
}

/// Primary flat store + secondary indexed store behind one write path with
/// checksum verification and fallback reads.
pub struct DualStore {
    conn: Connection,
    primary: Box<dyn PrimaryStore>,
}

impl DualStore {
    pub fn new(conn: Connection, primary: Box<dyn PrimaryStore>) -> Self {
        Self { conn, primary }
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Swap the primary store; test hook for fault injection mid-sequence.
    pub fn primary_mut(&mut self) -> &mut dyn PrimaryStore {
        self.primary.as_mut()
    }

    pub fn current_checksum(&self) -> AppResult<Option<String>> {
        Ok(read_current(&self.conn)?.map(|record| record.checksum))
    }

    /// The full write path: checksum, secondary current + version append,
    /// primary write, verifying read-back, sync status, version pruning.
    /// Partial failures land in the outcome rather than an error; the caller
    /// decides what partial success means for it.
    pub fn persist(
        &mut self,
        blob: &[u8],
        metadata: &BlobMetadata,
        reason: PersistReason,
        max_versions: u32,
        now_ms: i64,
    ) -> AppResult<PersistOutcome> {
        let checksum = sha256_hex(blob);
        let metadata_json = serde_json::to_string(metadata)
            .map_err(|e| AppError::internal(&format!("metadata serialization: {e}")))?;
        let mut warnings = Vec::new();

        let version = match read_current(&self.conn) {
            Ok(current) => current.map(|c| c.version).unwrap_or(0) + 1,
            Err(e) => {
                warnings.push(format!("version read failed: {}", e.message));
                max_version(&self.conn).ok().flatten().unwrap_or(0) + 1
            }
        };

        let mut secondary_ok = true;
        if let Err(e) = write_current(
            &self.conn,
            &CurrentRecord {
                blob: blob.to_vec(),
                checksum: checksum.clone(),
                ts_ms: now_ms,
                version,
                metadata_json: metadata_json.clone(),
                source: reason.as_str().to_string(),
            },
        ) {
            secondary_ok = false;
            warnings.push(format!("secondary write failed: {}", e.message));
        }
        if secondary_ok {
            if let Err(e) = append_version(
                &self.conn,
                &VersionRecord {
                    version,
                    blob: blob.to_vec(),
                    checksum: checksum.clone(),
                    ts_ms: now_ms,
                    metadata_json,
                    reason: "current".to_string(),
                },
            ) {
                secondary_ok = false;
                warnings.push(format!("version append failed: {}", e.message));
            }
        }

        let record = PrimaryRecord {
            blob_text: BASE64.encode(blob),
            metadata: serde_json::to_value(metadata)
                .map_err(|e| AppError::internal(&format!("metadata serialization: {e}")))?,
        };
        let primary_ok = match self.primary.put(&record) {
            Ok(()) => true,
            Err(e) => {
                warnings.push(format!("primary write failed: {}", e.message));
                false
            }
        };

        let mut checksum_match = false;
        if primary_ok {
            // one in-place retry before declaring the write degraded
            for attempt in 0..2 {
                match self.verify_primary(&checksum) {
                    Ok(true) => {
                        checksum_match = true;
                        break;
                    }
                    Ok(false) if attempt == 0 => {
                        let _ = self.primary.put(&record);
                    }
                    Ok(false) => warnings.push("primary read-back checksum mismatch".to_string()),
                    Err(e) if attempt == 0 => {
                        warnings.push(format!("primary read-back failed once: {}", e.message));
                    }
                    Err(e) => {
                        warnings.push(format!("primary read-back failed: {}", e.message));
                        break;
                    }
                }
            }
        }

        let integrity = if checksum_match {
            INTEGRITY_HEALTHY
        } else {
            INTEGRITY_DEGRADED
        };
        if let Err(e) = write_sync_status(
            &self.conn,
            &SyncStatus {
                last_sync_ms: now_ms,
                last_checksum: checksum.clone(),
                integrity: integrity.to_string(),
            },
        ) {
            warnings.push(format!("sync status write failed: {}", e.message));
        }

        if secondary_ok {
            if let Err(e) = prune_versions(&self.conn, i64::from(max_versions)) {
                warnings.push(format!("version pruning failed: {}", e.message));
            }
        }

        Ok(PersistOutcome {
            primary_ok,
            secondary_ok,
            checksum_match,
            version,
            checksum,
            warnings,
        })
    }

    fn verify_primary(&self, expected_checksum: &str) -> AppResult<bool> {
        let Some(record) = self.primary.read()? else {
            return Ok(false);
        };
        let blob = BASE64.decode(record.blob_text.as_bytes()).map_err(|e| {
            AppError::new(
                "KP_BLOB_CORRUPT",
                "dual_store",
                "primary blob text is not base64",
                false,
                serde_json::json!({ "error": e.to_string() }),
            )
        })?;
        Ok(sha256_hex(&blob) == expected_checksum)
    }

    /// Primary first; the indexed store is the fallback. `None` when neither
    /// holds a database.
    pub fn load(&self) -> AppResult<Option<LoadedDatabase>> {
        if let Ok(Some(record)) = self.primary.read() {
            if let Ok(blob) = BASE64.decode(record.blob_text.as_bytes()) {
                let checksum = sha256_hex(&blob);
                let version = read_current(&self.conn)
                    .ok()
                    .flatten()
                    .map(|c| c.version)
                    .unwrap_or(0);
                return Ok(Some(LoadedDatabase {
                    blob,
                    metadata: record.metadata,
                    source: LoadSource::Primary,
                    version,
                    checksum,
                }));
            }
        }

        match read_current(&self.conn)? {
            Some(current) => {
                let metadata = serde_json::from_str(&current.metadata_json)
                    .unwrap_or(serde_json::Value::Null);
                Ok(Some(LoadedDatabase {
                    blob: current.blob,
                    metadata,
                    source: LoadSource::Secondary,
                    version: current.version,
                    checksum: current.checksum,
                }))
            }
            None => Ok(None),
        }
    }

    /// A historical version's blob; falls back to the current blob when the
    /// requested version has been pruned.
    pub fn recover(&self, version: i64) -> AppResult<Vec<u8>> {
        if let Some((blob, _)) = version_blob(&self.conn, version)? {
            return Ok(blob);
        }
        if let Some(current) = read_current(&self.conn)? {
            return Ok(current.blob);
        }
        Err(AppError::not_found("database version"))
    }

    pub fn health(&self) -> AppResult<HealthReport> {
        let mut warnings = Vec::new();
        let primary_bytes = self.primary.bytes_in_use().unwrap_or_else(|e| {
            warnings.push(format!("primary size unavailable: {}", e.message));
            0
        });
        let secondary_bytes = usage_estimate(&self.conn)?;
        let status = read_sync_status(&self.conn)?;
        let integrity = status
            .as_ref()
            .map(|s| s.integrity.clone())
            .unwrap_or_else(|| INTEGRITY_HEALTHY.to_string());
        if integrity != INTEGRITY_HEALTHY {
            warnings.push(format!("storage integrity is {integrity}"));
        }

        Ok(HealthReport {
            primary_bytes,
            secondary_bytes,
            last_sync_ms: status.as_ref().map(|s| s.last_sync_ms).unwrap_or(0),
            last_checksum: status.map(|s| s.last_checksum).unwrap_or_default(),
            version_count: version_count(&self.conn)?,
            latest_version: max_version(&self.conn)?.unwrap_or(0),
            integrity,
            warnings,
        })
    }

    /// Empty every logical store and the primary blob.
    pub fn delete_all(&mut self) -> AppResult<()> {
        clear_all(&self.conn)?;
        self.primary.clear()
    }
}
