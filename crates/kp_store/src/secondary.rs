use kp_core::app_error::{AppError, AppResult};
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::Path;

const LATEST_SCHEMA_VERSION: i64 = 1;

pub const CURRENT_KEY: &str = "db:current";
pub const RECOVERY_KEY: &str = "recovery:current";
pub const SYNC_STATUS_KEY: &str = "sync:status";

fn db_error(message: &str, e: impl ToString) -> AppError {
    AppError::new(
        "KP_DB_FAILED",
        "secondary_store",
        message,
        false,
        serde_json::json!({ "error": e.to_string() }),
    )
}

/// Open the indexed store, creating directories and applying migrations.
/// Idempotent; the schema gate is `PRAGMA user_version`.
pub fn open_secondary(db_path: &Path) -> AppResult<Connection> {
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| db_error("failed to create database parent directory", e))?;
    }

    let conn = Connection::open(db_path)
        .map_err(|e| db_error("failed to open sqlite database", e))?;
    conn.pragma_update(None, "foreign_keys", "ON")
        .map_err(|e| db_error("failed to enable foreign_keys pragma", e))?;
    apply_migrations(&conn)?;
    Ok(conn)
}

/// In-memory store for tests; same schema, no file.
pub fn open_secondary_in_memory() -> AppResult<Connection> {
    let conn = Connection::open_in_memory()
        .map_err(|e| db_error("failed to open in-memory database", e))?;
    apply_migrations(&conn)?;
    Ok(conn)
}

pub fn apply_migrations(conn: &Connection) -> AppResult<()> {
    let current = schema_version(conn)?;
    if current > LATEST_SCHEMA_VERSION {
        return Err(AppError::new(
            "KP_DB_SCHEMA_INCOMPATIBLE",
            "secondary_store",
            "database schema version is newer than supported",
            false,
            serde_json::json!({ "current": current, "latest": LATEST_SCHEMA_VERSION }),
        ));
    }

    if current < 1 {
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| db_error("failed to begin migration transaction", e))?;
        tx.execute_batch(include_str!("../migrations/0001_init.sql"))
            .map_err(|e| db_error("failed to apply migration 0001", e))?;
        tx.pragma_update(None, "user_version", 1i64)
            .map_err(|e| db_error("failed to set schema user_version", e))?;
        tx.commit()
            .map_err(|e| db_error("failed to commit migration transaction", e))?;
    }
    Ok(())
}

pub fn schema_version(conn: &Connection) -> AppResult<i64> {
    conn.query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(|e| db_error("failed to read schema version", e))
}

/// The `databases["db:current"]` row.
#[derive(Debug, Clone, PartialEq)]
pub struct CurrentRecord {
    pub blob: Vec<u8>,
    pub checksum: String,
    pub ts_ms: i64,
    pub version: i64,
    pub metadata_json: String,
    pub source: String,
}

pub fn read_current(conn: &Connection) -> AppResult<Option<CurrentRecord>> {
    conn.query_row(
        "SELECT blob, checksum, ts_ms, version, metadata_json, source
         FROM databases WHERE key = ?1",
        [CURRENT_KEY],
        |row| {
            Ok(CurrentRecord {
                blob: row.get(0)?,
                checksum: row.get(1)?,
                ts_ms: row.get(2)?,
                version: row.get(3)?,
                metadata_json: row.get(4)?,
                source: row.get(5)?,
            })
        },
    )
    .optional()
    .map_err(|e| db_error("failed reading current database row", e))
}

pub fn write_current(conn: &Connection, record: &CurrentRecord) -> AppResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO databases (key, blob, checksum, ts_ms, version, metadata_json, source)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            CURRENT_KEY,
            record.blob,
            record.checksum,
            record.ts_ms,
            record.version,
            record.metadata_json,
            record.source
        ],
    )
    .map_err(|e| db_error("failed writing current database row", e))?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct VersionRecord {
    pub version: i64,
    pub blob: Vec<u8>,
    pub checksum: String,
    pub ts_ms: i64,
    pub metadata_json: String,
    pub reason: String,
}

pub fn append_version(conn: &Connection, record: &VersionRecord) -> AppResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO database_versions (version, blob, checksum, ts_ms, metadata_json, reason)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            record.version,
            record.blob,
            record.checksum,
            record.ts_ms,
            record.metadata_json,
            record.reason
        ],
    )
    .map_err(|e| db_error("failed appending database version", e))?;
    Ok(())
}

pub fn version_blob(conn: &Connection, version: i64) -> AppResult<Option<(Vec<u8>, String)>> {
    conn.query_row(
        "SELECT blob, checksum FROM database_versions WHERE version = ?1",
        [version],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .optional()
    .map_err(|e| db_error("failed reading database version", e))
}

pub fn version_count(conn: &Connection) -> AppResult<i64> {
    conn.query_row("SELECT COUNT(*) FROM database_versions", [], |row| {
        row.get(0)
    })
    .map_err(|e| db_error("failed counting database versions", e))
}

pub fn max_version(conn: &Connection) -> AppResult<Option<i64>> {
    conn.query_row("SELECT MAX(version) FROM database_versions", [], |row| {
        row.get::<_, Option<i64>>(0)
    })
    .map_err(|e| db_error("failed reading latest version", e))
}

/// Delete oldest versions (ascending) until at most `keep` remain.
pub fn prune_versions(conn: &Connection, keep: i64) -> AppResult<u32> {
    conn.execute(
        "DELETE FROM database_versions WHERE version NOT IN
         (SELECT version FROM database_versions ORDER BY version DESC LIMIT ?1)",
        [keep],
    )
    .map(|n| n as u32)
    .map_err(|e| db_error("failed pruning database versions", e))
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncStatus {
    pub last_sync_ms: i64,
    pub last_checksum: String,
    pub integrity: String,
}

pub fn read_sync_status(conn: &Connection) -> AppResult<Option<SyncStatus>> {
    conn.query_row(
        "SELECT last_sync_ms, last_checksum, integrity FROM sync_status WHERE key = ?1",
        [SYNC_STATUS_KEY],
        |row| {
            Ok(SyncStatus {
                last_sync_ms: row.get(0)?,
                last_checksum: row.get(1)?,
                integrity: row.get(2)?,
            })
        },
    )
    .optional()
    .map_err(|e| db_error("failed reading sync status", e))
}

pub fn write_sync_status(conn: &Connection, status: &SyncStatus) -> AppResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO sync_status (key, last_sync_ms, last_checksum, integrity)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            SYNC_STATUS_KEY,
            status.last_sync_ms,
            status.last_checksum,
            status.integrity
        ],
    )
    .map_err(|e| db_error("failed writing sync status", e))?;
    Ok(())
}

pub fn write_recovery_code(conn: &Connection, code_checksum: &str, now_ms: i64) -> AppResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO recovery_codes (key, code_checksum, created_at_ms)
         VALUES (?1, ?2, ?3)",
        params![RECOVERY_KEY, code_checksum, now_ms],
    )
    .map_err(|e| db_error("failed writing recovery code", e))?;
    Ok(())
}

pub fn read_recovery_code(conn: &Connection) -> AppResult<Option<(String, i64)>> {
    conn.query_row(
        "SELECT code_checksum, created_at_ms FROM recovery_codes WHERE key = ?1",
        [RECOVERY_KEY],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .optional()
    .map_err(|e| db_error("failed reading recovery code", e))
}

/// Estimated bytes held by the secondary store's payload tables.
pub fn usage_estimate(conn: &Connection) -> AppResult<i64> {
    conn.query_row(
        "SELECT COALESCE((SELECT SUM(LENGTH(blob)) FROM databases), 0)
              + COALESCE((SELECT SUM(LENGTH(blob)) FROM database_versions), 0)
              + COALESCE((SELECT SUM(LENGTH(blob)) FROM backup_snapshots), 0)",
        [],
        |row| row.get(0),
    )
    .map_err(|e| db_error("failed estimating storage usage", e))
}

/// Empty every logical store.
pub fn clear_all(conn: &Connection) -> AppResult<()> {
    conn.execute_batch(
        "DELETE FROM databases;
         DELETE FROM database_versions;
         DELETE FROM backup_snapshots;
         DELETE FROM recovery_codes;
         DELETE FROM state_journal;
         DELETE FROM incomplete_operations;
         DELETE FROM sync_status;",
    )
    .map_err(|e| db_error("failed clearing stores", e))
}
