use kp_core::app_error::{AppError, AppResult};
use kp_core::random::new_uuid;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

pub const STATUS_STARTED: &str = "started";
pub const STATUS_COMPLETED: &str = "completed";
pub const STATUS_ROLLED_BACK: &str = "rolled_back";

const MAX_ATTEMPTS: i64 = 3;

fn db_error(message: &str, e: impl ToString) -> AppError {
    AppError::new(
        "KP_DB_FAILED",
        "journal",
        message,
        false,
        serde_json::json!({ "error": e.to_string() }),
    )
}

#[derive(Debug, Clone, PartialEq)]
pub struct JournalRecord {
    pub op_id: String,
    pub op_type: String,
    pub payload_json: String,
    pub status: String,
    pub database_checksum: String,
    pub result_checksum: String,
    pub attempts: i64,
    pub started_at_ms: i64,
    pub completed_at_ms: Option<i64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoverySummary {
    pub incomplete: u32,
    pub failed: u32,
    pub recovered: u32,
    pub rolled_back: u32,
}

/// Open a journal record for a mutation and mirror it into
/// `incomplete_operations`. Returns the operation id.
pub fn begin(
    conn: &Connection,
    op_type: &str,
    payload: &Value,
    database_checksum: Option<&str>,
    now_ms: i64,
) -> AppResult<String> {
    let op_id = format!("op:{}:{}", now_ms, new_uuid());
    let payload_json = payload.to_string();
    let checksum = database_checksum.unwrap_or("unknown");

    conn.execute(
        "INSERT INTO state_journal
         (op_id, op_type, payload_json, status, database_checksum, result_checksum, attempts, started_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, '', 0, ?6)",
        params![op_id, op_type, payload_json, STATUS_STARTED, checksum, now_ms],
    )
    .map_err(|e| db_error("failed opening journal record", e))?;

    conn.execute(
        "INSERT INTO incomplete_operations
         (op_id, op_type, payload_json, database_checksum, result_checksum, attempts, started_at_ms)
         VALUES (?1, ?2, ?3, ?4, '', 0, ?5)",
        params![op_id, op_type, payload_json, checksum, now_ms],
    )
    .map_err(|e| db_error("failed mirroring incomplete operation", e))?;

    Ok(op_id)
}

/// Record the checksum the mutation produced; expected before the response
/// leaves the dispatcher.
pub fn complete(
    conn: &Connection,
    op_id: &str,
    result_checksum: &str,
    now_ms: i64,
) -> AppResult<()> {
    conn.execute(
        "UPDATE state_journal
         SET status = ?2, result_checksum = ?3, completed_at_ms = ?4
         WHERE op_id = ?1",
        params![op_id, STATUS_COMPLETED, result_checksum, now_ms],
    )
    .map_err(|e| db_error("failed completing journal record", e))?;
    conn.execute(
        "DELETE FROM incomplete_operations WHERE op_id = ?1",
        [op_id],
    )
    .map_err(|e| db_error("failed retiring incomplete operation", e))?;
    Ok(())
}

pub fn rollback(conn: &Connection, op_id: &str, error: &str, now_ms: i64) -> AppResult<()> {
    conn.execute(
        "UPDATE state_journal
         SET status = ?2, error = ?3, completed_at_ms = ?4
         WHERE op_id = ?1",
        params![op_id, STATUS_ROLLED_BACK, error, now_ms],
    )
    .map_err(|e| db_error("failed rolling back journal record", e))?;
    conn.execute(
        "DELETE FROM incomplete_operations WHERE op_id = ?1",
        [op_id],
    )
    .map_err(|e| db_error("failed retiring incomplete operation", e))?;
    Ok(())
}

/// Startup pass over `incomplete_operations`. A record whose
/// `result_checksum` matches the blob on disk actually landed: promote it.
/// Anything else is retained for up to three attempts, then rolled back.
pub fn recover_on_startup(
    conn: &Connection,
    current_checksum: Option<&str>,
    now_ms: i64,
) -> AppResult<RecoverySummary> {
    let mut summary = RecoverySummary::default();

    let rows: Vec<(String, String, i64)> = {
        let mut stmt = conn
            .prepare("SELECT op_id, result_checksum, attempts FROM incomplete_operations ORDER BY started_at_ms ASC")
            .map_err(|e| db_error("failed preparing recovery query", e))?;
        let mapped = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .map_err(|e| db_error("failed querying incomplete operations", e))?;
        let mut rows = Vec::new();
        for row in mapped {
            match row {
                Ok(values) => rows.push(values),
                Err(_) => summary.failed += 1,
            }
        }
        rows
    };

    for (op_id, result_checksum, attempts) in rows {
        let landed = !result_checksum.is_empty() && Some(result_checksum.as_str()) == current_checksum;
        if landed {
            complete(conn, &op_id, &result_checksum, now_ms)?;
            summary.recovered += 1;
        } else if attempts < MAX_ATTEMPTS {
            conn.execute(
                "UPDATE incomplete_operations SET attempts = attempts + 1 WHERE op_id = ?1",
                [&op_id],
            )
            .map_err(|e| db_error("failed bumping operation attempts", e))?;
            summary.incomplete += 1;
        } else {
            rollback(conn, &op_id, "exceeded_retries", now_ms)?;
            summary.rolled_back += 1;
        }
    }

    Ok(summary)
}

/// Cap `state_journal`, discarding oldest records first.
pub fn prune(conn: &Connection, cap: u32) -> AppResult<u32> {
    conn.execute(
        "DELETE FROM state_journal WHERE op_id NOT IN
         (SELECT op_id FROM state_journal ORDER BY started_at_ms DESC, op_id DESC LIMIT ?1)",
        [i64::from(cap)],
    )
    .map(|n| n as u32)
    .map_err(|e| db_error("failed pruning journal", e))
}

pub fn clear(conn: &Connection) -> AppResult<()> {
    conn.execute_batch("DELETE FROM state_journal; DELETE FROM incomplete_operations;")
        .map_err(|e| db_error("failed clearing journal", e))
}

pub fn get(conn: &Connection, op_id: &str) -> AppResult<Option<JournalRecord>> {
    conn.query_row(
        "SELECT op_id, op_type, payload_json, status, database_checksum, result_checksum,
                attempts, started_at_ms, completed_at_ms, error
         FROM state_journal WHERE op_id = ?1",
        [op_id],
        |row| {
            Ok(JournalRecord {
                op_id: row.get(0)?,
                op_type: row.get(1)?,
                payload_json: row.get(2)?,
                status: row.get(3)?,
                database_checksum: row.get(4)?,
                result_checksum: row.get(5)?,
                attempts: row.get(6)?,
                started_at_ms: row.get(7)?,
                completed_at_ms: row.get(8)?,
                error: row.get(9)?,
            })
        },
    )
    .optional()
    .map_err(|e| db_error("failed reading journal record", e))
}

pub fn count_by_status(conn: &Connection, status: &str) -> AppResult<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM state_journal WHERE status = ?1",
        [status],
        |row| row.get(0),
    )
    .map_err(|e| db_error("failed counting journal records", e))
}

pub fn incomplete_count(conn: &Connection) -> AppResult<i64> {
    conn.query_row("SELECT COUNT(*) FROM incomplete_operations", [], |row| {
        row.get(0)
    })
    .map_err(|e| db_error("failed counting incomplete operations", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secondary::open_secondary_in_memory;

    #[test]
    fn op_ids_carry_timestamp_and_uuid() {
        let conn = open_secondary_in_memory().expect("open");
        let op_id = begin(&conn, "create_entry", &serde_json::json!({}), None, 1234).expect("begin");
        assert!(op_id.starts_with("op:1234:"));
        assert_eq!(op_id.split(':').count(), 3);
        let record = get(&conn, &op_id).expect("get").expect("present");
        assert_eq!(record.database_checksum, "unknown");
        assert_eq!(record.status, STATUS_STARTED);
        assert_eq!(incomplete_count(&conn).expect("count"), 1);
    }

    #[test]
    fn complete_retires_the_mirror() {
        let conn = open_secondary_in_memory().expect("open");
        let op_id =
            begin(&conn, "update_entry", &serde_json::json!({}), Some("h0"), 1).expect("begin");
        complete(&conn, &op_id, "h1", 2).expect("complete");

        let record = get(&conn, &op_id).expect("get").expect("present");
        assert_eq!(record.status, STATUS_COMPLETED);
        assert_eq!(record.result_checksum, "h1");
        assert_eq!(record.completed_at_ms, Some(2));
        assert_eq!(incomplete_count(&conn).expect("count"), 0);
    }

    #[test]
    fn rollback_records_the_error() {
        let conn = open_secondary_in_memory().expect("open");
        let op_id =
            begin(&conn, "delete_entry", &serde_json::json!({}), Some("h0"), 1).expect("begin");
        rollback(&conn, &op_id, "primary write failed", 2).expect("rollback");

        let record = get(&conn, &op_id).expect("get").expect("present");
        assert_eq!(record.status, STATUS_ROLLED_BACK);
        assert_eq!(record.error.as_deref(), Some("primary write failed"));
        assert_eq!(incomplete_count(&conn).expect("count"), 0);
    }

    #[test]
    fn startup_promotes_landed_writes() {
        let conn = open_secondary_in_memory().expect("open");
        let op_id = begin(&conn, "create_entry", &serde_json::json!({}), Some("h0"), 1)
            .expect("begin");
        conn.execute(
            "UPDATE incomplete_operations SET result_checksum = 'h1' WHERE op_id = ?1",
            [&op_id],
        )
        .expect("seed result checksum");

        let summary = recover_on_startup(&conn, Some("h1"), 10).expect("recover");
        assert_eq!(summary.recovered, 1);
        assert_eq!(summary.rolled_back, 0);
        assert_eq!(
            get(&conn, &op_id).expect("get").expect("present").status,
            STATUS_COMPLETED
        );
    }

    #[test]
    fn startup_retains_then_rolls_back_after_three_attempts() {
        let conn = open_secondary_in_memory().expect("open");
        let op_id =
            begin(&conn, "create_entry", &serde_json::json!({}), Some("h0"), 1).expect("begin");

        for round in 0..3 {
            let summary = recover_on_startup(&conn, Some("different"), 10 + round).expect("recover");
            assert_eq!(summary.incomplete, 1, "round {round}");
            assert_eq!(summary.rolled_back, 0, "round {round}");
        }

        let summary = recover_on_startup(&conn, Some("different"), 20).expect("recover");
        assert_eq!(summary.incomplete, 0);
        assert_eq!(summary.rolled_back, 1);
        let record = get(&conn, &op_id).expect("get").expect("present");
        assert_eq!(record.status, STATUS_ROLLED_BACK);
        assert_eq!(record.error.as_deref(), Some("exceeded_retries"));
    }

    #[test]
    fn pruning_caps_the_journal_oldest_first() {
        let conn = open_secondary_in_memory().expect("open");
        for i in 0..20 {
            let op_id =
                begin(&conn, "edit", &serde_json::json!({ "i": i }), None, i).expect("begin");
            complete(&conn, &op_id, "h", i).expect("complete");
        }
        prune(&conn, 5).expect("prune");

        let remaining: i64 = conn
            .query_row("SELECT COUNT(*) FROM state_journal", [], |row| row.get(0))
            .expect("count");
        assert_eq!(remaining, 5);
        let oldest: i64 = conn
            .query_row(
                "SELECT MIN(started_at_ms) FROM state_journal",
                [],
                |row| row.get(0),
            )
            .expect("min");
        assert_eq!(oldest, 15);
    }
}
