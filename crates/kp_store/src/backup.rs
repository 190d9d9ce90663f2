use kp_core::app_error::{AppError, AppResult};
use kp_core::config::KeeperConfig;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

pub const REASON_HOURLY: &str = "hourly";
pub const REASON_EDIT_THRESHOLD: &str = "edit_threshold";
pub const REASON_MANUAL: &str = "manual";

fn db_error(message: &str, e: impl ToString) -> AppError {
    AppError::new(
        "KP_DB_FAILED",
        "backup",
        message,
        false,
        serde_json::json!({ "error": e.to_string() }),
    )
}

#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotRecord {
    pub ts_ms: i64,
    pub blob: Vec<u8>,
    pub checksum: String,
    pub version: i64,
    pub metadata_json: String,
    pub reason: String,
    pub edit_count: i64,
    pub auto_snapshot: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotInfo {
    pub timestamp_ms: i64,
    pub version: i64,
    pub reason: String,
    pub size: i64,
}

pub fn insert_snapshot(conn: &Connection, record: &SnapshotRecord) -> AppResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO backup_snapshots
         (ts_ms, blob, checksum, version, metadata_json, reason, edit_count, auto_snapshot)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            record.ts_ms,
            record.blob,
            record.checksum,
            record.version,
            record.metadata_json,
            record.reason,
            record.edit_count,
            record.auto_snapshot
        ],
    )
    .map_err(|e| db_error("failed inserting snapshot", e))?;
    Ok(())
}

pub fn snapshot_at(conn: &Connection, ts_ms: i64) -> AppResult<Option<SnapshotRecord>> {
    conn.query_row(
        "SELECT ts_ms, blob, checksum, version, metadata_json, reason, edit_count, auto_snapshot
         FROM backup_snapshots WHERE ts_ms = ?1",
        [ts_ms],
        |row| {
            Ok(SnapshotRecord {
                ts_ms: row.get(0)?,
                blob: row.get(1)?,
                checksum: row.get(2)?,
                version: row.get(3)?,
                metadata_json: row.get(4)?,
                reason: row.get(5)?,
                edit_count: row.get(6)?,
                auto_snapshot: row.get(7)?,
            })
        },
    )
    .optional()
    .map_err(|e| db_error("failed reading snapshot", e))
}

pub fn latest_snapshot_ms(conn: &Connection) -> AppResult<Option<i64>> {
    conn.query_row("SELECT MAX(ts_ms) FROM backup_snapshots", [], |row| {
        row.get::<_, Option<i64>>(0)
    })
    .map_err(|e| db_error("failed reading latest snapshot time", e))
}

/// Newest-first listing bounded by `limit`.
pub fn history(conn: &Connection, limit: u32) -> AppResult<Vec<SnapshotInfo>> {
    let mut stmt = conn
        .prepare(
            "SELECT ts_ms, version, reason, LENGTH(blob)
             FROM backup_snapshots ORDER BY ts_ms DESC LIMIT ?1",
        )
        .map_err(|e| db_error("failed preparing history query", e))?;
    let rows = stmt
        .query_map([i64::from(limit)], |row| {
            Ok(SnapshotInfo {
                timestamp_ms: row.get(0)?,
                version: row.get(1)?,
                reason: row.get(2)?,
                size: row.get(3)?,
            })
        })
        .map_err(|e| db_error("failed querying snapshot history", e))?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(|e| db_error("failed decoding snapshot row", e))?);
    }
    Ok(out)
}

/// Retention takes the more generous bound: a snapshot survives while it is
/// inside the newest `max_keep` or newer than the age cutoff. Only rows
/// failing both are pruned.
pub fn prune_snapshots(
    conn: &Connection,
    max_keep: u32,
    max_age_ms: i64,
    now_ms: i64,
) -> AppResult<u32> {
    conn.execute(
        "DELETE FROM backup_snapshots
         WHERE ts_ms NOT IN (SELECT ts_ms FROM backup_snapshots ORDER BY ts_ms DESC LIMIT ?1)
           AND ts_ms < ?2",
        params![i64::from(max_keep), now_ms - max_age_ms],
    )
    .map(|n| n as u32)
    .map_err(|e| db_error("failed pruning snapshots", e))
}

/// Snapshot policy state: the edit counter and the wall-clock anchor for the
/// hourly timer. Rehydrated from `max(backup_snapshots.ts_ms)` at startup so
/// host restarts never reset the schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupScheduler {
    edit_counter: u32,
    last_snapshot_ms: Option<i64>,
    interval_ms: i64,
    edit_threshold: u32,
}

impl BackupScheduler {
    pub fn rehydrate(conn: &Connection, config: &KeeperConfig) -> AppResult<Self> {
        Ok(Self {
            edit_counter: 0,
            last_snapshot_ms: latest_snapshot_ms(conn)?,
            interval_ms: config.snapshot_interval_ms(),
            edit_threshold: config.edit_threshold,
        })
    }

    pub fn edit_counter(&self) -> u32 {
        self.edit_counter
    }

    pub fn last_snapshot_ms(&self) -> Option<i64> {
        self.last_snapshot_ms
    }

    /// Count a successful edit persist; true when the threshold snapshot is
    /// due. The counter resets when it trips.
    pub fn note_edit(&mut self) -> bool {
        self.edit_counter += 1;
        if self.edit_counter >= self.edit_threshold {
            self.edit_counter = 0;
            return true;
        }
        false
    }

    pub fn hourly_due(&self, now_ms: i64) -> bool {
        match self.last_snapshot_ms {
            Some(last) => now_ms - last >= self.interval_ms,
            None => true,
        }
    }

    /// When the hourly alarm should next fire, measured from the last
    /// snapshot of any kind.
    pub fn next_hourly_deadline(&self, now_ms: i64) -> i64 {
        self.last_snapshot_ms.unwrap_or(now_ms) + self.interval_ms
    }

    pub fn record_snapshot(&mut self, now_ms: i64) {
        self.last_snapshot_ms = Some(now_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secondary::open_secondary_in_memory;

    fn snapshot(ts_ms: i64, reason: &str) -> SnapshotRecord {
        SnapshotRecord {
            ts_ms,
            blob: vec![1, 2, 3],
            checksum: "h".to_string(),
            version: 1,
            metadata_json: "{}".to_string(),
            reason: reason.to_string(),
            edit_count: 0,
            auto_snapshot: reason != REASON_MANUAL,
        }
    }

    #[test]
    fn history_is_newest_first_and_bounded() {
        let conn = open_secondary_in_memory().expect("open");
        for ts in [10, 30, 20] {
            insert_snapshot(&conn, &snapshot(ts, REASON_MANUAL)).expect("insert");
        }
        let listed = history(&conn, 2).expect("history");
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].timestamp_ms, 30);
        assert_eq!(listed[1].timestamp_ms, 20);
        assert_eq!(listed[0].size, 3);
    }

    #[test]
    fn retention_keeps_if_either_rule_keeps() {
        let conn = open_secondary_in_memory().expect("open");
        let day = 86_400_000i64;
        let now = 100 * day;

        // 12 old snapshots beyond the age cutoff plus 3 recent ones
        for i in 0..12 {
            insert_snapshot(&conn, &snapshot(i * day, REASON_HOURLY)).expect("insert");
        }
        for i in 0..3 {
            insert_snapshot(&conn, &snapshot(now - i * day, REASON_HOURLY)).expect("insert");
        }

        prune_snapshots(&conn, 10, 30 * day, now).expect("prune");
        let listed = history(&conn, 50).expect("history");
        // newest 10 survive on the count rule even though 7 of them are
        // older than 30 days; the 5 oldest fail both rules
        assert_eq!(listed.len(), 10);
        assert_eq!(listed.last().expect("row").timestamp_ms, 5 * day);
    }

    #[test]
    fn edit_counter_trips_at_threshold_and_resets() {
        let conn = open_secondary_in_memory().expect("open");
        let mut scheduler =
            BackupScheduler::rehydrate(&conn, &KeeperConfig::default()).expect("rehydrate");
        for _ in 0..9 {
            assert!(!scheduler.note_edit());
        }
        assert!(scheduler.note_edit());
        assert_eq!(scheduler.edit_counter(), 0);
    }

    #[test]
    fn hourly_schedule_rehydrates_from_stored_snapshots() {
        let conn = open_secondary_in_memory().expect("open");
        insert_snapshot(&conn, &snapshot(1_000_000, REASON_HOURLY)).expect("insert");

        let scheduler =
            BackupScheduler::rehydrate(&conn, &KeeperConfig::default()).expect("rehydrate");
        assert_eq!(scheduler.last_snapshot_ms(), Some(1_000_000));
        assert!(!scheduler.hourly_due(1_000_000 + 3_599_999));
        assert!(scheduler.hourly_due(1_000_000 + 3_600_000));
        assert_eq!(
            scheduler.next_hourly_deadline(1_500_000),
            1_000_000 + 3_600_000
        );
    }
}
