//! Append-only offline table of window aggregates, SQLite-backed and partitioned by the UTC
//! date of `window_end`.

use std::path::Path;
use std::time::{Duration, Instant};

use chrono::{NaiveDate, Utc};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};

use crate::error::{FeatureStoreError, Result};
use crate::events::{EntityKey, TimestampMs};
use crate::features::{event_date, WindowAggregate};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS window_aggregates (
    ingest_seq INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_name TEXT NOT NULL,
    entity_value TEXT NOT NULL,
    feature_name TEXT NOT NULL,
    window_start INTEGER NOT NULL,
    window_end INTEGER NOT NULL,
    effective_time INTEGER NOT NULL,
    event_date TEXT NOT NULL,
    value REAL NOT NULL,
    source_partition INTEGER NOT NULL,
    materialized_at INTEGER NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_agg_window
    ON window_aggregates(entity_name, entity_value, feature_name, window_start);
CREATE INDEX IF NOT EXISTS idx_agg_asof
    ON window_aggregates(entity_name, entity_value, feature_name, effective_time);
CREATE INDEX IF NOT EXISTS idx_agg_date ON window_aggregates(event_date);
"#;

const SELECT_COLUMNS: &str =
    "entity_name, entity_value, feature_name, window_start, window_end, value, source_partition";

/// SQLite busy wait for writes and maintenance; reads use their own deadline instead.
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(1);

/// Half-open `[start, end)` range over `effective_time`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: TimestampMs,
    pub end: TimestampMs,
}

impl TimeRange {
    pub fn new(start: TimestampMs, end: TimestampMs) -> Self {
        Self { start, end }
    }

    pub fn all() -> Self {
        Self {
            start: TimestampMs::MIN,
            end: TimestampMs::MAX,
        }
    }

    pub fn contains(&self, t: TimestampMs) -> bool {
        t >= self.start && t < self.end
    }
}

/// Rows inserted vs. already present from an earlier materialization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppendResult {
    pub inserted: usize,
    pub duplicates: usize,
}

pub struct OfflineTable {
    pub(crate) conn: Mutex<Connection>,
}

fn date_bound(ts: TimestampMs) -> String {
    let date = event_date(ts);
    let lo = NaiveDate::from_ymd_opt(1, 1, 1).unwrap_or(NaiveDate::MIN);
    let hi = NaiveDate::from_ymd_opt(9999, 12, 31).unwrap_or(NaiveDate::MAX);
    date.clamp(lo, hi).format("%Y-%m-%d").to_string()
}

fn timeout(operation: &'static str, deadline: Duration) -> FeatureStoreError {
    FeatureStoreError::RetrievalTimeout {
        operation,
        deadline_ms: deadline.as_millis() as u64,
    }
}

/// SQLite gave up waiting on another connection's lock within the busy timeout.
fn busy_as_timeout(
    e: rusqlite::Error,
    operation: &'static str,
    deadline: Duration,
) -> FeatureStoreError {
    match e {
        rusqlite::Error::SqliteFailure(ref err, _)
            if matches!(err.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
        {
            timeout(operation, deadline)
        }
        other => FeatureStoreError::Storage(other),
    }
}

fn row_to_aggregate(row: &Row<'_>) -> rusqlite::Result<WindowAggregate> {
    let window_end: i64 = row.get(4)?;
    Ok(WindowAggregate {
        entity_key: EntityKey::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?),
        feature_name: row.get(2)?,
        window_start: row.get(3)?,
        window_end,
        value: row.get(5)?,
        effective_time: window_end,
        partition: row.get::<_, i64>(6)? as usize,
    })
}

impl OfflineTable {
    /// Open or create the table at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Connection guard whose SQLite busy wait is cut to what is left of `deadline` after
    /// acquiring the in-process lock.
    fn lock_within(
        &self,
        operation: &'static str,
        deadline: Duration,
    ) -> Result<MutexGuard<'_, Connection>> {
        let started = Instant::now();
        let conn = self
            .conn
            .try_lock_for(deadline)
            .ok_or_else(|| timeout(operation, deadline))?;
        let remaining = deadline
            .checked_sub(started.elapsed())
            .filter(|d| !d.is_zero())
            .ok_or_else(|| timeout(operation, deadline))?;
        conn.busy_timeout(remaining)?;
        Ok(conn)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        let conn = self.conn.lock();
        conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
        Ok(conn)
    }

    /// Append aggregates in one transaction. Re-appending a window already present is a no-op.
    pub fn append_batch(&self, aggregates: &[WindowAggregate]) -> Result<AppendResult> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut result = AppendResult::default();
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO window_aggregates
                 (entity_name, entity_value, feature_name, window_start, window_end,
                  effective_time, event_date, value, source_partition, materialized_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            let now = Utc::now().timestamp_millis();
            for agg in aggregates {
                let n = stmt.execute(params![
                    agg.entity_key.name,
                    agg.entity_key.value,
                    agg.feature_name,
                    agg.window_start,
                    agg.window_end,
                    agg.effective_time,
                    agg.event_date().format("%Y-%m-%d").to_string(),
                    agg.value,
                    agg.partition as i64,
                    now,
                ])?;
                if n == 0 {
                    result.duplicates += 1;
                } else {
                    result.inserted += n;
                }
            }
        }
        tx.commit()?;
        Ok(result)
    }

    /// Aggregate with the greatest `effective_time <= reference_time`; ties go to the latest
    /// ingested row.
    pub fn latest_as_of(
        &self,
        entity: &EntityKey,
        feature: &str,
        reference_time: TimestampMs,
        deadline: Duration,
    ) -> Result<Option<WindowAggregate>> {
        let conn = self.lock_within("as_of", deadline)?;
        let query = || -> rusqlite::Result<Option<WindowAggregate>> {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {SELECT_COLUMNS} FROM window_aggregates
                 WHERE entity_name = ?1 AND entity_value = ?2 AND feature_name = ?3
                   AND effective_time <= ?4
                 ORDER BY effective_time DESC, ingest_seq DESC
                 LIMIT 1"
            ))?;
            stmt.query_row(
                params![entity.name, entity.value, feature, reference_time],
                row_to_aggregate,
            )
            .optional()
        };
        query().map_err(|e| busy_as_timeout(e, "as_of", deadline))
    }

    /// All aggregates for `entity` with `effective_time` in `range`, ordered by effective time
    /// then ingestion.
    pub fn scan(
        &self,
        entity: &EntityKey,
        range: TimeRange,
        deadline: Duration,
    ) -> Result<Vec<WindowAggregate>> {
        let conn = self.lock_within("scan", deadline)?;
        let query = || -> rusqlite::Result<Vec<WindowAggregate>> {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {SELECT_COLUMNS} FROM window_aggregates
                 WHERE entity_name = ?1 AND entity_value = ?2
                   AND event_date >= ?3 AND event_date <= ?4
                   AND effective_time >= ?5 AND effective_time < ?6
                 ORDER BY effective_time ASC, ingest_seq ASC"
            ))?;
            let rows = stmt.query_map(
                params![
                    entity.name,
                    entity.value,
                    date_bound(range.start),
                    date_bound(range.end),
                    range.start,
                    range.end
                ],
                row_to_aggregate,
            )?;
            rows.collect()
        };
        query().map_err(|e| busy_as_timeout(e, "scan", deadline))
    }

    /// `(event_date, row count)` per partition, oldest first.
    pub fn partitions(&self) -> Result<Vec<(String, u64)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT event_date, COUNT(*) FROM window_aggregates
             GROUP BY event_date ORDER BY event_date",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
        })?;
        let partitions = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(partitions)
    }

    /// Retention: drop whole date partitions older than `date`.
    pub fn prune_partitions_before(&self, date: NaiveDate) -> Result<u64> {
        let n = self.lock()?.execute(
            "DELETE FROM window_aggregates WHERE event_date < ?1",
            params![date.format("%Y-%m-%d").to_string()],
        )?;
        Ok(n as u64)
    }

    pub fn len(&self) -> Result<u64> {
        let n: i64 = self
            .lock()?
            .query_row("SELECT COUNT(*) FROM window_aggregates", [], |r| r.get(0))?;
        Ok(n as u64)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const DAY: i64 = 24 * 60 * 60 * 1000;
    const WAIT: Duration = Duration::from_millis(500);

    fn agg(entity: &str, feature: &str, start: i64, end: i64, value: f64) -> WindowAggregate {
        WindowAggregate::new(
            EntityKey::new("user_id", entity),
            feature.to_string(),
            start,
            end,
            value,
            0,
        )
    }

    #[test]
    fn as_of_picks_latest_effective_time_at_or_before() {
        let t = OfflineTable::open_in_memory().unwrap();
        t.append_batch(&[
            agg("u1", "clicks", 0, 60_000, 2.0),
            agg("u1", "clicks", 60_000, 120_000, 1.0),
            agg("u2", "clicks", 0, 60_000, 9.0),
        ])
        .unwrap();
        let key = EntityKey::new("user_id", "u1");
        assert!(t.latest_as_of(&key, "clicks", 59_999, WAIT).unwrap().is_none());
        let hit = t.latest_as_of(&key, "clicks", 60_000, WAIT).unwrap().unwrap();
        assert_eq!(hit.value, 2.0);
        let hit = t.latest_as_of(&key, "clicks", 119_999, WAIT).unwrap().unwrap();
        assert_eq!(hit.window_end, 60_000);
        let hit = t.latest_as_of(&key, "clicks", 500_000, WAIT).unwrap().unwrap();
        assert_eq!(hit.value, 1.0);
    }

    #[test]
    fn reappending_a_window_is_idempotent() {
        let t = OfflineTable::open_in_memory().unwrap();
        let a = agg("u1", "clicks", 0, 60_000, 2.0);
        assert_eq!(t.append_batch(&[a.clone()]).unwrap().inserted, 1);
        let again = t.append_batch(&[a]).unwrap();
        assert_eq!(again.inserted, 0);
        assert_eq!(again.duplicates, 1);
        assert_eq!(t.len().unwrap(), 1);
    }

    #[test]
    fn scan_and_date_partitions() {
        let dir = tempfile::tempdir().unwrap();
        let t = OfflineTable::open(&dir.path().join("offline.db")).unwrap();
        t.append_batch(&[
            agg("u1", "clicks", 0, DAY / 2, 1.0),
            agg("u1", "clicks", DAY, DAY + DAY / 2, 2.0),
            agg("u1", "clicks", 2 * DAY, 2 * DAY + DAY / 2, 3.0),
        ])
        .unwrap();
        let key = EntityKey::new("user_id", "u1");
        let rows = t.scan(&key, TimeRange::new(DAY, 3 * DAY), WAIT).unwrap();
        assert_eq!(rows.iter().map(|a| a.value).collect::<Vec<_>>(), vec![2.0, 3.0]);
        assert_eq!(t.scan(&key, TimeRange::all(), WAIT).unwrap().len(), 3);

        let parts = t.partitions().unwrap();
        assert_eq!(parts[0], ("1970-01-01".to_string(), 1));
        assert_eq!(parts.len(), 3);

        let cutoff = NaiveDate::from_ymd_opt(1970, 1, 3).unwrap();
        assert_eq!(t.prune_partitions_before(cutoff).unwrap(), 2);
        assert_eq!(t.len().unwrap(), 1);
    }

    #[test]
    fn blocked_table_times_out_instead_of_waiting() {
        let t = Arc::new(OfflineTable::open_in_memory().unwrap());
        let holder = Arc::clone(&t);
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let handle = std::thread::spawn(move || {
            let _guard = holder.conn.lock();
            locked_tx.send(()).unwrap();
            std::thread::sleep(Duration::from_millis(300));
        });
        locked_rx.recv().unwrap();
        let err = t
            .latest_as_of(
                &EntityKey::new("user_id", "u1"),
                "clicks",
                0,
                Duration::from_millis(20),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            FeatureStoreError::RetrievalTimeout {
                operation: "as_of",
                ..
            }
        ));
        handle.join().unwrap();
    }

    #[test]
    fn locked_database_file_times_out_within_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offline.db");
        let t = OfflineTable::open(&path).unwrap();
        t.append_batch(&[agg("u1", "clicks", 0, 60_000, 2.0)]).unwrap();

        let other = Connection::open(&path).unwrap();
        other.execute_batch("BEGIN EXCLUSIVE").unwrap();

        let started = Instant::now();
        let err = t
            .latest_as_of(
                &EntityKey::new("user_id", "u1"),
                "clicks",
                60_000,
                Duration::from_millis(50),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            FeatureStoreError::RetrievalTimeout {
                operation: "as_of",
                ..
            }
        ));
        assert!(started.elapsed() < DEFAULT_BUSY_TIMEOUT);

        other.execute_batch("COMMIT").unwrap();
        let hit = t
            .latest_as_of(&EntityKey::new("user_id", "u1"), "clicks", 60_000, WAIT)
            .unwrap();
        assert_eq!(hit.map(|a| a.value), Some(2.0));
    }
}
