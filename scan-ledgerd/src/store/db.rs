use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use anyhow::{Context, Result};
use rusqlite::{Connection, TransactionBehavior, params};
use shared::types::{ScanKey, ScanRecord};
use super::hash::record_key;
use super::{CallGuard, StoreError, UpsertOutcome};

/// Every stored record by key, as read at one point in time.
pub type Snapshot = HashMap<ScanKey, ScanRecord>;

pub struct RecordStore {
    conn: Connection,
}

impl RecordStore {
    /// Open or create the SQLite database with WAL mode enabled
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        // WAL lets the monitor read while a writer holds the lock
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .context("Failed to enable WAL mode")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS scan_results (
                hash      INTEGER PRIMARY KEY,
                service   TEXT NOT NULL,
                ip        TEXT NOT NULL,
                port      INTEGER NOT NULL,
                timestamp INTEGER NOT NULL,
                ver       INTEGER NOT NULL,
                data      TEXT NOT NULL
            );
            "#,
        )
        .context("Failed to create database schema")?;

        Ok(Self { conn })
    }

    /// Last-write-wins upsert. The existence check and the write run in one
    /// IMMEDIATE transaction, and the update itself carries the timestamp guard,
    /// so concurrent writers on other connections can never make an older
    /// record win.
    pub fn upsert(&mut self, record: &ScanRecord, guard: &CallGuard) -> Result<UpsertOutcome, StoreError> {
        let key = to_sql_key(record_key(record));

        self.conn.busy_timeout(busy_budget(guard)?)?;
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM scan_results WHERE hash = ?1)",
            params![key],
            |row| row.get(0),
        )?;

        let outcome = if exists {
            let changed = tx.execute(
                "UPDATE scan_results SET timestamp = ?1, ver = ?2, data = ?3
                 WHERE hash = ?4 AND timestamp < ?1",
                params![record.timestamp, record.version, &record.data, key],
            )?;
            if changed == 0 {
                UpsertOutcome::Stale
            } else {
                UpsertOutcome::Updated
            }
        } else {
            tx.execute(
                "INSERT INTO scan_results (hash, service, ip, port, timestamp, ver, data)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    key,
                    &record.service,
                    &record.ip,
                    record.port,
                    record.timestamp,
                    record.version,
                    &record.data,
                ],
            )?;
            UpsertOutcome::Inserted
        };

        // Returning early drops `tx`, which rolls it back
        guard.check()?;
        tx.commit()?;

        Ok(outcome)
    }

    /// Read every stored record. Not a transactionally consistent view across
    /// rows; the monitor does not need one.
    pub fn snapshot_all(&mut self, guard: &CallGuard) -> Result<Snapshot, StoreError> {
        self.conn.busy_timeout(busy_budget(guard)?)?;

        let mut stmt = self.conn.prepare_cached(
            "SELECT hash, service, ip, port, timestamp, ver, data FROM scan_results",
        )?;
        let rows = stmt.query_map([], Self::row_to_record)?;

        let mut snapshot = Snapshot::new();
        for row in rows {
            guard.check()?;
            let (key, record) = row?;
            snapshot.insert(key, record);
        }

        Ok(snapshot)
    }

    /// Helper to convert a database row to a keyed ScanRecord
    fn row_to_record(row: &rusqlite::Row) -> Result<(ScanKey, ScanRecord), rusqlite::Error> {
        let key = from_sql_key(row.get(0)?);
        let record = ScanRecord {
            service: row.get(1)?,
            ip: row.get(2)?,
            port: row.get::<_, u32>(3)?,
            timestamp: row.get(4)?,
            version: row.get::<_, u8>(5)?,
            data: row.get(6)?,
        };
        Ok((key, record))
    }
}

/// SQLite takes the busy timeout as a C int of milliseconds.
const MAX_BUSY_TIMEOUT: Duration = Duration::from_millis(i32::MAX as u64);

fn busy_budget(guard: &CallGuard) -> Result<Duration, StoreError> {
    Ok(guard.remaining()?.min(MAX_BUSY_TIMEOUT))
}

// SQLite integers are signed; keys are stored bit for bit.
fn to_sql_key(key: ScanKey) -> i64 {
    key.0 as i64
}

fn from_sql_key(value: i64) -> ScanKey {
    ScanKey(value as u64)
}
