use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// One row of the `tnom` table, keyed by slash epoch.
///
/// `*_executed` latches are stored as 0/1 integers; they suppress repeated
/// emission of the same alert within the latch's scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpochRecord {
    pub slash_epoch: u64,
    pub miss_counter_events: u64,
    pub miss_counter_p1_executed: bool,
    pub miss_counter_p2_executed: bool,
    pub miss_counter_p3_executed: bool,
    pub unsigned_oracle_events: u64,
    pub price_feed_addr_balance: u64,
    pub small_balance_alert_executed: bool,
    pub very_small_balance_alert_executed: bool,
    pub consecutive_misses: u64,
    pub api_cons_miss: u64,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no row recorded for epoch {0}")]
    NotFound(u64),
    #[error("no epochs recorded yet")]
    Empty,
    #[error("column '{0}' is not an updatable tnom column")]
    InvalidField(String),
    #[error("failed to create database directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

/// Non-key columns, in table order. Doubles as the `set_field` allowlist:
/// SQLite cannot bind identifiers, so the column name is interpolated into
/// the statement and must never come from outside this list.
const UPDATABLE_COLUMNS: &[&str] = &[
    "miss_counter_events",
    "miss_counter_p1_executed",
    "miss_counter_p2_executed",
    "miss_counter_p3_executed",
    "unsigned_oracle_events",
    "price_feed_addr_balance",
    "small_balance_alert_executed",
    "very_small_balance_alert_executed",
    "consecutive_misses",
    "api_cons_miss",
];

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS tnom (
    slash_epoch INTEGER PRIMARY KEY,
    miss_counter_events INTEGER,
    miss_counter_p1_executed INTEGER DEFAULT 0,
    miss_counter_p2_executed INTEGER DEFAULT 0,
    miss_counter_p3_executed INTEGER DEFAULT 0,
    unsigned_oracle_events INTEGER,
    price_feed_addr_balance INTEGER,
    small_balance_alert_executed INTEGER DEFAULT 0,
    very_small_balance_alert_executed INTEGER DEFAULT 0,
    consecutive_misses INTEGER DEFAULT 0,
    api_cons_miss INTEGER DEFAULT 0
)";

/// Epoch-keyed persistent store backed by a single SQLite file.
///
/// Every operation opens its own connection; the monitor task writes and the
/// metrics task reads, and SQLite's file locking plus single-row statements
/// keep readers from ever observing a torn row.
#[derive(Debug, Clone)]
pub struct EpochStore {
    db_path: PathBuf,
}

impl EpochStore {
    /// Creates the `chain_database` directory and the `tnom` table if either
    /// is missing. Idempotent.
    pub fn ensure(working_dir: &Path) -> Result<Self, StoreError> {
        let dir = working_dir.join("chain_database");
        std::fs::create_dir_all(&dir).map_err(|source| StoreError::CreateDir {
            path: dir.clone(),
            source,
        })?;
        let store = Self {
            db_path: dir.join("tnom.db"),
        };
        store.open()?.execute_batch(CREATE_TABLE)?;
        Ok(store)
    }

    /// Brings an older database file up to the current column set.
    ///
    /// Columns are only ever added (with `INTEGER DEFAULT 0`), never dropped
    /// or renamed, so rows written by any earlier build stay readable.
    pub fn migrate(&self) -> Result<(), StoreError> {
        let conn = self.open()?;
        let existing: HashSet<String> = conn
            .prepare("PRAGMA table_info(tnom)")?
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<Result<_, _>>()?;
        for column in UPDATABLE_COLUMNS {
            if !existing.contains(*column) {
                conn.execute(
                    &format!("ALTER TABLE tnom ADD COLUMN {column} INTEGER DEFAULT 0"),
                    [],
                )?;
                tracing::info!(column, "added missing database column");
            }
        }
        Ok(())
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Highest recorded epoch, or `StoreError::Empty` on a fresh database.
    pub fn last_epoch(&self) -> Result<u64, StoreError> {
        let conn = self.open()?;
        let max: Option<i64> =
            conn.query_row("SELECT MAX(slash_epoch) FROM tnom", [], |row| row.get(0))?;
        max.map(|epoch| epoch as u64).ok_or(StoreError::Empty)
    }

    pub fn exists(&self, epoch: u64) -> Result<bool, StoreError> {
        let conn = self.open()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM tnom WHERE slash_epoch = ?1",
                params![epoch as i64],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn get(&self, epoch: u64) -> Result<EpochRecord, StoreError> {
        let conn = self.open()?;
        conn.query_row(
            "SELECT slash_epoch, miss_counter_events, miss_counter_p1_executed,
                    miss_counter_p2_executed, miss_counter_p3_executed,
                    unsigned_oracle_events, price_feed_addr_balance,
                    small_balance_alert_executed, very_small_balance_alert_executed,
                    consecutive_misses, api_cons_miss
             FROM tnom WHERE slash_epoch = ?1",
            params![epoch as i64],
            record_from_row,
        )
        .optional()?
        .ok_or(StoreError::NotFound(epoch))
    }

    /// Inserts the record, or updates every non-key column if the epoch
    /// already has a row.
    pub fn upsert(&self, record: &EpochRecord) -> Result<(), StoreError> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO tnom (slash_epoch, miss_counter_events, miss_counter_p1_executed,
                               miss_counter_p2_executed, miss_counter_p3_executed,
                               unsigned_oracle_events, price_feed_addr_balance,
                               small_balance_alert_executed, very_small_balance_alert_executed,
                               consecutive_misses, api_cons_miss)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(slash_epoch) DO UPDATE SET
                 miss_counter_events = excluded.miss_counter_events,
                 miss_counter_p1_executed = excluded.miss_counter_p1_executed,
                 miss_counter_p2_executed = excluded.miss_counter_p2_executed,
                 miss_counter_p3_executed = excluded.miss_counter_p3_executed,
                 unsigned_oracle_events = excluded.unsigned_oracle_events,
                 price_feed_addr_balance = excluded.price_feed_addr_balance,
                 small_balance_alert_executed = excluded.small_balance_alert_executed,
                 very_small_balance_alert_executed = excluded.very_small_balance_alert_executed,
                 consecutive_misses = excluded.consecutive_misses,
                 api_cons_miss = excluded.api_cons_miss",
            params![
                record.slash_epoch as i64,
                record.miss_counter_events as i64,
                record.miss_counter_p1_executed as i64,
                record.miss_counter_p2_executed as i64,
                record.miss_counter_p3_executed as i64,
                record.unsigned_oracle_events as i64,
                record.price_feed_addr_balance as i64,
                record.small_balance_alert_executed as i64,
                record.very_small_balance_alert_executed as i64,
                record.consecutive_misses as i64,
                record.api_cons_miss as i64,
            ],
        )?;
        Ok(())
    }

    /// Overwrites a single column of an existing row.
    ///
    /// `field` must be one of `UPDATABLE_COLUMNS`; anything else is a bug in
    /// the caller and is rejected before touching the statement.
    pub fn set_field(&self, epoch: u64, field: &str, value: i64) -> Result<(), StoreError> {
        if !UPDATABLE_COLUMNS.contains(&field) {
            return Err(StoreError::InvalidField(field.to_owned()));
        }
        let conn = self.open()?;
        let changed = conn.execute(
            &format!("UPDATE tnom SET {field} = ?1 WHERE slash_epoch = ?2"),
            params![value, epoch as i64],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(epoch));
        }
        Ok(())
    }

    fn open(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<EpochRecord> {
    Ok(EpochRecord {
        slash_epoch: row.get::<_, i64>(0)? as u64,
        miss_counter_events: row.get::<_, i64>(1)? as u64,
        miss_counter_p1_executed: row.get::<_, i64>(2)? != 0,
        miss_counter_p2_executed: row.get::<_, i64>(3)? != 0,
        miss_counter_p3_executed: row.get::<_, i64>(4)? != 0,
        unsigned_oracle_events: row.get::<_, i64>(5)? as u64,
        price_feed_addr_balance: row.get::<_, i64>(6)? as u64,
        small_balance_alert_executed: row.get::<_, i64>(7)? != 0,
        very_small_balance_alert_executed: row.get::<_, i64>(8)? != 0,
        consecutive_misses: row.get::<_, i64>(9)? as u64,
        api_cons_miss: row.get::<_, i64>(10)? as u64,
    })
}
