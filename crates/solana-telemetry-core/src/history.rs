// Numan Thabit 2025
//! Retention-windowed store of per-block aggregates backed by SQLite.
//!
//! Rows are keyed by slot and overwritten on re-fetch. Every write sweeps rows
//! older than the newest timestamp minus the retention window, inside the same
//! transaction. The schema is versioned with `PRAGMA user_version` and only
//! ever grows through additive migrations.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::normalize::SlotBlock;

/// Default retention window.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(48 * 60 * 60);

const MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS block_aggregates (
        slot INTEGER PRIMARY KEY,
        timestamp INTEGER NOT NULL,
        tx_count INTEGER NOT NULL,
        success_count INTEGER NOT NULL,
        failed_count INTEGER NOT NULL,
        total_fees INTEGER NOT NULL,
        priority_fees INTEGER NOT NULL,
        total_compute_units INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_block_aggregates_timestamp
        ON block_aggregates(timestamp);",
    "ALTER TABLE block_aggregates ADD COLUMN jito_tips INTEGER NOT NULL DEFAULT 0;",
    "ALTER TABLE block_aggregates ADD COLUMN category_counts TEXT NOT NULL DEFAULT '{}';",
];

const SELECT_COLUMNS: &str = "slot, timestamp, tx_count, success_count, failed_count, \
     total_fees, priority_fees, jito_tips, total_compute_units, category_counts";

/// Errors raised by [`HistoricalStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite rejected a statement.
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Could not prepare the database directory.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    /// Rollups need a positive bucket width.
    #[error("invalid rollup bucket width {0} ms")]
    InvalidBucket(u64),
    /// The file was written by a newer schema.
    #[error("database schema version {found} is newer than supported {supported}")]
    UnsupportedSchema {
        /// Version stored in the file.
        found: u32,
        /// Highest version this build knows.
        supported: u32,
    },
    /// Category counts could not be encoded or decoded.
    #[error("category counts: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Aggregate of one block as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoricalAggregate {
    /// Slot number; the primary key.
    pub slot: u64,
    /// Unix milliseconds.
    pub timestamp: i64,
    /// Transactions in the block.
    pub tx_count: u64,
    /// Successful transactions.
    pub success_count: u64,
    /// Failed transactions.
    pub failed_count: u64,
    /// Sum of fees, lamports.
    pub total_fees: u64,
    /// Fees above the base fee, clamped at zero.
    pub priority_fees: u64,
    /// Sum of tips, lamports.
    pub jito_tips: u64,
    /// Sum of compute units.
    pub total_compute_units: u64,
    /// Transactions per category label.
    pub category_counts: BTreeMap<String, u64>,
}

impl HistoricalAggregate {
    /// Summarize `block`, using `fallback_timestamp_ms` when it has no block time.
    pub fn from_block(block: &SlotBlock, fallback_timestamp_ms: i64) -> Self {
        let timestamp = block
            .block_time
            .map(|secs| secs.saturating_mul(1_000))
            .unwrap_or(fallback_timestamp_ms);
        Self {
            slot: block.slot,
            timestamp,
            tx_count: block.transactions.len() as u64,
            success_count: block.success_count(),
            failed_count: block.failed_count(),
            total_fees: block.total_fees,
            priority_fees: block.priority_fees(),
            jito_tips: block.total_jito_tips(),
            total_compute_units: block.total_compute_units,
            category_counts: block
                .category_counts()
                .into_iter()
                .map(|(category, count)| (category.as_str().to_owned(), count))
                .collect(),
        }
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<(Self, String)> {
        let aggregate = Self {
            slot: row.get::<_, i64>(0)? as u64,
            timestamp: row.get(1)?,
            tx_count: row.get::<_, i64>(2)? as u64,
            success_count: row.get::<_, i64>(3)? as u64,
            failed_count: row.get::<_, i64>(4)? as u64,
            total_fees: row.get::<_, i64>(5)? as u64,
            priority_fees: row.get::<_, i64>(6)? as u64,
            jito_tips: row.get::<_, i64>(7)? as u64,
            total_compute_units: row.get::<_, i64>(8)? as u64,
            category_counts: BTreeMap::new(),
        };
        Ok((aggregate, row.get(9)?))
    }
}

/// Aggregates summed over one aligned time bucket.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RollupBucket {
    /// Bucket start, unix milliseconds, aligned to the unix epoch.
    pub timestamp: i64,
    /// Blocks in the bucket.
    pub blocks: u64,
    /// Transactions.
    pub tx_count: u64,
    /// Successful transactions.
    pub success_count: u64,
    /// Failed transactions.
    pub failed_count: u64,
    /// Fees.
    pub total_fees: u64,
    /// Priority fees.
    pub priority_fees: u64,
    /// Tips.
    pub jito_tips: u64,
    /// Compute units.
    pub total_compute_units: u64,
    /// Transactions per category label.
    pub category_counts: BTreeMap<String, u64>,
    /// Mean fee per transaction.
    pub avg_fee: f64,
    /// Mean compute units per transaction.
    pub avg_compute_units: f64,
    /// Successful share of transactions; 100 when empty.
    pub success_rate: f64,
}

impl RollupBucket {
    fn empty(timestamp: i64) -> Self {
        Self {
            timestamp,
            blocks: 0,
            tx_count: 0,
            success_count: 0,
            failed_count: 0,
            total_fees: 0,
            priority_fees: 0,
            jito_tips: 0,
            total_compute_units: 0,
            category_counts: BTreeMap::new(),
            avg_fee: 0.0,
            avg_compute_units: 0.0,
            success_rate: 100.0,
        }
    }

    fn add(&mut self, row: &HistoricalAggregate) {
        self.blocks += 1;
        self.tx_count += row.tx_count;
        self.success_count += row.success_count;
        self.failed_count += row.failed_count;
        self.total_fees += row.total_fees;
        self.priority_fees += row.priority_fees;
        self.jito_tips += row.jito_tips;
        self.total_compute_units += row.total_compute_units;
        for (category, count) in &row.category_counts {
            *self.category_counts.entry(category.clone()).or_insert(0) += count;
        }
    }

    fn finish(mut self) -> Self {
        if self.tx_count > 0 {
            let txs = self.tx_count as f64;
            self.avg_fee = self.total_fees as f64 / txs;
            self.avg_compute_units = self.total_compute_units as f64 / txs;
            self.success_rate = self.success_count as f64 / txs * 100.0;
        }
        self
    }
}

/// Result of one write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutOutcome {
    /// Rows removed by the retention sweep.
    pub evicted: u64,
}

/// SQLite-backed store with one connection behind a mutex.
pub struct HistoricalStore {
    conn: Mutex<Connection>,
    retention_ms: i64,
}

impl HistoricalStore {
    /// Open or create the database at `path` and bring its schema up to date.
    pub fn open(path: impl AsRef<Path>, retention: Duration) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        debug!(path = %path.display(), journal_mode = %mode, "opened history database");
        Self::with_connection(conn, retention)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory(retention: Duration) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?, retention)
    }

    fn with_connection(mut conn: Connection, retention: Duration) -> Result<Self, StoreError> {
        migrate(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            retention_ms: i64::try_from(retention.as_millis()).unwrap_or(i64::MAX),
        })
    }

    /// Schema version recorded in the database.
    pub fn schema_version(&self) -> Result<u32, StoreError> {
        Ok(user_version(&self.conn.lock())?)
    }

    /// Upsert `aggregate` and sweep rows outside the retention window.
    pub fn put(&self, aggregate: &HistoricalAggregate) -> Result<PutOutcome, StoreError> {
        let categories = serde_json::to_string(&aggregate.category_counts)?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO block_aggregates
                (slot, timestamp, tx_count, success_count, failed_count, total_fees,
                 priority_fees, jito_tips, total_compute_units, category_counts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(slot) DO UPDATE SET
                timestamp = excluded.timestamp,
                tx_count = excluded.tx_count,
                success_count = excluded.success_count,
                failed_count = excluded.failed_count,
                total_fees = excluded.total_fees,
                priority_fees = excluded.priority_fees,
                jito_tips = excluded.jito_tips,
                total_compute_units = excluded.total_compute_units,
                category_counts = excluded.category_counts",
            params![
                aggregate.slot as i64,
                aggregate.timestamp,
                aggregate.tx_count as i64,
                aggregate.success_count as i64,
                aggregate.failed_count as i64,
                aggregate.total_fees as i64,
                aggregate.priority_fees as i64,
                aggregate.jito_tips as i64,
                aggregate.total_compute_units as i64,
                categories,
            ],
        )?;
        let evicted = tx.execute(
            "DELETE FROM block_aggregates
             WHERE timestamp < (SELECT MAX(timestamp) FROM block_aggregates) - ?1",
            params![self.retention_ms],
        )?;
        tx.commit()?;
        Ok(PutOutcome {
            evicted: evicted as u64,
        })
    }

    /// Rows with `timestamp >= since_ms`, oldest first.
    pub fn query_range(&self, since_ms: i64) -> Result<Vec<HistoricalAggregate>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM block_aggregates
             WHERE timestamp >= ?1 ORDER BY timestamp ASC, slot ASC"
        ))?;
        let rows = stmt.query_map(params![since_ms], HistoricalAggregate::from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(decode_categories(row?)?);
        }
        Ok(out)
    }

    /// Roll every stored row into `bucket_ms` buckets.
    pub fn rollup(&self, bucket_ms: u64) -> Result<Vec<RollupBucket>, StoreError> {
        self.rollup_since(i64::MIN, bucket_ms)
    }

    /// Roll rows with `timestamp >= since_ms` into epoch-aligned buckets.
    /// Empty buckets are omitted.
    pub fn rollup_since(
        &self,
        since_ms: i64,
        bucket_ms: u64,
    ) -> Result<Vec<RollupBucket>, StoreError> {
        let width = i64::try_from(bucket_ms)
            .ok()
            .filter(|width| *width > 0)
            .ok_or(StoreError::InvalidBucket(bucket_ms))?;
        let mut buckets: BTreeMap<i64, RollupBucket> = BTreeMap::new();
        for row in self.query_range(since_ms)? {
            let start = row.timestamp - row.timestamp.rem_euclid(width);
            buckets
                .entry(start)
                .or_insert_with(|| RollupBucket::empty(start))
                .add(&row);
        }
        Ok(buckets.into_values().map(RollupBucket::finish).collect())
    }

    /// Number of stored rows.
    pub fn len(&self) -> Result<u64, StoreError> {
        let count: i64 =
            self.conn
                .lock()
                .query_row("SELECT COUNT(*) FROM block_aggregates", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// True when the store holds no rows.
    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    /// Row with the highest slot.
    pub fn latest(&self) -> Result<Option<HistoricalAggregate>, StoreError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM block_aggregates ORDER BY slot DESC LIMIT 1"),
                [],
                HistoricalAggregate::from_row,
            )
            .optional()?;
        row.map(decode_categories).transpose()
    }
}

fn decode_categories(
    (mut aggregate, raw): (HistoricalAggregate, String),
) -> Result<HistoricalAggregate, StoreError> {
    aggregate.category_counts = serde_json::from_str(&raw)?;
    Ok(aggregate)
}

fn user_version(conn: &Connection) -> rusqlite::Result<u32> {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
}

fn migrate(conn: &mut Connection) -> Result<(), StoreError> {
    let supported = MIGRATIONS.len() as u32;
    let found = user_version(conn)?;
    if found > supported {
        return Err(StoreError::UnsupportedSchema { found, supported });
    }
    for (version, sql) in MIGRATIONS.iter().enumerate().skip(found as usize) {
        let next = version as u32 + 1;
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.pragma_update(None, "user_version", next)?;
        tx.commit()?;
        info!(version = next, "applied history schema migration");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::{TransactionRecord, TxCategory};

    const HOUR_MS: i64 = 60 * 60 * 1_000;

    fn aggregate(slot: u64, timestamp: i64, tx_count: u64) -> HistoricalAggregate {
        HistoricalAggregate {
            slot,
            timestamp,
            tx_count,
            success_count: tx_count,
            failed_count: 0,
            total_fees: tx_count * 5_000,
            priority_fees: 0,
            jito_tips: 0,
            total_compute_units: tx_count * 100,
            category_counts: BTreeMap::from([("other".to_string(), tx_count)]),
        }
    }

    #[test]
    fn same_slot_overwrites() {
        let store = HistoricalStore::open_in_memory(DEFAULT_RETENTION).expect("open");
        store.put(&aggregate(42, 1_000, 10)).expect("put");
        store.put(&aggregate(42, 1_000, 12)).expect("put");
        let rows = store.query_range(0).expect("query");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].tx_count, 12);
        assert_eq!(rows[0].category_counts.get("other"), Some(&12));
    }

    #[test]
    fn retention_sweep_bounds_stored_rows() {
        let store = HistoricalStore::open_in_memory(Duration::from_secs(2 * 60 * 60))
            .expect("open");
        for hour in 0..6i64 {
            store
                .put(&aggregate(hour as u64, hour * HOUR_MS, 1))
                .expect("put");
        }
        let rows = store.query_range(0).expect("query");
        let newest = rows.iter().map(|r| r.timestamp).max().expect("rows");
        assert!(rows.iter().all(|r| r.timestamp >= newest - 2 * HOUR_MS));
        assert_eq!(rows.len(), 3);

        let outcome = store.put(&aggregate(10, 10 * HOUR_MS, 1)).expect("put");
        assert_eq!(outcome.evicted, 3);
        assert_eq!(store.len().expect("len"), 1);
    }

    #[test]
    fn late_old_row_is_swept_immediately() {
        let store = HistoricalStore::open_in_memory(Duration::from_secs(60)).expect("open");
        store.put(&aggregate(2, 10 * HOUR_MS, 1)).expect("put");
        let outcome = store.put(&aggregate(1, 0, 1)).expect("put");
        assert_eq!(outcome.evicted, 1);
        assert_eq!(store.latest().expect("latest").map(|r| r.slot), Some(2));
    }

    #[test]
    fn rollup_aligns_to_epoch_and_skips_empty_buckets() {
        let store = HistoricalStore::open_in_memory(DEFAULT_RETENTION).expect("open");
        store.put(&aggregate(1, 61_000, 2)).expect("put");
        store.put(&aggregate(2, 119_999, 4)).expect("put");
        store.put(&aggregate(3, 250_000, 1)).expect("put");

        let buckets = store.rollup(60_000).expect("rollup");
        let starts: Vec<_> = buckets.iter().map(|b| b.timestamp).collect();
        assert_eq!(starts, vec![60_000, 240_000]);
        assert_eq!(buckets[0].blocks, 2);
        assert_eq!(buckets[0].tx_count, 6);
        assert_eq!(buckets[0].avg_fee, 5_000.0);
        assert_eq!(buckets[0].avg_compute_units, 100.0);
        assert_eq!(buckets[0].success_rate, 100.0);
        assert_eq!(buckets[0].category_counts.get("other"), Some(&6));

        let recent = store.rollup_since(200_000, 60_000).expect("rollup");
        assert_eq!(recent.len(), 1);
    }

    #[test]
    fn zero_bucket_is_rejected() {
        let store = HistoricalStore::open_in_memory(DEFAULT_RETENTION).expect("open");
        assert!(matches!(store.rollup(0), Err(StoreError::InvalidBucket(0))));
    }

    #[test]
    fn empty_block_aggregate_keeps_success_rate() {
        let store = HistoricalStore::open_in_memory(DEFAULT_RETENTION).expect("open");
        store.put(&aggregate(9, 5_000, 0)).expect("put");
        let buckets = store.rollup(1_000).expect("rollup");
        assert_eq!(buckets[0].success_rate, 100.0);
        assert_eq!(buckets[0].avg_fee, 0.0);
    }

    #[test]
    fn aggregate_from_block_clamps_priority_fee() {
        let tx = TransactionRecord {
            signature: "s".into(),
            success: true,
            fee: 5_000,
            compute_units: 10,
            programs: vec![],
            num_signatures: 3,
            fee_payer: "p".into(),
            jito_tip: 7,
            sol_movement: 0,
            error: None,
            category: TxCategory::System,
        };
        let block = SlotBlock {
            slot: 11,
            block_time: None,
            total_fees: 5_000,
            total_compute_units: 10,
            transactions: vec![tx],
            dropped_transactions: 0,
        };
        assert!(block.priority_fee_estimate() < 0);
        let aggregate = HistoricalAggregate::from_block(&block, 99);
        assert_eq!(aggregate.priority_fees, 0);
        assert_eq!(aggregate.timestamp, 99);
        assert_eq!(aggregate.jito_tips, 7);
        assert_eq!(aggregate.category_counts.get("system"), Some(&1));
    }

    #[test]
    fn version_one_database_is_upgraded_in_place() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("history.db");
        {
            let conn = Connection::open(&path).expect("open raw");
            conn.execute_batch(MIGRATIONS[0]).expect("v1 schema");
            conn.pragma_update(None, "user_version", 1u32).expect("version");
            conn.execute(
                "INSERT INTO block_aggregates VALUES (7, 1000, 3, 2, 1, 15000, 0, 300)",
                [],
            )
            .expect("seed row");
        }

        let store = HistoricalStore::open(&path, DEFAULT_RETENTION).expect("open store");
        assert_eq!(store.schema_version().expect("version"), MIGRATIONS.len() as u32);
        let row = store.latest().expect("latest").expect("row survives");
        assert_eq!(row.slot, 7);
        assert_eq!(row.failed_count, 1);
        assert_eq!(row.jito_tips, 0);
        assert!(row.category_counts.is_empty());
    }

    #[test]
    fn newer_schema_is_refused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("future.db");
        {
            let conn = Connection::open(&path).expect("open raw");
            conn.pragma_update(None, "user_version", 99u32).expect("version");
        }
        let err = HistoricalStore::open(&path, DEFAULT_RETENTION)
            .err()
            .expect("refused");
        assert!(matches!(err, StoreError::UnsupportedSchema { found: 99, .. }));
    }
}
