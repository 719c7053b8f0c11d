//! SQLite persistence for filter parameters and per-file OPP summaries.
//!
//! The database is shared by every worker of a batch run, and by other tools
//! in the processing chain, so [`Repository`] never holds a live connection.
//! Each public operation opens a connection, runs exactly one transaction and
//! closes it again, wrapped in the store's [`RetryPolicy`].
//!
//! Column order of every table is fixed; downstream tools read rows
//! positionally.

use crate::error::{AppResult, OppError, StorageError};
use crate::evt::Channel;
use crate::gating::{FilterOptions, GateParameters, GatingResult};
use crate::retry::RetryPolicy;
use crate::stats::{ChannelStats, Stat};
use chrono::{SecondsFormat, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS vct (
    cruise TEXT NOT NULL,
    file TEXT NOT NULL,
    pop TEXT NOT NULL,
    count INTEGER NOT NULL,
    method TEXT NOT NULL,
    fsc_small REAL NOT NULL,
    fsc_perp REAL NOT NULL,
    pe REAL NOT NULL,
    chl_small REAL NOT NULL,
    gating_id TEXT NOT NULL,
    PRIMARY KEY (cruise, file, pop)
);

CREATE TABLE IF NOT EXISTS opp (
    cruise TEXT NOT NULL,
    file TEXT NOT NULL,
    opp_count INTEGER NOT NULL,
    evt_count INTEGER NOT NULL,
    opp_evt_ratio REAL NOT NULL,
    notch1 REAL NOT NULL,
    notch2 REAL NOT NULL,
    offset REAL NOT NULL,
    origin REAL NOT NULL,
    width REAL NOT NULL,
    fsc_small_min REAL NOT NULL,
    fsc_small_max REAL NOT NULL,
    fsc_small_mean REAL NOT NULL,
    fsc_perp_min REAL NOT NULL,
    fsc_perp_max REAL NOT NULL,
    fsc_perp_mean REAL NOT NULL,
    fsc_big_min REAL NOT NULL,
    fsc_big_max REAL NOT NULL,
    fsc_big_mean REAL NOT NULL,
    pe_min REAL NOT NULL,
    pe_max REAL NOT NULL,
    pe_mean REAL NOT NULL,
    chl_small_min REAL NOT NULL,
    chl_small_max REAL NOT NULL,
    chl_small_mean REAL NOT NULL,
    chl_big_min REAL NOT NULL,
    chl_big_max REAL NOT NULL,
    chl_big_mean REAL NOT NULL,
    filter_id TEXT NOT NULL,
    PRIMARY KEY (cruise, file)
);

CREATE TABLE IF NOT EXISTS sfl (
    cruise TEXT NOT NULL,
    file TEXT NOT NULL,
    date TEXT,
    file_duration REAL,
    lat REAL,
    lon REAL,
    conductivity REAL,
    salinity REAL,
    ocean_tmp REAL,
    par REAL,
    bulk_red REAL,
    stream_pressure REAL,
    flow_rate REAL,
    event_rate REAL,
    PRIMARY KEY (cruise, file)
);

CREATE TABLE IF NOT EXISTS cytdiv (
    cruise TEXT NOT NULL,
    file TEXT NOT NULL,
    N0 INTEGER,
    N1 REAL,
    H REAL,
    J REAL,
    opp_red REAL,
    PRIMARY KEY (cruise, file)
);

CREATE TABLE IF NOT EXISTS filter (
    id TEXT NOT NULL,
    date TEXT NOT NULL,
    notch1 REAL,
    notch2 REAL,
    offset REAL NOT NULL,
    origin REAL,
    width REAL NOT NULL,
    PRIMARY KEY (id)
);

CREATE TABLE IF NOT EXISTS gating (
    id TEXT NOT NULL,
    date TEXT NOT NULL,
    pop_order TEXT NOT NULL,
    PRIMARY KEY (id)
);

CREATE TABLE IF NOT EXISTS poly (
    pop TEXT NOT NULL,
    fsc_small REAL,
    fsc_perp REAL,
    fsc_big REAL,
    pe REAL,
    chl_small REAL,
    chl_big REAL,
    gating_id TEXT NOT NULL
);
"#;

const INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS oppFileIndex ON opp (file);
CREATE INDEX IF NOT EXISTS vctFileIndex ON vct (file);
CREATE INDEX IF NOT EXISTS sflDateIndex ON sfl (date);
"#;

/// Number of columns in the `opp` table.
pub const OPP_COLUMN_COUNT: usize = 29;

/// Position of the first statistics column in an `opp` row.
const OPP_STATS_START: usize = 10;

/// Connection settings shared by every repository operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    /// How long SQLite itself waits on a locked database before reporting busy
    pub busy_timeout: Duration,
    /// Retries applied on top of the busy timeout
    pub retry: RetryPolicy,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_secs(120),
            retry: RetryPolicy::default(),
        }
    }
}

/// One immutable row of the `filter` table.
///
/// Notches and origin stay `NULL` when they were inferred per file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterParameters {
    /// UUIDv4 primary key
    pub id: String,
    /// ISO-8601 UTC creation time
    pub date: String,
    /// Fixed D1 notch, if any
    pub notch1: Option<f64>,
    /// Fixed D2 notch, if any
    pub notch2: Option<f64>,
    /// Notch line shift
    pub offset: f64,
    /// Fixed origin, if any
    pub origin: Option<f64>,
    /// Alignment band half-width
    pub width: f64,
}

impl FilterParameters {
    /// Gating options equivalent to this row.
    pub fn options(&self) -> FilterOptions {
        FilterOptions {
            notch1: self.notch1,
            notch2: self.notch2,
            offset: Some(self.offset),
            origin: self.origin,
            width: Some(self.width),
        }
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            date: row.get(1)?,
            notch1: row.get(2)?,
            notch2: row.get(3)?,
            offset: row.get(4)?,
            origin: row.get(5)?,
            width: row.get(6)?,
        })
    }
}

/// One row of the `opp` table: the outcome of gating one file.
#[derive(Debug, Clone, PartialEq)]
pub struct OppSummary {
    /// Cruise name
    pub cruise: String,
    /// File identity (`<date_partition>/<stem>`)
    pub file: String,
    /// OPP rows in the file
    pub opp_count: u64,
    /// Rows in the file
    pub evt_count: u64,
    /// `opp_count / evt_count`
    pub opp_evt_ratio: f64,
    /// Parameters the file was gated with
    pub params: GateParameters,
    /// Statistics over the OPP rows
    pub stats: ChannelStats,
    /// Filter parameter set this run used
    pub filter_id: String,
}

impl OppSummary {
    /// Summarise a gating result.
    pub fn from_result(
        cruise: impl Into<String>,
        file: impl Into<String>,
        result: &GatingResult,
        stats: ChannelStats,
        filter_id: impl Into<String>,
    ) -> Self {
        Self {
            cruise: cruise.into(),
            file: file.into(),
            opp_count: result.opp_count() as u64,
            evt_count: result.evt_count() as u64,
            opp_evt_ratio: result.opp_evt_ratio(),
            params: *result.params(),
            stats,
            filter_id: filter_id.into(),
        }
    }

    /// Values in `opp` column order.
    fn to_values(&self) -> Vec<Value> {
        let mut values = Vec::with_capacity(OPP_COLUMN_COUNT);
        values.push(Value::Text(self.cruise.clone()));
        values.push(Value::Text(self.file.clone()));
        values.push(Value::Integer(self.opp_count as i64));
        values.push(Value::Integer(self.evt_count as i64));
        values.push(Value::Real(self.opp_evt_ratio));
        let p = &self.params;
        for v in [p.notch1, p.notch2, p.offset, p.origin, p.width] {
            values.push(Value::Real(v));
        }
        for (_, stat) in self.stats.iter() {
            values.extend([stat.min, stat.max, stat.mean].map(Value::Real));
        }
        values.push(Value::Text(self.filter_id.clone()));
        values
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let mut stats = [Stat::default(); Channel::STATS.len()];
        for (i, stat) in stats.iter_mut().enumerate() {
            let base = OPP_STATS_START + 3 * i;
            *stat = Stat {
                min: row.get(base)?,
                max: row.get(base + 1)?,
                mean: row.get(base + 2)?,
            };
        }
        Ok(Self {
            cruise: row.get(0)?,
            file: row.get(1)?,
            opp_count: get_count(row, 2)?,
            evt_count: get_count(row, 3)?,
            opp_evt_ratio: row.get(4)?,
            params: GateParameters {
                notch1: row.get(5)?,
                notch2: row.get(6)?,
                offset: row.get(7)?,
                origin: row.get(8)?,
                width: row.get(9)?,
            },
            stats: ChannelStats::from_array(stats),
            filter_id: row.get(OPP_COLUMN_COUNT - 1)?,
        })
    }
}

fn summary_statements(summary: &OppSummary) -> (&'static str, String, Vec<Value>) {
    let placeholders = (1..=OPP_COLUMN_COUNT)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    (
        "DELETE FROM opp WHERE cruise = ?1 AND file = ?2",
        format!("INSERT INTO opp VALUES ({placeholders})"),
        summary.to_values(),
    )
}

fn get_count(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    let raw: i64 = row.get(idx)?;
    u64::try_from(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Integer, Box::new(e)))
}

/// Handle on a SeaFlow SQLite database.
///
/// Cloning is cheap: the handle is a path plus settings.
#[derive(Debug, Clone)]
pub struct Repository {
    path: PathBuf,
    config: StorageConfig,
}

impl Repository {
    /// Open (creating if needed) the database at `path`.
    ///
    /// Verifies the file is reachable and switches it to WAL journaling so
    /// readers do not block the batch writers.
    pub fn open(path: impl AsRef<Path>, config: StorageConfig) -> Result<Self, StorageError> {
        let repo = Self {
            path: path.as_ref().to_path_buf(),
            config,
        };
        repo.config.retry.run(|| {
            let conn = repo.connect()?;
            let mode: String =
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
            tracing::debug!(path = %repo.path.display(), journal_mode = %mode, "opened database");
            Ok(())
        })?;
        Ok(repo)
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Connection settings.
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    fn connect(&self) -> rusqlite::Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(self.config.busy_timeout)?;
        Ok(conn)
    }

    fn transact<T, F>(&self, behavior: TransactionBehavior, f: F) -> Result<T, StorageError>
    where
        F: Fn(&Transaction<'_>) -> rusqlite::Result<T>,
    {
        self.config.retry.run(|| {
            let mut conn = self.connect()?;
            let tx = conn.transaction_with_behavior(behavior)?;
            let value = f(&tx)?;
            tx.commit()?;
            Ok(value)
        })
    }

    /// Create every table if it does not exist.
    pub fn ensure_tables(&self) -> Result<(), StorageError> {
        self.transact(TransactionBehavior::Immediate, |tx| tx.execute_batch(SCHEMA))
    }

    /// Create the lookup indexes if they do not exist.
    pub fn ensure_indexes(&self) -> Result<(), StorageError> {
        self.transact(TransactionBehavior::Immediate, |tx| tx.execute_batch(INDEXES))
    }

    /// Record the filter parameters of a run under a fresh id.
    ///
    /// `width` and `offset` must be present; missing notches and origin are
    /// stored as `NULL`.
    pub fn save_filter_parameters(&self, options: &FilterOptions) -> AppResult<FilterParameters> {
        let (width, offset) = options.validate()?;
        let row = FilterParameters {
            id: Uuid::new_v4().to_string(),
            date: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, false),
            notch1: options.notch1,
            notch2: options.notch2,
            offset,
            origin: options.origin,
            width,
        };
        self.transact(TransactionBehavior::Immediate, |tx| {
            tx.execute(
                "INSERT INTO filter VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    row.id,
                    row.date,
                    row.notch1,
                    row.notch2,
                    row.offset,
                    row.origin,
                    row.width
                ],
            )
        })?;
        tracing::info!(filter_id = %row.id, "saved filter parameters");
        Ok(row)
    }

    /// Store one file's summary, replacing any earlier row for the same
    /// `(cruise, file)`.
    pub fn save_opp_summary(&self, summary: &OppSummary) -> Result<(), StorageError> {
        let (delete, insert, values) = summary_statements(summary);
        self.transact(TransactionBehavior::Immediate, |tx| {
            tx.execute(delete, params![summary.cruise, summary.file])?;
            tx.execute(&insert, params_from_iter(values.iter()))
        })?;
        Ok(())
    }

    /// Store one file's summary and publish its output in the same unit of
    /// work.
    ///
    /// `publish` runs after the replacing row is written but before the
    /// transaction commits. If it fails the transaction rolls back and its
    /// I/O error is returned. If the commit itself fails, `retract` undoes the
    /// publication before the attempt is retried or the error returned.
    pub fn save_opp_summary_with<P, R>(
        &self,
        summary: &OppSummary,
        publish: P,
        retract: R,
    ) -> AppResult<()>
    where
        P: Fn() -> std::io::Result<()>,
        R: Fn(),
    {
        let (delete, insert, values) = summary_statements(summary);
        let published = self.config.retry.run(|| {
            let mut conn = self.connect()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(delete, params![summary.cruise, summary.file])?;
            tx.execute(&insert, params_from_iter(values.iter()))?;
            if let Err(e) = publish() {
                // dropping the transaction rolls it back
                return Ok(Err(e));
            }
            tx.commit().inspect_err(|_| retract())?;
            Ok(Ok(()))
        })?;
        published.map_err(OppError::Io)
    }

    /// Look up a filter parameter row by id.
    pub fn load_filter_parameters(&self, id: &str) -> Result<Option<FilterParameters>, StorageError> {
        self.transact(TransactionBehavior::Deferred, |tx| {
            tx.query_row(
                "SELECT * FROM filter WHERE id = ?1",
                params![id],
                FilterParameters::from_row,
            )
            .optional()
        })
    }

    /// Look up one file's summary.
    pub fn load_opp_summary(&self, cruise: &str, file: &str) -> Result<Option<OppSummary>, StorageError> {
        self.transact(TransactionBehavior::Deferred, |tx| {
            tx.query_row(
                "SELECT * FROM opp WHERE cruise = ?1 AND file = ?2",
                params![cruise, file],
                OppSummary::from_row,
            )
            .optional()
        })
    }

    /// Every summary of a cruise, ordered by file.
    pub fn load_opp_summaries(&self, cruise: &str) -> Result<Vec<OppSummary>, StorageError> {
        self.transact(TransactionBehavior::Deferred, |tx| {
            let mut stmt = tx.prepare("SELECT * FROM opp WHERE cruise = ?1 ORDER BY file")?;
            let rows = stmt.query_map(params![cruise], OppSummary::from_row)?;
            rows.collect()
        })
    }

    /// Total number of rows in the `opp` table.
    pub fn opp_row_count(&self) -> Result<u64, StorageError> {
        self.transact(TransactionBehavior::Deferred, |tx| {
            tx.query_row("SELECT COUNT(*) FROM opp", [], |row| get_count(row, 0))
        })
    }
}
