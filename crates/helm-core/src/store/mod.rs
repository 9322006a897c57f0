//! Centralized log and metric store.
//!
//! A single `SQLite` database holds two append-only tables:
//!
//! - `log_entries` — every log line shipped by the managed services.
//!   Rows are immutable after insert; the only permitted mutation is the
//!   age-based retention sweep.
//! - `service_metrics` — time-series CPU/memory samples written by the
//!   monitor loop.
//!
//! Batched ingest is all-or-nothing: the whole batch is validated before
//! a single transaction writes it, so a malformed entry rejects the batch
//! with a precise error instead of silently dropping rows. Row ids are
//! `AUTOINCREMENT`, which makes insert order recoverable: `x.id < y.id`
//! exactly when `x` was persisted before `y`.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use serde::{Deserialize, Serialize};

use crate::registry::is_valid_slug;

/// Maximum entries accepted in one ingest batch.
pub const MAX_BATCH_SIZE: usize = 500;

/// Maximum rows returned by one log query.
pub const MAX_QUERY_LIMIT: u32 = 1000;

/// Log severity, ordered.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    /// Diagnostic detail.
    Debug,
    /// Routine events.
    Info,
    /// Something unexpected but recoverable.
    Warning,
    /// A failure.
    Error,
    /// A failure the service cannot continue past.
    Critical,
}

impl LogLevel {
    /// All levels in ascending severity.
    pub const ALL: [Self; 5] = [
        Self::Debug,
        Self::Info,
        Self::Warning,
        Self::Error,
        Self::Critical,
    ];

    /// Wire spelling (upper-case).
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "DEBUG" => Ok(Self::Debug),
            "INFO" => Ok(Self::Info),
            "WARNING" => Ok(Self::Warning),
            "ERROR" => Ok(Self::Error),
            "CRITICAL" => Ok(Self::Critical),
            other => Err(format!("unknown log level '{other}'")),
        }
    }
}

/// A persisted log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Monotonic row id (insert order).
    pub id: i64,
    /// Event time (client-supplied or server clock at ingest).
    pub timestamp: DateTime<Utc>,
    /// Originating service.
    pub service_name: String,
    /// Severity.
    pub level: LogLevel,
    /// Log message.
    pub message: String,
    /// Structured context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
    /// Request-tracing id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    /// User that triggered the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Host the entry originated on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// PID of the originating process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_id: Option<i64>,
}

/// One entry of an ingest batch, before persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewLogEntry {
    /// Severity (upper-case wire spelling).
    pub level: String,
    /// Log message; must be non-empty.
    pub message: String,
    /// Event time; defaults to the server clock when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Structured context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
    /// Request-tracing id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    /// User that triggered the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Host the entry originated on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// PID of the originating process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_id: Option<i64>,
}

/// An ingest batch as posted by a service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogBatch {
    /// Originating service (slug).
    pub service_name: String,
    /// Entries in submission order.
    pub logs: Vec<NewLogEntry>,
}

/// Filters for a log query. Every field is optional; results are always
/// ordered by `timestamp desc`.
#[derive(Debug, Clone, Default)]
pub struct LogQuery {
    /// Restrict to one service.
    pub service_name: Option<String>,
    /// Minimum severity (inclusive).
    pub min_level: Option<LogLevel>,
    /// Inclusive lower bound on timestamp.
    pub start_time: Option<DateTime<Utc>>,
    /// Inclusive upper bound on timestamp.
    pub end_time: Option<DateTime<Utc>>,
    /// Restrict to one trace.
    pub trace_id: Option<String>,
    /// Restrict to one user.
    pub user_id: Option<String>,
    /// Page size, clamped to [`MAX_QUERY_LIMIT`].
    pub limit: u32,
    /// Page offset.
    pub offset: u32,
}

/// A persisted metric sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    /// Service the sample belongs to.
    pub service_name: String,
    /// Sample time.
    pub timestamp: DateTime<Utc>,
    /// Metric name (`cpu_percent`, `memory_mb`, ...).
    pub metric_name: String,
    /// Metric value.
    pub value: f64,
    /// Optional key/value tags.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<serde_json::Value>,
}

/// Store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A batch entry failed validation; nothing from the batch was
    /// persisted.
    #[error("invalid batch entry at index {index}: {reason}")]
    InvalidBatch {
        /// Zero-based index of the offending entry.
        index: usize,
        /// What was wrong with it.
        reason: String,
    },

    /// The batch exceeds [`MAX_BATCH_SIZE`].
    #[error("batch of {0} entries exceeds the maximum of {MAX_BATCH_SIZE}")]
    BatchTooLarge(usize),

    /// The batch's service name is not a valid slug.
    #[error("invalid service name '{0}'")]
    InvalidServiceName(String),

    /// Underlying database failure.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Filesystem failure creating the database directory.
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection mutex was poisoned by a panicking writer.
    #[error("store connection lock poisoned")]
    LockPoisoned,
}

/// The log/metric store, backed by a single `SQLite` connection.
#[derive(Debug, Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (and create if needed) the store at the given path.
    ///
    /// # Errors
    ///
    /// Propagates database open and schema failures.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory store (tests).
    ///
    /// # Errors
    ///
    /// Propagates schema failures.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS log_entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                service_name TEXT NOT NULL,
                level TEXT NOT NULL,
                message TEXT NOT NULL,
                context TEXT,
                trace_id TEXT,
                user_id TEXT,
                hostname TEXT,
                process_id INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_log_entries_timestamp
                ON log_entries(timestamp DESC);
            CREATE INDEX IF NOT EXISTS idx_log_entries_service_timestamp
                ON log_entries(service_name, timestamp DESC);
            CREATE INDEX IF NOT EXISTS idx_log_entries_level_timestamp
                ON log_entries(level, timestamp DESC);
            CREATE INDEX IF NOT EXISTS idx_log_entries_trace_id
                ON log_entries(trace_id);
            CREATE INDEX IF NOT EXISTS idx_log_entries_user_id
                ON log_entries(user_id);

            CREATE TABLE IF NOT EXISTS service_metrics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                service_name TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                metric_name TEXT NOT NULL,
                value REAL NOT NULL,
                tags TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_service_metrics_service_timestamp
                ON service_metrics(service_name, timestamp DESC);",
        )
    }

    /// Validate and persist a batch in one transaction.
    ///
    /// Entries are written in submission order, so their row ids are
    /// strictly increasing within the batch.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidBatch`] naming the first offending
    /// entry; nothing is persisted in that case.
    pub fn ingest_batch(&self, batch: &LogBatch) -> Result<u64, StoreError> {
        if !is_valid_slug(&batch.service_name) {
            return Err(StoreError::InvalidServiceName(batch.service_name.clone()));
        }
        if batch.logs.len() > MAX_BATCH_SIZE {
            return Err(StoreError::BatchTooLarge(batch.logs.len()));
        }

        // Validate everything before touching the database.
        let mut prepared = Vec::with_capacity(batch.logs.len());
        for (index, entry) in batch.logs.iter().enumerate() {
            let level: LogLevel = entry
                .level
                .parse()
                .map_err(|reason| StoreError::InvalidBatch { index, reason })?;
            if entry.message.trim().is_empty() {
                return Err(StoreError::InvalidBatch {
                    index,
                    reason: "empty message".to_string(),
                });
            }
            prepared.push((level, entry));
        }

        let mut conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO log_entries
                    (timestamp, service_name, level, message, context,
                     trace_id, user_id, hostname, process_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for (level, entry) in &prepared {
                let timestamp = entry.timestamp.unwrap_or_else(Utc::now);
                stmt.execute(params![
                    encode_time(timestamp),
                    batch.service_name,
                    level.as_str(),
                    entry.message,
                    entry.context.as_ref().map(serde_json::Value::to_string),
                    entry.trace_id,
                    entry.user_id,
                    entry.hostname,
                    entry.process_id,
                ])?;
            }
        }
        tx.commit()?;

        Ok(prepared.len() as u64)
    }

    /// Query log entries, newest first.
    ///
    /// # Errors
    ///
    /// Propagates database failures.
    pub fn query_logs(&self, query: &LogQuery) -> Result<Vec<LogEntry>, StoreError> {
        let mut sql = String::from(
            "SELECT id, timestamp, service_name, level, message, context,
                    trace_id, user_id, hostname, process_id
             FROM log_entries WHERE 1=1",
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(service) = &query.service_name {
            sql.push_str(" AND service_name = ?");
            args.push(Box::new(service.clone()));
        }
        if let Some(min_level) = query.min_level {
            let allowed: Vec<&str> = LogLevel::ALL
                .iter()
                .filter(|l| **l >= min_level)
                .map(|l| l.as_str())
                .collect();
            sql.push_str(" AND level IN (");
            sql.push_str(&vec!["?"; allowed.len()].join(", "));
            sql.push(')');
            for level in allowed {
                args.push(Box::new(level.to_string()));
            }
        }
        if let Some(start) = query.start_time {
            sql.push_str(" AND timestamp >= ?");
            args.push(Box::new(encode_time(start)));
        }
        if let Some(end) = query.end_time {
            sql.push_str(" AND timestamp <= ?");
            args.push(Box::new(encode_time(end)));
        }
        if let Some(trace_id) = &query.trace_id {
            sql.push_str(" AND trace_id = ?");
            args.push(Box::new(trace_id.clone()));
        }
        if let Some(user_id) = &query.user_id {
            sql.push_str(" AND user_id = ?");
            args.push(Box::new(user_id.clone()));
        }

        let limit = if query.limit == 0 {
            100
        } else {
            query.limit.min(MAX_QUERY_LIMIT)
        };
        sql.push_str(" ORDER BY timestamp DESC, id DESC LIMIT ? OFFSET ?");
        args.push(Box::new(limit));
        args.push(Box::new(query.offset));

        let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params_from_iter(args.iter().map(|arg| arg.as_ref())),
            row_to_entry,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Fetch one log entry by id.
    ///
    /// # Errors
    ///
    /// Propagates database failures.
    pub fn get_log(&self, id: i64) -> Result<Option<LogEntry>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        Ok(conn
            .query_row(
                "SELECT id, timestamp, service_name, level, message, context,
                        trace_id, user_id, hostname, process_id
                 FROM log_entries WHERE id = ?1",
                params![id],
                row_to_entry,
            )
            .optional()?)
    }

    /// Persist one metric sample.
    ///
    /// # Errors
    ///
    /// Propagates database failures.
    pub fn record_metric(&self, sample: &MetricSample) -> Result<(), StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        conn.execute(
            "INSERT INTO service_metrics (service_name, timestamp, metric_name, value, tags)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                sample.service_name,
                encode_time(sample.timestamp),
                sample.metric_name,
                sample.value,
                sample.tags.as_ref().map(serde_json::Value::to_string),
            ],
        )?;
        Ok(())
    }

    /// Query metric samples for one service in a time range, newest first.
    ///
    /// # Errors
    ///
    /// Propagates database failures.
    pub fn query_metrics(
        &self,
        service_name: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        metric_name: Option<&str>,
        limit: u32,
    ) -> Result<Vec<MetricSample>, StoreError> {
        let mut sql = String::from(
            "SELECT service_name, timestamp, metric_name, value, tags
             FROM service_metrics
             WHERE service_name = ? AND timestamp >= ? AND timestamp <= ?",
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = vec![
            Box::new(service_name.to_string()),
            Box::new(encode_time(start)),
            Box::new(encode_time(end)),
        ];
        if let Some(name) = metric_name {
            sql.push_str(" AND metric_name = ?");
            args.push(Box::new(name.to_string()));
        }
        sql.push_str(" ORDER BY timestamp DESC LIMIT ?");
        args.push(Box::new(limit.min(MAX_QUERY_LIMIT)));

        let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params_from_iter(args.iter().map(|arg| arg.as_ref())),
            |row| {
                Ok(MetricSample {
                    service_name: row.get(0)?,
                    timestamp: decode_time(&row.get::<_, String>(1)?),
                    metric_name: row.get(2)?,
                    value: row.get(3)?,
                    tags: row
                        .get::<_, Option<String>>(4)?
                        .and_then(|raw| serde_json::from_str(&raw).ok()),
                })
            },
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Per-service log counts by level since the given time. Feeds the
    /// dashboard's activity column.
    ///
    /// # Errors
    ///
    /// Propagates database failures.
    pub fn level_counts_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<BTreeMap<String, BTreeMap<String, i64>>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        let mut stmt = conn.prepare(
            "SELECT service_name, level, COUNT(id)
             FROM log_entries WHERE timestamp >= ?1
             GROUP BY service_name, level",
        )?;
        let rows = stmt.query_map(params![encode_time(since)], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;

        let mut out: BTreeMap<String, BTreeMap<String, i64>> = BTreeMap::new();
        for row in rows {
            let (service, level, count) = row?;
            out.entry(service).or_default().insert(level, count);
        }
        Ok(out)
    }

    /// Delete log entries older than the cutoff. The retention sweep is
    /// the only mutation permitted on `log_entries`.
    ///
    /// # Errors
    ///
    /// Propagates database failures.
    pub fn purge_logs_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        let deleted = conn.execute(
            "DELETE FROM log_entries WHERE timestamp < ?1",
            params![encode_time(cutoff)],
        )?;
        Ok(deleted as u64)
    }
}

/// RFC 3339 with microseconds and a `Z` suffix: fixed-width, so lexical
/// ordering in SQL matches chronological ordering.
fn encode_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_time(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_default()
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<LogEntry> {
    let level: String = row.get(3)?;
    Ok(LogEntry {
        id: row.get(0)?,
        timestamp: decode_time(&row.get::<_, String>(1)?),
        service_name: row.get(2)?,
        level: level.parse().unwrap_or(LogLevel::Info),
        message: row.get(4)?,
        context: row
            .get::<_, Option<String>>(5)?
            .and_then(|raw| serde_json::from_str(&raw).ok()),
        trace_id: row.get(6)?,
        user_id: row.get(7)?,
        hostname: row.get(8)?,
        process_id: row.get(9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(level: &str, message: &str) -> NewLogEntry {
        NewLogEntry {
            level: level.to_string(),
            message: message.to_string(),
            timestamp: None,
            context: None,
            trace_id: None,
            user_id: None,
            hostname: None,
            process_id: None,
        }
    }

    fn batch(service: &str, entries: Vec<NewLogEntry>) -> LogBatch {
        LogBatch {
            service_name: service.to_string(),
            logs: entries,
        }
    }

    #[test]
    fn test_ingest_and_query() {
        let store = Store::open_in_memory().unwrap();

        let count = store
            .ingest_batch(&batch(
                "billing",
                vec![entry("INFO", "started"), entry("ERROR", "db down")],
            ))
            .unwrap();
        assert_eq!(count, 2);

        let all = store.query_logs(&LogQuery::default()).unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|e| e.service_name == "billing"));
    }

    #[test]
    fn test_batch_with_empty_message_is_fully_rejected() {
        let store = Store::open_in_memory().unwrap();

        let err = store
            .ingest_batch(&batch(
                "billing",
                vec![
                    entry("INFO", "one"),
                    entry("INFO", ""),
                    entry("INFO", "three"),
                ],
            ))
            .unwrap_err();

        assert!(matches!(err, StoreError::InvalidBatch { index: 1, .. }));
        // Atomicity: nothing from the batch landed.
        assert!(store.query_logs(&LogQuery::default()).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_level_rejects_batch() {
        let store = Store::open_in_memory().unwrap();
        let err = store
            .ingest_batch(&batch("billing", vec![entry("LOUD", "x")]))
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidBatch { index: 0, .. }));
    }

    #[test]
    fn test_invalid_service_name_rejected() {
        let store = Store::open_in_memory().unwrap();
        let err = store
            .ingest_batch(&batch("Not A Slug", vec![entry("INFO", "x")]))
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidServiceName(_)));
    }

    #[test]
    fn test_ids_are_monotonic_in_submission_order() {
        let store = Store::open_in_memory().unwrap();
        store
            .ingest_batch(&batch(
                "alpha",
                (0..10).map(|i| entry("INFO", &format!("m{i}"))).collect(),
            ))
            .unwrap();
        store
            .ingest_batch(&batch("beta", vec![entry("INFO", "later")]))
            .unwrap();

        let mut all = store.query_logs(&LogQuery::default()).unwrap();
        all.sort_by_key(|e| e.id);

        for pair in all.windows(2) {
            assert!(pair[0].id < pair[1].id);
        }
        // The later batch has ids above every entry of the earlier one.
        let beta_id = all.iter().find(|e| e.service_name == "beta").unwrap().id;
        assert!(
            all.iter()
                .filter(|e| e.service_name == "alpha")
                .all(|e| e.id < beta_id)
        );
    }

    #[test]
    fn test_level_threshold_filter() {
        let store = Store::open_in_memory().unwrap();
        store
            .ingest_batch(&batch(
                "alpha",
                vec![
                    entry("DEBUG", "d"),
                    entry("INFO", "i"),
                    entry("WARNING", "w"),
                    entry("ERROR", "e"),
                    entry("CRITICAL", "c"),
                ],
            ))
            .unwrap();

        let hits = store
            .query_logs(&LogQuery {
                min_level: Some(LogLevel::Warning),
                ..LogQuery::default()
            })
            .unwrap();
        assert_eq!(hits.len(), 3);
        assert!(hits.iter().all(|e| e.level >= LogLevel::Warning));
    }

    #[test]
    fn test_trace_and_user_filters() {
        let store = Store::open_in_memory().unwrap();
        let mut traced = entry("INFO", "traced");
        traced.trace_id = Some("trace-1".to_string());
        traced.user_id = Some("ops@example.com".to_string());
        store
            .ingest_batch(&batch("alpha", vec![traced, entry("INFO", "other")]))
            .unwrap();

        let hits = store
            .query_logs(&LogQuery {
                trace_id: Some("trace-1".to_string()),
                ..LogQuery::default()
            })
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].user_id.as_deref(), Some("ops@example.com"));
    }

    #[test]
    fn test_pagination_orders_newest_first() {
        let store = Store::open_in_memory().unwrap();
        let base = Utc::now();
        let entries = (0..5)
            .map(|i| {
                let mut e = entry("INFO", &format!("m{i}"));
                e.timestamp = Some(base - chrono::Duration::seconds(i));
                e
            })
            .collect();
        store.ingest_batch(&batch("alpha", entries)).unwrap();

        let page = store
            .query_logs(&LogQuery {
                limit: 2,
                offset: 1,
                ..LogQuery::default()
            })
            .unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].message, "m1");
        assert_eq!(page[1].message, "m2");
    }

    #[test]
    fn test_retention_purges_only_old_entries() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();

        let mut old = entry("INFO", "ancient");
        old.timestamp = Some(now - chrono::Duration::days(120));
        let mut fresh = entry("INFO", "recent");
        fresh.timestamp = Some(now - chrono::Duration::days(1));
        store.ingest_batch(&batch("alpha", vec![old, fresh])).unwrap();

        let deleted = store
            .purge_logs_before(now - chrono::Duration::days(90))
            .unwrap();
        assert_eq!(deleted, 1);

        let remaining = store.query_logs(&LogQuery::default()).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].message, "recent");
    }

    #[test]
    fn test_metrics_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        store
            .record_metric(&MetricSample {
                service_name: "alpha".to_string(),
                timestamp: now,
                metric_name: "cpu_percent".to_string(),
                value: 12.5,
                tags: None,
            })
            .unwrap();

        let samples = store
            .query_metrics(
                "alpha",
                now - chrono::Duration::hours(1),
                now + chrono::Duration::hours(1),
                Some("cpu_percent"),
                100,
            )
            .unwrap();
        assert_eq!(samples.len(), 1);
        assert!((samples[0].value - 12.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_level_counts_since() {
        let store = Store::open_in_memory().unwrap();
        store
            .ingest_batch(&batch(
                "alpha",
                vec![entry("ERROR", "a"), entry("ERROR", "b"), entry("INFO", "c")],
            ))
            .unwrap();

        let counts = store
            .level_counts_since(Utc::now() - chrono::Duration::hours(1))
            .unwrap();
        assert_eq!(counts["alpha"]["ERROR"], 2);
        assert_eq!(counts["alpha"]["INFO"], 1);
    }
}
