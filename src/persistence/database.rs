//! SQLite log store - one partitioned, append-only table of run output

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, info, trace};

use super::pattern::to_like_pattern;
use super::retry::RetryPolicy;
use crate::core::{
    parse_line, LogEntry, LogQuery, ManagerError, Result, RunRecord, RunSelector, RunStatus,
    StreamKind,
};

/// How long SQLite itself waits on a locked database before reporting busy
const BUSY_TIMEOUT: Duration = Duration::from_secs(2);

/// Log persistence and query engine.
///
/// Runs live in `runs`, one row per `(instance_name, start_id)`; their output
/// lives in `log_entries`, keyed by `(instance_name, start_id, sequence)`.
/// A single connection behind a mutex serializes writers across all runs.
pub struct LogStore {
    conn: Mutex<Connection>,
    retry: RetryPolicy,
}

impl LogStore {
    /// Open (or create) the store at `path`
    pub fn open(path: &Path, retry: RetryPolicy) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        // Enable WAL mode so readers do not block the ingesters
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        info!("Log store opened at {:?}", path);
        let store = Self {
            conn: Mutex::new(conn),
            retry,
        };
        store.initialize()?;
        Ok(store)
    }

    /// Open a throwaway store, used by tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let store = Self {
            conn: Mutex::new(conn),
            retry: RetryPolicy::default(),
        };
        store.initialize()?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| ManagerError::LockPoisoned("log store"))
    }

    /// Initialize database schema
    fn initialize(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            -- One directory row per run
            CREATE TABLE IF NOT EXISTS runs (
                instance_name TEXT NOT NULL,
                start_id INTEGER NOT NULL,
                start_time TEXT NOT NULL,
                pid INTEGER,
                status TEXT NOT NULL,
                ended_at TEXT,
                exit_code INTEGER,
                PRIMARY KEY (instance_name, start_id)
            );

            -- Output lines, partitioned by run
            CREATE TABLE IF NOT EXISTS log_entries (
                instance_name TEXT NOT NULL,
                start_id INTEGER NOT NULL,
                sequence INTEGER NOT NULL,
                source_timestamp TEXT NOT NULL,
                ingest_time TEXT NOT NULL,
                thread TEXT NOT NULL,
                level TEXT NOT NULL,
                message TEXT NOT NULL,
                stream TEXT NOT NULL,
                PRIMARY KEY (instance_name, start_id, sequence),
                FOREIGN KEY (instance_name, start_id)
                    REFERENCES runs (instance_name, start_id) ON DELETE CASCADE
            ) WITHOUT ROWID;

            -- Highest start_id ever handed out; retention cleanup never touches it
            CREATE TABLE IF NOT EXISTS run_counters (
                instance_name TEXT PRIMARY KEY,
                last_start_id INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_log_entries_ingest
                ON log_entries (instance_name, start_id, ingest_time);
            "#,
        )?;

        debug!("Log store schema initialized");
        Ok(())
    }

    // === Runs ===

    /// Allocate the next run id for an instance and create its partition
    pub fn begin_run(&self, instance_name: &str) -> Result<RunRecord> {
        let start_time = Utc::now();
        let mut conn = self.lock()?;

        let start_id = self.retry.run(|| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let start_id: i64 = tx.query_row(
                r#"
                SELECT MAX(
                    COALESCE((SELECT last_start_id FROM run_counters WHERE instance_name = ?1), 0),
                    COALESCE((SELECT MAX(start_id) FROM runs WHERE instance_name = ?1), 0)
                ) + 1
                "#,
                params![instance_name],
                |row| row.get(0),
            )?;
            tx.execute(
                r#"
                INSERT INTO run_counters (instance_name, last_start_id) VALUES (?1, ?2)
                ON CONFLICT (instance_name) DO UPDATE SET last_start_id = excluded.last_start_id
                "#,
                params![instance_name, start_id],
            )?;
            tx.execute(
                "INSERT INTO runs (instance_name, start_id, start_time, status) VALUES (?1, ?2, ?3, ?4)",
                params![
                    instance_name,
                    start_id,
                    format_time(&start_time),
                    RunStatus::Starting.label(),
                ],
            )?;
            tx.commit()?;
            Ok(start_id)
        })?;

        info!("Opened run #{} for instance '{}'", start_id, instance_name);
        Ok(RunRecord {
            instance_name: instance_name.to_string(),
            start_id,
            start_time,
            pid: None,
            status: RunStatus::Starting,
            ended_at: None,
            exit_code: None,
        })
    }

    /// Record the pid of a spawned run and mark it running
    pub fn mark_running(&self, instance_name: &str, start_id: i64, pid: u32) -> Result<()> {
        let conn = self.lock()?;
        let updated = self.retry.run(|| {
            conn.execute(
                "UPDATE runs SET status = ?1, pid = ?2 WHERE instance_name = ?3 AND start_id = ?4",
                params![RunStatus::Running.label(), pid, instance_name, start_id],
            )
        })?;
        ensure_updated(updated, instance_name, start_id)
    }

    /// Update the status of a run that has not finished yet
    pub fn set_status(&self, instance_name: &str, start_id: i64, status: RunStatus) -> Result<()> {
        let conn = self.lock()?;
        let updated = self.retry.run(|| {
            conn.execute(
                "UPDATE runs SET status = ?1 WHERE instance_name = ?2 AND start_id = ?3 AND ended_at IS NULL",
                params![status.label(), instance_name, start_id],
            )
        })?;
        debug!(
            "Run #{} of '{}' -> {} ({} row(s))",
            start_id, instance_name, status, updated
        );
        Ok(())
    }

    /// Close a run with its final status. Returns false if it was already closed.
    pub fn finish_run(
        &self,
        instance_name: &str,
        start_id: i64,
        status: RunStatus,
        exit_code: Option<i32>,
    ) -> Result<bool> {
        let conn = self.lock()?;
        let updated = self.retry.run(|| {
            conn.execute(
                r#"
                UPDATE runs SET status = ?1, ended_at = ?2, exit_code = ?3
                WHERE instance_name = ?4 AND start_id = ?5 AND ended_at IS NULL
                "#,
                params![
                    status.label(),
                    format_time(&Utc::now()),
                    exit_code,
                    instance_name,
                    start_id
                ],
            )
        })?;

        if updated > 0 {
            info!(
                "Run #{} of instance '{}' finished as {}",
                start_id, instance_name, status
            );
        }
        Ok(updated > 0)
    }

    /// Get a single run
    pub fn get_run(&self, instance_name: &str, start_id: i64) -> Result<Option<RunRecord>> {
        let conn = self.lock()?;
        let run = conn
            .query_row(
                &format!("{} WHERE instance_name = ?1 AND start_id = ?2", RUN_COLUMNS),
                params![instance_name, start_id],
                run_from_row,
            )
            .optional()?;
        Ok(run)
    }

    /// Get the most recent run of an instance
    pub fn latest_run(&self, instance_name: &str) -> Result<Option<RunRecord>> {
        let conn = self.lock()?;
        let run = conn
            .query_row(
                &format!(
                    "{} WHERE instance_name = ?1 ORDER BY start_id DESC LIMIT 1",
                    RUN_COLUMNS
                ),
                params![instance_name],
                run_from_row,
            )
            .optional()?;
        Ok(run)
    }

    /// All runs of an instance, most recent first
    pub fn runs(&self, instance_name: &str) -> Result<Vec<RunRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE instance_name = ?1 ORDER BY start_id DESC",
            RUN_COLUMNS
        ))?;
        let runs = stmt.query_map(params![instance_name], run_from_row)?;

        let mut result = Vec::new();
        for run in runs {
            result.push(run?);
        }
        Ok(result)
    }

    // === Entries ===

    /// Parse one raw output line and store it with the run's next sequence number
    pub fn append(
        &self,
        instance_name: &str,
        start_id: i64,
        raw_line: &str,
        stream: StreamKind,
    ) -> Result<LogEntry> {
        let ingest_time = Utc::now();
        let parsed = parse_line(raw_line, ingest_time);
        if !parsed.structured {
            trace!(
                "Unstructured {} line of '{}' (run #{}) stored as {}/{}",
                stream.label(),
                instance_name,
                start_id,
                parsed.thread,
                parsed.level
            );
        }
        let ingest_text = format_time(&ingest_time);
        let mut conn = self.lock()?;

        let sequence = self.retry.run(|| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let exists = tx
                .query_row(
                    "SELECT 1 FROM runs WHERE instance_name = ?1 AND start_id = ?2",
                    params![instance_name, start_id],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if !exists {
                return Ok(None);
            }

            let sequence: i64 = tx.query_row(
                "SELECT COALESCE(MAX(sequence), 0) + 1 FROM log_entries WHERE instance_name = ?1 AND start_id = ?2",
                params![instance_name, start_id],
                |row| row.get(0),
            )?;
            tx.execute(
                r#"
                INSERT INTO log_entries
                (instance_name, start_id, sequence, source_timestamp, ingest_time, thread, level, message, stream)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
                params![
                    instance_name,
                    start_id,
                    sequence,
                    parsed.source_timestamp,
                    ingest_text,
                    parsed.thread,
                    parsed.level,
                    parsed.message,
                    stream.label(),
                ],
            )?;
            tx.commit()?;
            Ok(Some(sequence))
        })?;

        let sequence = sequence.ok_or_else(|| ManagerError::RunNotFound {
            name: instance_name.to_string(),
            start_id,
        })?;

        Ok(LogEntry {
            instance_name: instance_name.to_string(),
            start_id,
            sequence,
            source_timestamp: parsed.source_timestamp,
            ingest_time,
            thread: parsed.thread,
            level: parsed.level,
            message: parsed.message,
            stream,
        })
    }

    /// Filtered read of stored output.
    ///
    /// Runs come back most recent first; entries within a run ascend by sequence.
    pub fn query(&self, instance_name: &str, query: &LogQuery) -> Result<Vec<LogEntry>> {
        let mut sql = String::from(
            r#"
            SELECT instance_name, start_id, sequence, source_timestamp, ingest_time,
                   thread, level, message, stream
            FROM log_entries
            WHERE instance_name = ?
            "#,
        );
        let mut args: Vec<Value> = vec![Value::Text(instance_name.to_string())];

        match query.runs {
            RunSelector::Latest => {
                sql.push_str(
                    " AND start_id = (SELECT MAX(start_id) FROM runs WHERE instance_name = ?)",
                );
                args.push(Value::Text(instance_name.to_string()));
            }
            RunSelector::Exact(start_id) => {
                sql.push_str(" AND start_id = ?");
                args.push(Value::Integer(start_id));
            }
            RunSelector::Range { min, max } => {
                sql.push_str(" AND start_id BETWEEN ? AND ?");
                args.push(Value::Integer(min.min(max)));
                args.push(Value::Integer(min.max(max)));
            }
        }

        if let Some(since) = query.ingested_since {
            sql.push_str(" AND ingest_time >= ?");
            args.push(Value::Text(format_time(&since)));
        }
        if let Some(until) = query.ingested_until {
            sql.push_str(" AND ingest_time <= ?");
            args.push(Value::Text(format_time(&until)));
        }
        if let Some(since) = query.source_since {
            sql.push_str(" AND source_timestamp >= ?");
            args.push(Value::Text(since.format("%H:%M:%S").to_string()));
        }
        if let Some(until) = query.source_until {
            sql.push_str(" AND source_timestamp <= ?");
            args.push(Value::Text(until.format("%H:%M:%S").to_string()));
        }
        if let Some(ref pattern) = query.message_pattern {
            sql.push_str(" AND message LIKE ? ESCAPE '\\'");
            args.push(Value::Text(to_like_pattern(pattern)));
        }

        sql.push_str(" ORDER BY start_id DESC, sequence ASC");
        if let Some(limit) = query.limit {
            sql.push_str(" LIMIT ?");
            args.push(Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
        }

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), entry_from_row)?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }

        debug!(
            "Query for '{}' returned {} entries",
            instance_name,
            result.len()
        );
        Ok(result)
    }

    // === Retention ===

    /// Delete finished runs older than `retention_days`, with their output
    pub fn cleanup(&self, retention_days: u32) -> Result<usize> {
        if retention_days == 0 {
            return Ok(0); // Keep forever
        }

        let cutoff = Utc::now()
            - chrono::TimeDelta::try_days(retention_days as i64)
                .unwrap_or_else(|| chrono::TimeDelta::days(30));
        let cutoff = format_time(&cutoff);
        let mut conn = self.lock()?;

        let count = self.retry.run(|| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                r#"
                DELETE FROM log_entries WHERE (instance_name, start_id) IN (
                    SELECT instance_name, start_id FROM runs
                    WHERE start_time < ?1 AND ended_at IS NOT NULL
                )
                "#,
                params![cutoff],
            )?;
            let count = tx.execute(
                "DELETE FROM runs WHERE start_time < ?1 AND ended_at IS NOT NULL",
                params![cutoff],
            )?;
            tx.commit()?;
            Ok(count)
        })?;

        info!("Cleaned up {} old run(s)", count);
        Ok(count)
    }
}

const RUN_COLUMNS: &str =
    "SELECT instance_name, start_id, start_time, pid, status, ended_at, exit_code FROM runs";

fn ensure_updated(updated: usize, instance_name: &str, start_id: i64) -> Result<()> {
    if updated == 0 {
        return Err(ManagerError::RunNotFound {
            name: instance_name.to_string(),
            start_id,
        });
    }
    Ok(())
}

/// Fixed-width RFC 3339 so stored timestamps order lexically
fn format_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(column: usize, text: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                column,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

fn conversion_error(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        message.into(),
    )
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
    let start_time: String = row.get(2)?;
    let status: String = row.get(4)?;
    let ended_at: Option<String> = row.get(5)?;

    Ok(RunRecord {
        instance_name: row.get(0)?,
        start_id: row.get(1)?,
        start_time: parse_time(2, &start_time)?,
        pid: row.get(3)?,
        status: status.parse().map_err(|e| conversion_error(4, e))?,
        ended_at: ended_at.map(|t| parse_time(5, &t)).transpose()?,
        exit_code: row.get(6)?,
    })
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<LogEntry> {
    let ingest_time: String = row.get(4)?;
    let stream: String = row.get(8)?;

    Ok(LogEntry {
        instance_name: row.get(0)?,
        start_id: row.get(1)?,
        sequence: row.get(2)?,
        source_timestamp: row.get(3)?,
        ingest_time: parse_time(4, &ingest_time)?,
        thread: row.get(5)?,
        level: row.get(6)?,
        message: row.get(7)?,
        stream: StreamKind::from_label(&stream)
            .ok_or_else(|| conversion_error(8, format!("unknown stream: {}", stream)))?,
    })
}
