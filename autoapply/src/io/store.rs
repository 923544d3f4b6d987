//! Durable job queue backed by SQLite.
//!
//! Every worker opens its own connection. Claiming is a single conditional
//! `UPDATE … RETURNING` inside an immediate transaction, so two workers can
//! never receive the same job.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::types::{Job, JobStatus};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
  id          INTEGER PRIMARY KEY AUTOINCREMENT,
  url         TEXT NOT NULL UNIQUE,
  title       TEXT NOT NULL DEFAULT '',
  company     TEXT NOT NULL DEFAULT '',
  status      TEXT NOT NULL DEFAULT 'PENDING'
              CHECK (status IN ('PENDING', 'IN_PROGRESS', 'SUCCESS', 'FAILED')),
  log         TEXT NOT NULL DEFAULT '',
  created_at  TEXT NOT NULL,
  updated_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status, created_at, id);
"#;

const JOB_COLUMNS: &str = "id, url, title, company, status, log, created_at, updated_at";

/// Appends `?2` to `log`, newline-separated.
const APPEND_LOG_SQL: &str = "CASE WHEN log = '' THEN ?2 ELSE log || char(10) || ?2 END";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("create store directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("job {id}: refusing to set non-terminal status {to}")]
    InvalidTransition { id: i64, to: JobStatus },
    #[error("job {0} not found")]
    NotFound(i64),
    #[error("job {id}: corrupt row: {reason}")]
    Corrupt { id: i64, reason: String },
}

/// Per-status job counts for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub in_progress: u64,
    pub success: u64,
    pub failed: u64,
}

#[derive(Debug)]
pub struct JobStore {
    conn: Connection,
    path: Option<PathBuf>,
}

struct JobRow {
    id: i64,
    url: String,
    title: String,
    company: String,
    status: String,
    log: String,
    created_at: String,
    updated_at: String,
}

fn read_job_row(row: &rusqlite::Row<'_>) -> Result<JobRow, rusqlite::Error> {
    Ok(JobRow {
        id: row.get(0)?,
        url: row.get(1)?,
        title: row.get(2)?,
        company: row.get(3)?,
        status: row.get(4)?,
        log: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let id = row.id;
        let corrupt = |reason: String| StoreError::Corrupt { id, reason };
        Ok(Job {
            id,
            url: row.url,
            title: row.title,
            company: row.company,
            status: row.status.parse().map_err(corrupt)?,
            log: row.log,
            created_at: parse_ts(&row.created_at).map_err(corrupt)?,
            updated_at: parse_ts(&row.updated_at).map_err(corrupt)?,
        })
    }
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| format!("bad timestamp '{raw}': {err}"))
}

/// Fixed-width UTC timestamps sort lexicographically in time order.
fn now_ts() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl JobStore {
    /// Open (creating if needed) the database at `path`.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!(journal_mode = %mode, "opened job store");
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn, path: None })
    }

    /// Database file, or `None` for an in-memory store.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Queue a URL. Returns `false` when the URL is already known.
    #[instrument(skip_all, fields(url = %url))]
    pub fn enqueue(&mut self, url: &str, title: &str, company: &str) -> Result<bool, StoreError> {
        let now = now_ts();
        let changed = self.conn.execute(
            "INSERT OR IGNORE INTO jobs(url, title, company, status, log, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'PENDING', '', ?4, ?4)",
            params![url.trim(), title.trim(), company.trim(), now],
        )?;
        let added = changed == 1;
        debug!(added, "enqueue");
        Ok(added)
    }

    /// Atomically move the oldest PENDING job to IN_PROGRESS and return it.
    ///
    /// `Ok(None)` means the queue is empty; errors are never folded into it.
    #[instrument(skip_all)]
    pub fn claim_next(&mut self) -> Result<Option<Job>, StoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let row = tx
            .query_row(
                &format!(
                    "UPDATE jobs SET status = 'IN_PROGRESS', updated_at = ?1
                     WHERE id = (
                       SELECT id FROM jobs WHERE status = 'PENDING'
                       ORDER BY created_at ASC, id ASC LIMIT 1
                     ) AND status = 'PENDING'
                     RETURNING {JOB_COLUMNS}"
                ),
                params![now_ts()],
                read_job_row,
            )
            .optional()?;
        tx.commit()?;
        let job = row.map(Job::try_from).transpose()?;
        if let Some(job) = &job {
            info!(job_id = job.id, url = %job.url, "claimed job");
        }
        Ok(job)
    }

    /// Set a terminal status on an IN_PROGRESS job and append `log_line`.
    ///
    /// Returns `false` when the job is no longer IN_PROGRESS (e.g. aborted).
    #[instrument(skip_all, fields(job_id = id, status = %status))]
    pub fn set_status(
        &mut self,
        id: i64,
        status: JobStatus,
        log_line: &str,
    ) -> Result<bool, StoreError> {
        if !status.is_terminal() {
            return Err(StoreError::InvalidTransition { id, to: status });
        }
        let changed = self.conn.execute(
            &format!(
                "UPDATE jobs SET status = ?3, log = {APPEND_LOG_SQL}, updated_at = ?4
                 WHERE id = ?1 AND status = 'IN_PROGRESS'"
            ),
            params![id, log_line, status.as_str(), now_ts()],
        )?;
        if changed == 0 {
            let current = self.status(id)?.ok_or(StoreError::NotFound(id))?;
            warn!(current = %current, "status change refused; job is not in progress");
            return Ok(false);
        }
        Ok(true)
    }

    /// Append a progress line without touching the status.
    pub fn append_log(&mut self, id: i64, line: &str) -> Result<(), StoreError> {
        let changed = self.conn.execute(
            &format!("UPDATE jobs SET log = {APPEND_LOG_SQL}, updated_at = ?3 WHERE id = ?1"),
            params![id, line, now_ts()],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    /// Operator abort: fail a PENDING or IN_PROGRESS job.
    #[instrument(skip_all, fields(job_id = id))]
    pub fn abort(&mut self, id: i64, reason: &str) -> Result<bool, StoreError> {
        let line = format!("aborted by operator: {reason}");
        let changed = self.conn.execute(
            &format!(
                "UPDATE jobs SET status = 'FAILED', log = {APPEND_LOG_SQL}, updated_at = ?3
                 WHERE id = ?1 AND status IN ('PENDING', 'IN_PROGRESS')"
            ),
            params![id, line, now_ts()],
        )?;
        if changed == 0 {
            self.status(id)?.ok_or(StoreError::NotFound(id))?;
            return Ok(false);
        }
        info!("job aborted");
        Ok(true)
    }

    pub fn get(&self, id: i64) -> Result<Option<Job>, StoreError> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id],
                read_job_row,
            )
            .optional()?;
        row.map(Job::try_from).transpose()
    }

    pub fn status(&self, id: i64) -> Result<Option<JobStatus>, StoreError> {
        let raw: Option<String> = self
            .conn
            .query_row("SELECT status FROM jobs WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()?;
        raw.map(|s| s.parse().map_err(|reason| StoreError::Corrupt { id, reason }))
            .transpose()
    }

    /// All jobs, most recently updated first.
    pub fn list_all(&self) -> Result<Vec<Job>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs ORDER BY updated_at DESC, id DESC"
        ))?;
        let rows = stmt.query_map([], read_job_row)?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(Job::try_from(row?)?);
        }
        Ok(jobs)
    }

    pub fn counts(&self) -> Result<StatusCounts, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        let mut counts = StatusCounts::default();
        for row in rows {
            let (status, n) = row?;
            let n = u64::try_from(n).unwrap_or_default();
            match status.parse::<JobStatus>() {
                Ok(JobStatus::Pending) => counts.pending = n,
                Ok(JobStatus::InProgress) => counts.in_progress = n,
                Ok(JobStatus::Success) => counts.success = n,
                Ok(JobStatus::Failed) => counts.failed = n,
                Err(reason) => warn!(%reason, "skipping unknown status in counts"),
            }
        }
        Ok(counts)
    }
}
