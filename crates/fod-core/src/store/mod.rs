//! Task store.
//!
//! The authoritative state of every task lives in the relational store
//! shared with the file operations manager (FOM). The daemon owns the
//! `standalone_*` task and batch tables and the staging/status columns on
//! them; it reads (never writes) FOM's `transfer_tasks` / `deletion_tasks`
//! rows to resolve batch membership.
//!
//! # Status machine
//!
//! `new → (staging → staged)? → queued → active → {done, failed}`, with
//! `cancelled` reachable from any non-active, non-terminal state. The store
//! only provides the individual transitions; ordering is enforced by the
//! scheduler, pools, and workers, each of which owns a disjoint status
//! range.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};

use crate::gateway::OpResult;

/// Operation type, selecting one of the two task tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpType {
    /// File transfer between two endpoints.
    Transfer,
    /// File deletion at one endpoint.
    Deletion,
}

impl OpType {
    /// The task table owned by the daemon for this operation type.
    #[must_use]
    pub const fn table(self) -> &'static str {
        match self {
            Self::Transfer => "standalone_transfer_tasks",
            Self::Deletion => "standalone_deletion_tasks",
        }
    }
}

impl std::fmt::Display for OpType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transfer => write!(f, "transfer"),
            Self::Deletion => write!(f, "deletion"),
        }
    }
}

/// Task status, stored as text in the FOM interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Fresh row from FOM, not yet picked up.
    New,
    /// Tape recall issued, waiting for the file to come online.
    Staging,
    /// Tape recall complete, transfer can proceed.
    Staged,
    /// Submitted to a pool; cancellable until a worker claims it.
    Queued,
    /// A worker is executing the operation.
    Active,
    /// Terminal success.
    Done,
    /// Terminal failure.
    Failed,
    /// Terminal cancellation.
    Cancelled,
}

impl TaskStatus {
    /// Status string as stored in the database.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Staging => "staging",
            Self::Staged => "staged",
            Self::Queued => "queued",
            Self::Active => "active",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse a status string from the database.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "new" => Some(Self::New),
            "staging" => Some(Self::Staging),
            "staged" => Some(Self::Staged),
            "queued" => Some(Self::Queued),
            "active" => Some(Self::Active),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A deletion task ready for submission.
#[derive(Debug, Clone)]
pub struct DeletionWork {
    /// Task id (FOM-assigned, immutable).
    pub id: i64,
    /// PFN to remove.
    pub file: String,
    /// Destination site the deletion runs against.
    pub site: String,
}

/// A transfer task ready for submission.
#[derive(Debug, Clone)]
pub struct TransferWork {
    /// Task id (FOM-assigned, immutable).
    pub id: i64,
    /// Source PFN.
    pub source: String,
    /// Destination PFN.
    pub destination: String,
    /// Checksum algorithm; empty when no verification is requested.
    pub checksum_algo: String,
    /// Expected checksum value.
    pub checksum: String,
    /// Source site name.
    pub source_site: String,
    /// Destination site name.
    pub destination_site: String,
}

/// A staging task to poll.
#[derive(Debug, Clone)]
pub struct StagingWork {
    /// Task id.
    pub id: i64,
    /// Source PFN being recalled from tape.
    pub source: String,
    /// Source site name.
    pub source_site: String,
    /// Stage token of the owning batch.
    pub token: String,
}

/// A tape-sourced batch that has not been issued a recall yet.
#[derive(Debug, Clone)]
pub struct StageBatch {
    /// Batch id.
    pub batch_id: i64,
    /// Source site name.
    pub source_site: String,
    /// Member tasks as `(task id, source PFN)`.
    pub tasks: Vec<(i64, String)>,
}

/// Terminal columns of a task row, for inspection.
#[derive(Debug, Clone)]
pub struct TaskRow {
    /// Current status.
    pub status: TaskStatus,
    /// Recorded exit code, if terminal.
    pub exitcode: Option<i64>,
    /// Recorded message, if any.
    pub message: Option<String>,
    /// RFC 3339 start time, if recorded.
    pub start_time: Option<String>,
    /// RFC 3339 finish time, if recorded.
    pub finish_time: Option<String>,
}

/// Store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Underlying database error.
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    /// The connection mutex was poisoned.
    #[error("database connection lock poisoned")]
    LockPoisoned,

    /// A status column held an unknown value.
    #[error("unknown task status '{0}'")]
    BadStatus(String),
}

/// Handle to the task database.
///
/// Cloning shares the single underlying connection; all access is
/// serialized through its mutex, which is the daemon's entire concurrency
/// story for the database.
#[derive(Debug, Clone)]
pub struct TaskStore {
    conn: Arc<Mutex<Connection>>,
}

impl TaskStore {
    /// Wrap an existing connection.
    #[must_use]
    pub const fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Open the task database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(Self::new(Arc::new(Mutex::new(conn))))
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Create the task and batch tables.
    ///
    /// Provisioning helper for deployment tooling and tests; the running
    /// daemon never issues DDL.
    ///
    /// # Errors
    ///
    /// Returns an error if any statement fails.
    pub fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS standalone_transfer_tasks (
                id INTEGER PRIMARY KEY,
                source TEXT NOT NULL,
                destination TEXT NOT NULL,
                checksum_algo TEXT NOT NULL DEFAULT '',
                checksum TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'new',
                exitcode INTEGER,
                message TEXT,
                start_time TEXT,
                finish_time TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_transfer_tasks_status
                ON standalone_transfer_tasks(status);
            CREATE TABLE IF NOT EXISTS standalone_deletion_tasks (
                id INTEGER PRIMARY KEY,
                file TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'new',
                exitcode INTEGER,
                message TEXT,
                start_time TEXT,
                finish_time TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_deletion_tasks_status
                ON standalone_deletion_tasks(status);
            CREATE TABLE IF NOT EXISTS standalone_transfer_batches (
                batch_id INTEGER PRIMARY KEY,
                source_site TEXT NOT NULL,
                destination_site TEXT NOT NULL,
                mss_source INTEGER NOT NULL DEFAULT 0,
                stage_token TEXT
            );
            CREATE TABLE IF NOT EXISTS standalone_deletion_batches (
                batch_id INTEGER PRIMARY KEY,
                site TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS transfer_tasks (
                id INTEGER PRIMARY KEY,
                batch_id INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS deletion_tasks (
                id INTEGER PRIMARY KEY,
                batch_id INTEGER NOT NULL
            );",
        )?;
        Ok(())
    }

    /// Rewrite interrupted rows back to `new` on both task tables.
    ///
    /// Run once at startup (crash recovery) and once after the shutdown
    /// drain, so no row is ever left in `queued` or `active`.
    ///
    /// # Errors
    ///
    /// Returns an error if either update fails.
    pub fn recover_interrupted(&self) -> Result<(usize, usize), StoreError> {
        let conn = self.lock()?;
        let transfers = conn.execute(
            "UPDATE standalone_transfer_tasks SET status = 'new'
             WHERE status IN ('queued', 'active')",
            [],
        )?;
        let deletions = conn.execute(
            "UPDATE standalone_deletion_tasks SET status = 'new'
             WHERE status IN ('queued', 'active')",
            [],
        )?;
        Ok((transfers, deletions))
    }

    /// New deletion tasks with their destination site, ordered by site then
    /// id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn fetch_new_deletions(&self) -> Result<Vec<DeletionWork>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT q.id, q.file, b.site
             FROM standalone_deletion_tasks AS q
             JOIN deletion_tasks AS t ON t.id = q.id
             JOIN standalone_deletion_batches AS b ON b.batch_id = t.batch_id
             WHERE q.status = 'new'
             ORDER BY b.site, q.id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(DeletionWork {
                id: row.get(0)?,
                file: row.get(1)?,
                site: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Tape-sourced transfer batches with no recall issued yet, each with
    /// its member tasks.
    ///
    /// # Errors
    ///
    /// Returns an error if the queries fail.
    pub fn batches_awaiting_stage(&self) -> Result<Vec<StageBatch>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT batch_id, source_site
             FROM standalone_transfer_batches
             WHERE mss_source = 1 AND stage_token IS NULL
             ORDER BY batch_id",
        )?;
        let batches: Vec<(i64, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<_, _>>()?;

        let mut tasks_stmt = conn.prepare(
            "SELECT q.id, q.source
             FROM standalone_transfer_tasks AS q
             JOIN transfer_tasks AS t ON t.id = q.id
             WHERE t.batch_id = ?1 AND q.status = 'new'
             ORDER BY q.id",
        )?;

        let mut out = Vec::with_capacity(batches.len());
        for (batch_id, source_site) in batches {
            let tasks = tasks_stmt
                .query_map(params![batch_id], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<_, _>>()?;
            out.push(StageBatch {
                batch_id,
                source_site,
                tasks,
            });
        }
        Ok(out)
    }

    /// Record the stage token returned for a batch.
    ///
    /// Written even when the request failed (a null token) so the batch is
    /// never re-issued.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub fn set_stage_token(&self, batch_id: i64, token: Option<&str>) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE standalone_transfer_batches SET stage_token = ?1 WHERE batch_id = ?2",
            params![token, batch_id],
        )?;
        Ok(())
    }

    /// Move a transfer task into `staging`.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub fn mark_staging(&self, id: i64) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE standalone_transfer_tasks SET status = 'staging' WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    /// Fail a transfer task at staging-issue time.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub fn mark_stage_failed(&self, id: i64, message: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE standalone_transfer_tasks SET status = 'failed', message = ?1 WHERE id = ?2",
            params![message, id],
        )?;
        Ok(())
    }

    /// Move a transfer task from `staging` to `staged`.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub fn mark_staged(&self, id: i64) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE standalone_transfer_tasks SET status = 'staged' WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    /// Staging transfer tasks with their batch token, ordered by source
    /// site then id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn fetch_staging_transfers(&self) -> Result<Vec<StagingWork>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT q.id, q.source, b.source_site, b.stage_token
             FROM standalone_transfer_tasks AS q
             JOIN transfer_tasks AS t ON t.id = q.id
             JOIN standalone_transfer_batches AS b ON b.batch_id = t.batch_id
             WHERE q.status = 'staging' AND b.stage_token IS NOT NULL
             ORDER BY b.source_site, q.id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(StagingWork {
                id: row.get(0)?,
                source: row.get(1)?,
                source_site: row.get(2)?,
                token: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Runnable transfer tasks: `new` on a disk-sourced batch, or `staged`.
    /// Ordered by link then id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn fetch_runnable_transfers(&self) -> Result<Vec<TransferWork>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT q.id, q.source, q.destination, q.checksum_algo, q.checksum,
                    b.source_site, b.destination_site
             FROM standalone_transfer_tasks AS q
             JOIN transfer_tasks AS t ON t.id = q.id
             JOIN standalone_transfer_batches AS b ON b.batch_id = t.batch_id
             WHERE (q.status = 'new' AND b.mss_source = 0) OR q.status = 'staged'
             ORDER BY b.source_site, b.destination_site, q.id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(TransferWork {
                id: row.get(0)?,
                source: row.get(1)?,
                destination: row.get(2)?,
                checksum_algo: row.get(3)?,
                checksum: row.get(4)?,
                source_site: row.get(5)?,
                destination_site: row.get(6)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Ids currently in `queued` for one op type, ordered.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn queued_ids(&self, op: OpType) -> Result<Vec<i64>, StoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT id FROM {} WHERE status = 'queued' ORDER BY id",
            op.table()
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Move a task into `queued`.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub fn mark_queued(&self, op: OpType, id: i64) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let sql = format!("UPDATE {} SET status = 'queued' WHERE id = ?1", op.table());
        conn.execute(&sql, params![id])?;
        Ok(())
    }

    /// Move a task into `active` (worker claim).
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub fn mark_active(&self, op: OpType, id: i64) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let sql = format!("UPDATE {} SET status = 'active' WHERE id = ?1", op.table());
        conn.execute(&sql, params![id])?;
        Ok(())
    }

    /// Write the terminal row for a task.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub fn write_result(
        &self,
        op: OpType,
        id: i64,
        status: TaskStatus,
        result: &OpResult,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "UPDATE {} SET status = ?1, exitcode = ?2, message = ?3,
                           start_time = ?4, finish_time = ?5
             WHERE id = ?6",
            op.table()
        );
        conn.execute(
            &sql,
            params![
                status.as_str(),
                result.exit_code,
                result.message,
                rfc3339(result.start),
                rfc3339(result.finish),
                id
            ],
        )?;
        Ok(())
    }

    /// Read the status and terminal columns of a task row.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the status is unknown.
    pub fn task_row(&self, op: OpType, id: i64) -> Result<Option<TaskRow>, StoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT status, exitcode, message, start_time, finish_time
             FROM {} WHERE id = ?1",
            op.table()
        );
        let row = conn
            .query_row(&sql, params![id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            })
            .optional()?;

        match row {
            None => Ok(None),
            Some((raw, exitcode, message, start_time, finish_time)) => {
                let status = TaskStatus::parse(&raw).ok_or(StoreError::BadStatus(raw))?;
                Ok(Some(TaskRow {
                    status,
                    exitcode,
                    message,
                    start_time,
                    finish_time,
                }))
            }
        }
    }

    /// Read the stage token column of a batch.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn stage_token(&self, batch_id: i64) -> Result<Option<Option<String>>, StoreError> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                "SELECT stage_token FROM standalone_transfer_batches WHERE batch_id = ?1",
                params![batch_id],
                |row| row.get(0),
            )
            .optional()?)
    }
}

fn rfc3339(unix_secs: Option<i64>) -> Option<String> {
    unix_secs
        .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
        .map(|dt| dt.to_rfc3339())
}
