//! SQLite storage for job records
//!
//! Statements run on the blocking pool behind a short-held mutex, so callers on
//! the async runtime never block a worker thread on disk I/O.

pub mod migrations;

use anyhow::{Result, bail};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::Path;
use std::sync::Arc;

/// A job record stored in the database
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    pub rowid: i64,
    pub provider_peer_id: String,
    pub provider_job_id: String,
    /// Serialized request body
    pub input: String,
    /// Fixed at creation
    pub streaming: bool,
    /// Serialized response, or the JSON array of chunks when streaming
    pub output: Option<String>,
    pub balance_delta: Option<String>,
    pub public_payload: Option<String>,
    pub service_error: Option<String>,
    pub completed_at_sync: Option<i64>,
}

impl JobRecord {
    /// Completed or failed
    pub fn is_terminal(&self) -> bool {
        self.output.is_some() || self.service_error.is_some()
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            rowid: row.get(0)?,
            provider_peer_id: row.get(1)?,
            provider_job_id: row.get(2)?,
            input: row.get(3)?,
            streaming: row.get(4)?,
            output: row.get(5)?,
            balance_delta: row.get(6)?,
            public_payload: row.get(7)?,
            service_error: row.get(8)?,
            completed_at_sync: row.get(9)?,
        })
    }
}

/// Terminal fields written when a job completes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobCompletion {
    pub output: String,
    pub balance_delta: String,
    pub public_payload: String,
    pub completed_at_sync: i64,
}

const SELECT_COLUMNS: &str = "SELECT rowid, provider_peer_id, provider_job_id, input, streaming,
        output, balance_delta, public_payload, service_error, completed_at_sync
     FROM jobs";

/// SQLite store for job records
#[derive(Clone)]
pub struct JobStore {
    conn: Arc<Mutex<Connection>>,
}

impl JobStore {
    /// Open or create the database at the given path, migrating to the latest schema
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        Self::from_connection(conn)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(mut conn: Connection) -> Result<Self> {
        migrations::migrate_to(&mut conn, Some(migrations::latest_index()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            f(&conn)
        })
        .await?
    }

    /// Insert a pending job, returning its row id
    pub async fn insert_pending(
        &self,
        provider_peer_id: &str,
        provider_job_id: &str,
        input: &str,
        streaming: bool,
    ) -> Result<i64> {
        let peer_id = provider_peer_id.to_string();
        let job_id = provider_job_id.to_string();
        let input = input.to_string();

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO jobs (provider_peer_id, provider_job_id, input, streaming)
                 VALUES (?1, ?2, ?3, ?4)",
                params![peer_id, job_id, input, streaming],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    /// Get a job by row id
    pub async fn get(&self, rowid: i64) -> Result<Option<JobRecord>> {
        self.with_conn(move |conn| {
            let sql = format!("{} WHERE rowid = ?1", SELECT_COLUMNS);
            Ok(conn
                .query_row(&sql, [rowid], JobRecord::from_row)
                .optional()?)
        })
        .await
    }

    /// Get a job by its marketplace identifiers
    pub async fn find_by_external_id(
        &self,
        provider_peer_id: &str,
        provider_job_id: &str,
    ) -> Result<Option<JobRecord>> {
        let peer_id = provider_peer_id.to_string();
        let job_id = provider_job_id.to_string();

        self.with_conn(move |conn| {
            let sql = format!(
                "{} WHERE provider_peer_id = ?1 AND provider_job_id = ?2",
                SELECT_COLUMNS
            );
            Ok(conn
                .query_row(&sql, params![peer_id, job_id], JobRecord::from_row)
                .optional()?)
        })
        .await
    }

    /// Mark a pending job completed. Fails if the job is missing or already terminal.
    pub async fn complete(&self, rowid: i64, completion: JobCompletion) -> Result<()> {
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE jobs
                 SET output = ?1, balance_delta = ?2, public_payload = ?3, completed_at_sync = ?4
                 WHERE rowid = ?5 AND output IS NULL AND service_error IS NULL",
                params![
                    completion.output,
                    completion.balance_delta,
                    completion.public_payload,
                    completion.completed_at_sync,
                    rowid
                ],
            )?;
            if updated == 0 {
                bail!("Job #{} is missing or already terminal", rowid);
            }
            Ok(())
        })
        .await
    }

    /// Mark a pending job failed. Fails if the job is missing or already terminal.
    pub async fn fail(&self, rowid: i64, service_error: &str) -> Result<()> {
        let service_error = service_error.to_string();

        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE jobs SET service_error = ?1
                 WHERE rowid = ?2 AND output IS NULL AND service_error IS NULL",
                params![service_error, rowid],
            )?;
            if updated == 0 {
                bail!("Job #{} is missing or already terminal", rowid);
            }
            Ok(())
        })
        .await
    }
}
