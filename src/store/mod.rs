//! Relational store for the pipeline: telemetry, bug registry, fix
//! suggestions, outbox and scheduler audit log.
//!
//! `PipelineDb` owns a single SQLite connection and exposes synchronous
//! operations. `DbHandle` makes it usable from async code by running every
//! closure on tokio's blocking pool, optionally bounded by a timeout.
//!
//! Operations that need "now" take it as an argument so that the sliding
//! windows used by detection and triage are deterministic under test.

mod bugs;
mod cron_log;
mod fixes;
mod outbox;
mod telemetry;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::Connection;

use crate::errors::PipelineError;

pub use bugs::{BugFilter, DedupOutcome};
pub use fixes::FixFailure;
pub use outbox::insert_outbox_event;
pub use telemetry::ScanBatch;

/// Async-safe handle to the pipeline database.
///
/// Wraps `PipelineDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<PipelineDb>>,
}

impl DbHandle {
    pub fn new(db: PipelineDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&PipelineDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Like `call`, but gives up after `timeout` and classifies the failure.
    ///
    /// Domain errors raised inside `f` (not found, invalid transition, ...)
    /// come back as themselves; anything else is a `Database` error.
    /// A timed-out closure still runs to completion on the blocking pool.
    pub async fn call_with_timeout<F, R>(
        &self,
        operation: &str,
        timeout: Duration,
        f: F,
    ) -> Result<R, PipelineError>
    where
        F: FnOnce(&PipelineDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        match tokio::time::timeout(timeout, self.call(f)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(classify(e)),
            Err(_) => Err(PipelineError::StoreTimeout {
                operation: operation.to_string(),
                timeout_secs: timeout.as_secs(),
            }),
        }
    }

    /// Acquire the database mutex synchronously. Used for startup
    /// initialization and tests; never from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, PipelineDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

fn classify(err: anyhow::Error) -> PipelineError {
    match err.downcast::<PipelineError>() {
        Ok(domain) => domain,
        Err(other) => PipelineError::Database(other),
    }
}

pub struct PipelineDb {
    conn: Connection,
}

impl PipelineDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("Failed to set busy timeout")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS app_logs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    service TEXT NOT NULL,
                    level TEXT NOT NULL,
                    message TEXT NOT NULL,
                    stack TEXT,
                    http_status INTEGER,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS dead_letter_queue (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    topic TEXT NOT NULL,
                    partition INTEGER NOT NULL DEFAULT 0,
                    offset INTEGER NOT NULL DEFAULT 0,
                    key TEXT,
                    value TEXT,
                    error_reason TEXT NOT NULL,
                    failed_at TEXT NOT NULL,
                    processed INTEGER NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS bug_records (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    bug_code TEXT NOT NULL UNIQUE,
                    service_name TEXT NOT NULL,
                    module TEXT,
                    severity TEXT NOT NULL,
                    title TEXT NOT NULL,
                    details TEXT NOT NULL,
                    log_excerpt TEXT,
                    http_status INTEGER,
                    status TEXT NOT NULL DEFAULT 'open',
                    ai_analysis TEXT,
                    dedup_key TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS fix_suggestions (
                    id TEXT PRIMARY KEY,
                    bug_id INTEGER NOT NULL REFERENCES bug_records(id),
                    diff_patch TEXT NOT NULL,
                    confidence REAL NOT NULL DEFAULT 0,
                    approved INTEGER NOT NULL DEFAULT 0,
                    executed INTEGER NOT NULL DEFAULT 0,
                    attempts INTEGER NOT NULL DEFAULT 0,
                    last_error TEXT,
                    needs_manual INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS outbox_events (
                    id TEXT PRIMARY KEY,
                    aggregate_type TEXT NOT NULL,
                    aggregate_id TEXT NOT NULL,
                    event_type TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    published INTEGER NOT NULL DEFAULT 0,
                    attempts INTEGER NOT NULL DEFAULT 0,
                    last_error TEXT,
                    parked INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    published_at TEXT
                );

                CREATE TABLE IF NOT EXISTS cron_execution_logs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    job_name TEXT NOT NULL,
                    status TEXT NOT NULL,
                    message TEXT,
                    duration_ms INTEGER NOT NULL DEFAULT 0,
                    executed_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_app_logs_created ON app_logs(created_at);
                CREATE INDEX IF NOT EXISTS idx_dlq_pending ON dead_letter_queue(processed, failed_at);
                CREATE INDEX IF NOT EXISTS idx_bugs_dedup ON bug_records(dedup_key, created_at);
                CREATE INDEX IF NOT EXISTS idx_bugs_triage ON bug_records(status, created_at);
                CREATE INDEX IF NOT EXISTS idx_fixes_pending ON fix_suggestions(approved, executed);
                CREATE INDEX IF NOT EXISTS idx_outbox_pending ON outbox_events(published, created_at);
                CREATE INDEX IF NOT EXISTS idx_cron_job ON cron_execution_logs(job_name, executed_at);
                ",
            )
            .context("Failed to create tables")?;

        // Additive: databases created before outbox parking existed.
        match self.conn.execute(
            "ALTER TABLE outbox_events ADD COLUMN parked INTEGER NOT NULL DEFAULT 0",
            [],
        ) {
            Ok(_) => {}
            Err(e) if e.to_string().contains("duplicate column") => {}
            Err(e) => return Err(anyhow::anyhow!("Failed to add parked column: {}", e)),
        }
        Ok(())
    }

    /// Backlog counts that make a stuck pipeline visible.
    pub fn pipeline_stats(&self) -> Result<PipelineStats> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM bug_records GROUP BY status ORDER BY status")
            .context("Failed to prepare bug status counts")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .context("Failed to query bug status counts")?;
        let mut bugs_by_status = std::collections::BTreeMap::new();
        for row in rows {
            let (status, count) = row.context("Failed to read bug status count")?;
            bugs_by_status.insert(status, count);
        }

        let count = |sql: &str| -> Result<i64> {
            self.conn
                .query_row(sql, [], |row| row.get(0))
                .with_context(|| format!("Failed to run count: {}", sql))
        };

        Ok(PipelineStats {
            bugs_by_status,
            unpublished_events: count("SELECT COUNT(*) FROM outbox_events WHERE published = 0 AND parked = 0")?,
            parked_events: count("SELECT COUNT(*) FROM outbox_events WHERE parked = 1")?,
            pending_fixes: count(
                "SELECT COUNT(*) FROM fix_suggestions WHERE approved = 1 AND executed = 0 AND needs_manual = 0",
            )?,
            escalated_fixes: count("SELECT COUNT(*) FROM fix_suggestions WHERE needs_manual = 1")?,
            unprocessed_dlq: count("SELECT COUNT(*) FROM dead_letter_queue WHERE processed = 0")?,
        })
    }
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct PipelineStats {
    pub bugs_by_status: std::collections::BTreeMap<String, i64>,
    pub unpublished_events: i64,
    /// Undecodable events set aside by the publisher.
    pub parked_events: i64,
    pub pending_fixes: i64,
    pub escalated_fixes: i64,
    pub unprocessed_dlq: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_database_and_run_migrations() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;

        let table_count: i32 = db.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN
             ('app_logs', 'dead_letter_queue', 'bug_records', 'fix_suggestions', 'outbox_events', 'cron_execution_logs')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(table_count, 6, "Expected 6 tables to exist");
        Ok(())
    }

    #[test]
    fn test_migrations_are_idempotent() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        db.run_migrations()?;
        db.run_migrations()?;
        Ok(())
    }

    #[test]
    fn test_file_backed_database_persists() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("pipeline.db");
        {
            let db = PipelineDb::new(&path)?;
            db.record_cron_execution(
                "bug-scan",
                selfheal_common::CronStatus::Success,
                None,
                3,
                "2026-01-01T00:00:00.000Z",
            )?;
        }
        let db = PipelineDb::new(&path)?;
        assert_eq!(db.list_cron_logs(None, 10)?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_empty_stats() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let stats = db.pipeline_stats()?;
        assert!(stats.bugs_by_status.is_empty());
        assert_eq!(stats.unpublished_events, 0);
        assert_eq!(stats.pending_fixes, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_call_with_timeout_returns_domain_errors() {
        let handle = DbHandle::new(PipelineDb::new_in_memory().unwrap());
        let err = handle
            .call_with_timeout("get_bug", Duration::from_secs(5), |db| {
                db.require_bug(999).map(|_| ())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::BugNotFound { id: 999 }));
    }

    #[tokio::test]
    async fn test_call_with_timeout_reports_timeout() {
        let handle = DbHandle::new(PipelineDb::new_in_memory().unwrap());
        let err = handle
            .call_with_timeout("slow", Duration::from_millis(20), |_db| {
                std::thread::sleep(Duration::from_millis(200));
                Ok(())
            })
            .await
            .unwrap_err();
        match err {
            PipelineError::StoreTimeout { operation, .. } => assert_eq!(operation, "slow"),
            other => panic!("Expected StoreTimeout, got {:?}", other),
        }
    }
}
