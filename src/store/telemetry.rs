//! Read side of the telemetry tables (application logs and the dead-letter
//! queue). Other services own these rows; the pipeline only reads them and
//! flips `processed` on dead-letter entries it has converted.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::params;
use selfheal_common::time::format_ts;
use selfheal_common::{DlqEntry, LogEntry};

use super::PipelineDb;

/// Rows read from a scan plus the number of rows that could not be decoded.
#[derive(Debug)]
pub struct ScanBatch<T> {
    pub rows: Vec<T>,
    pub skipped: usize,
}

impl<T> Default for ScanBatch<T> {
    fn default() -> Self {
        Self {
            rows: Vec::new(),
            skipped: 0,
        }
    }
}

impl PipelineDb {
    /// Failure log entries (`ERROR`/`FATAL` or HTTP 5xx) created at or after
    /// `since`, oldest first. Producer timestamps in any SQLite date format
    /// are compared by instant. Rows that fail to decode are counted in
    /// `skipped` and never abort the scan.
    pub fn scan_failed_logs(&self, since: DateTime<Utc>) -> Result<ScanBatch<LogEntry>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, service, level, message, stack, http_status, created_at
                 FROM app_logs
                 WHERE julianday(created_at) >= julianday(?1)
                   AND (UPPER(level) IN ('ERROR', 'FATAL') OR http_status >= 500)
                 ORDER BY julianday(created_at) ASC, id ASC",
            )
            .context("Failed to prepare log scan")?;
        let rows = stmt
            .query_map(params![format_ts(since)], |row| {
                Ok(LogEntry {
                    id: row.get(0)?,
                    service: row.get(1)?,
                    level: row.get(2)?,
                    message: row.get(3)?,
                    stack: row.get(4)?,
                    http_status: row.get(5)?,
                    created_at: row.get(6)?,
                })
            })
            .context("Failed to query logs")?;

        let mut batch = ScanBatch::default();
        for row in rows {
            match row {
                Ok(entry) => batch.rows.push(entry),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping malformed log row");
                    batch.skipped += 1;
                }
            }
        }
        Ok(batch)
    }

    /// Unprocessed dead-letter entries that failed at or after `since`.
    pub fn scan_unprocessed_dlq(&self, since: DateTime<Utc>) -> Result<ScanBatch<DlqEntry>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, topic, partition, offset, key, value, error_reason, failed_at, processed
                 FROM dead_letter_queue
                 WHERE processed = 0 AND julianday(failed_at) >= julianday(?1)
                 ORDER BY julianday(failed_at) ASC, id ASC",
            )
            .context("Failed to prepare DLQ scan")?;
        let rows = stmt
            .query_map(params![format_ts(since)], |row| {
                Ok(DlqEntry {
                    id: row.get(0)?,
                    topic: row.get(1)?,
                    partition: row.get(2)?,
                    offset: row.get(3)?,
                    key: row.get(4)?,
                    value: row.get(5)?,
                    error_reason: row.get(6)?,
                    failed_at: row.get(7)?,
                    processed: row.get(8)?,
                })
            })
            .context("Failed to query DLQ")?;

        let mut batch = ScanBatch::default();
        for row in rows {
            match row {
                Ok(entry) => batch.rows.push(entry),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping malformed DLQ row");
                    batch.skipped += 1;
                }
            }
        }
        Ok(batch)
    }

    pub fn mark_dlq_processed(&self, id: i64) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE dead_letter_queue SET processed = 1 WHERE id = ?1 AND processed = 0",
                params![id],
            )
            .context("Failed to mark DLQ entry processed")?;
        Ok(changed > 0)
    }

    /// Append a log entry. Producers normally write these directly; exposed
    /// for tests and local replay.
    pub fn insert_log_entry(
        &self,
        service: &str,
        level: &str,
        message: &str,
        stack: Option<&str>,
        http_status: Option<i64>,
        created_at: DateTime<Utc>,
    ) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO app_logs (service, level, message, stack, http_status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![service, level, message, stack, http_status, format_ts(created_at)],
            )
            .context("Failed to insert log entry")?;
        Ok(self.conn.last_insert_rowid())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn insert_dlq_entry(
        &self,
        topic: &str,
        partition: i64,
        offset: i64,
        key: Option<&str>,
        value: Option<&str>,
        error_reason: &str,
        failed_at: DateTime<Utc>,
    ) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO dead_letter_queue (topic, partition, offset, key, value, error_reason, failed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![topic, partition, offset, key, value, error_reason, format_ts(failed_at)],
            )
            .context("Failed to insert DLQ entry")?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Write an `app_logs` failure row with a producer-supplied timestamp text.
    #[cfg(test)]
    pub(crate) fn insert_log_at(&self, message: &str, created_at: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO app_logs (service, level, message, created_at) VALUES ('svc', 'ERROR', ?1, ?2)",
                params![message, created_at],
            )
            .context("Failed to insert log")?;
        Ok(())
    }

    /// Write a raw `app_logs` row, bypassing typing. Lets tests plant rows
    /// the scan cannot decode.
    #[cfg(test)]
    pub(crate) fn insert_raw_log(&self, http_status: &str, created_at: DateTime<Utc>) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO app_logs (service, level, message, http_status, created_at)
                 VALUES ('svc', 'ERROR', 'garbled', ?1, ?2)",
                params![http_status, format_ts(created_at)],
            )
            .context("Failed to insert raw log")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 1, h, m, 0).unwrap()
    }

    #[test]
    fn test_log_scan_filters_level_status_and_window() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        db.insert_log_entry("a", "ERROR", "in window", None, None, t(10, 55))?;
        db.insert_log_entry("a", "fatal", "lowercase fatal", None, None, t(10, 56))?;
        db.insert_log_entry("a", "INFO", "5xx", None, Some(503), t(10, 57))?;
        db.insert_log_entry("a", "WARN", "4xx only", None, Some(404), t(10, 58))?;
        db.insert_log_entry("a", "ERROR", "too old", None, None, t(10, 40))?;

        let batch = db.scan_failed_logs(t(11, 0) - Duration::minutes(10))?;
        let messages: Vec<_> = batch.rows.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["in window", "lowercase fatal", "5xx"]);
        assert_eq!(batch.skipped, 0);
        Ok(())
    }

    #[test]
    fn test_log_scan_skips_malformed_rows() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        db.insert_log_entry("a", "ERROR", "good", None, None, t(10, 55))?;
        db.insert_raw_log("five hundred", t(10, 56))?;
        db.insert_log_entry("b", "ERROR", "also good", None, None, t(10, 57))?;

        let batch = db.scan_failed_logs(t(10, 50))?;
        assert_eq!(batch.rows.len(), 2);
        assert_eq!(batch.skipped, 1);
        Ok(())
    }

    #[test]
    fn test_dlq_processed_entries_are_not_rescanned() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let id = db.insert_dlq_entry("orders", 0, 42, Some("k"), Some("{}"), "bad schema", t(10, 55))?;
        db.insert_dlq_entry("orders", 0, 43, None, None, "timeout", t(10, 30))?;

        let batch = db.scan_unprocessed_dlq(t(10, 50))?;
        assert_eq!(batch.rows.len(), 1);
        assert_eq!(batch.rows[0].offset, 42);

        assert!(db.mark_dlq_processed(id)?);
        assert!(!db.mark_dlq_processed(id)?);
        assert!(db.scan_unprocessed_dlq(t(10, 50))?.rows.is_empty());
        Ok(())
    }

    #[test]
    fn test_scan_compares_producer_timestamps_by_instant() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        db.insert_log_at("sqlite default format", "2026-04-01 10:55:00")?;
        db.insert_log_at("offset form", "2026-04-01T12:52:00+02:00")?;
        db.insert_log_at("before cutoff", "2026-04-01 10:45:00")?;

        let batch = db.scan_failed_logs(t(10, 50))?;
        let messages: Vec<_> = batch.rows.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["offset form", "sqlite default format"]);
        Ok(())
    }

    #[test]
    fn test_dlq_scan_accepts_sqlite_timestamps() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        db.conn.execute(
            "INSERT INTO dead_letter_queue (topic, partition, offset, error_reason, failed_at)
             VALUES ('orders', 0, 7, 'bad schema', '2026-04-01 10:55:00')",
            [],
        )?;
        assert_eq!(db.scan_unprocessed_dlq(t(10, 50))?.rows.len(), 1);
        Ok(())
    }
}
