use std::str::FromStr;

use anyhow::{Context, Result};
use rusqlite::params;
use selfheal_common::{CronExecutionLog, CronStatus};

use super::PipelineDb;

impl PipelineDb {
    pub fn record_cron_execution(
        &self,
        job_name: &str,
        status: CronStatus,
        message: Option<&str>,
        duration_ms: i64,
        executed_at: &str,
    ) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO cron_execution_logs (job_name, status, message, duration_ms, executed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![job_name, status.as_str(), message, duration_ms, executed_at],
            )
            .context("Failed to record cron execution")?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Newest first, optionally for one job.
    pub fn list_cron_logs(&self, job_name: Option<&str>, limit: i64) -> Result<Vec<CronExecutionLog>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, job_name, status, message, duration_ms, executed_at
                 FROM cron_execution_logs
                 WHERE (?1 IS NULL OR job_name = ?1)
                 ORDER BY executed_at DESC, id DESC LIMIT ?2",
            )
            .context("Failed to prepare list_cron_logs")?;
        let rows = stmt
            .query_map(params![job_name, limit], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .context("Failed to query cron logs")?;
        let mut logs = Vec::new();
        for row in rows {
            let (id, job_name, status, message, duration_ms, executed_at) =
                row.context("Failed to read cron log row")?;
            logs.push(CronExecutionLog {
                id,
                job_name,
                status: CronStatus::from_str(&status).map_err(|e| anyhow::anyhow!(e))?,
                message,
                duration_ms,
                executed_at,
            });
        }
        Ok(logs)
    }
}
