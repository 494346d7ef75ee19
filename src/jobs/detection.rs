//! Bug scan: turn recent failure telemetry into bug records.
//!
//! Reads failed log entries and unprocessed dead-letter entries from the
//! trailing scan window, and inserts a bug for each one whose dedup key has
//! not been recorded inside the dedup window. Dead-letter entries are marked
//! processed once handled. No events are emitted here.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use selfheal_common::{DedupKey, DlqEntry, LogEntry, NewBug, Severity, truncate_title};
use serde::Serialize;

use crate::config::{DetectionConfig, JOB_BUG_SCAN};
use crate::errors::PipelineError;
use crate::scheduler::Job;
use crate::store::{DbHandle, DedupOutcome};

pub const MAX_TITLE_CHARS: usize = 160;

#[derive(Debug, Default, Clone, Serialize)]
pub struct ScanReport {
    pub logs: usize,
    pub dlq: usize,
    pub created: usize,
    pub duplicates: usize,
    pub skipped: usize,
}

impl fmt::Display for ScanReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "scanned {} log and {} DLQ entries: {} created, {} duplicate, {} skipped",
            self.logs, self.dlq, self.created, self.duplicates, self.skipped
        )
    }
}

/// A telemetry row normalised into what the registry needs.
struct Candidate {
    bug: NewBug,
    key: DedupKey,
    dlq_id: Option<i64>,
}

fn log_candidate(entry: LogEntry) -> Candidate {
    Candidate {
        key: DedupKey::for_log(&entry.service, &entry.message),
        bug: NewBug {
            title: truncate_title(&format!("{}: {}", entry.service, entry.message), MAX_TITLE_CHARS),
            severity: Severity::from_http_status(entry.http_status),
            service_name: entry.service,
            module: None,
            details: entry.message,
            log_excerpt: entry.stack,
            http_status: entry.http_status,
        },
        dlq_id: None,
    }
}

fn dlq_candidate(entry: DlqEntry) -> Candidate {
    let mut excerpt = format!("partition={} offset={}", entry.partition, entry.offset);
    if let Some(key) = &entry.key {
        excerpt.push_str(&format!(" key={}", key));
    }
    if let Some(value) = &entry.value {
        excerpt.push('\n');
        excerpt.push_str(value);
    }
    Candidate {
        key: DedupKey::for_dlq(&entry.topic, &entry.error_reason),
        bug: NewBug {
            service_name: entry.topic.clone(),
            module: Some(entry.topic.clone()),
            // DLQ rows carry no HTTP status
            severity: Severity::from_http_status(None),
            title: truncate_title(&format!("DLQ {}: {}", entry.topic, entry.error_reason), MAX_TITLE_CHARS),
            details: entry.error_reason,
            log_excerpt: Some(excerpt),
            http_status: None,
        },
        dlq_id: Some(entry.id),
    }
}

pub struct BugScanJob {
    db: DbHandle,
    settings: DetectionConfig,
    store_timeout: Duration,
}

impl BugScanJob {
    pub fn new(db: DbHandle, settings: DetectionConfig, store_timeout: Duration) -> Self {
        Self {
            db,
            settings,
            store_timeout,
        }
    }

    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<ScanReport, PipelineError> {
        let since = now - chrono::Duration::seconds(self.settings.scan_window_secs as i64);
        let (logs, dlq) = self
            .db
            .call_with_timeout("scan_telemetry", self.store_timeout, move |db| {
                Ok((db.scan_failed_logs(since)?, db.scan_unprocessed_dlq(since)?))
            })
            .await?;

        let mut report = ScanReport {
            logs: logs.rows.len(),
            dlq: dlq.rows.len(),
            skipped: logs.skipped + dlq.skipped,
            ..Default::default()
        };
        let candidates = logs
            .rows
            .into_iter()
            .map(log_candidate)
            .chain(dlq.rows.into_iter().map(dlq_candidate));

        for candidate in candidates {
            match self.record(candidate, now).await {
                Ok(DedupOutcome::Created(bug)) => {
                    tracing::info!(bug_code = %bug.bug_code, severity = bug.severity.as_str(), "bug recorded");
                    report.created += 1;
                }
                Ok(DedupOutcome::Duplicate { existing_code }) => {
                    tracing::debug!(existing = %existing_code, "duplicate within dedup window");
                    report.duplicates += 1;
                }
                Err(PipelineError::BugCodeExhausted { attempts }) => {
                    tracing::warn!(attempts, "could not allocate a bug code, skipping row");
                    report.skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(report)
    }

    async fn record(&self, candidate: Candidate, now: DateTime<Utc>) -> Result<DedupOutcome, PipelineError> {
        let window = chrono::Duration::seconds(self.settings.dedup_window_secs as i64);
        let max_code_attempts = self.settings.max_code_attempts;
        self.db
            .call_with_timeout("insert_bug", self.store_timeout, move |db| {
                let outcome =
                    db.insert_bug_deduped(&candidate.bug, &candidate.key, now, window, max_code_attempts)?;
                if let Some(id) = candidate.dlq_id {
                    db.mark_dlq_processed(id)?;
                }
                Ok(outcome)
            })
            .await
    }
}

#[async_trait]
impl Job for BugScanJob {
    fn name(&self) -> &str {
        JOB_BUG_SCAN
    }

    async fn run(&self) -> anyhow::Result<String> {
        Ok(self.run_at(Utc::now()).await?.to_string())
    }
}
