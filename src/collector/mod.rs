//! Ingestion gateway: turns failure lines from a service log into bug
//! reports for the core API.
//!
//! Lines are JSON objects `{service, level, message, stack?, http_status?,
//! module?}`. Only failures (same predicate as the bug scan) are reported.
//! A local TTL cache keyed like the store's dedup key keeps repeats inside
//! the window off the wire; a key is cached only once the core API has
//! accepted the report, so a failed post is retried on the next occurrence.

mod source;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use selfheal_common::{DedupKey, IngestBugRequest, Severity, is_failure, truncate_title};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::clients::BugIngest;
use crate::config::CollectorConfig;

pub use source::FileTailSource;

const MAX_TITLE_CHARS: usize = 160;

/// One line of service log output.
#[derive(Debug, Clone, Deserialize)]
pub struct LogLine {
    pub service: String,
    pub level: String,
    pub message: String,
    #[serde(default)]
    pub stack: Option<String>,
    #[serde(default)]
    pub http_status: Option<i64>,
    #[serde(default)]
    pub module: Option<String>,
}

impl LogLine {
    /// The bug report for this line, or `None` if it is not a failure.
    pub fn into_report(self) -> Option<IngestBugRequest> {
        if !is_failure(&self.level, self.http_status) || self.service.trim().is_empty() {
            return None;
        }
        Some(IngestBugRequest {
            title: truncate_title(&format!("{}: {}", self.service, self.message), MAX_TITLE_CHARS),
            severity: Severity::from_http_status(self.http_status),
            service_name: self.service,
            module: self.module,
            details: self.message,
            log_excerpt: self.stack,
            http_status: self.http_status,
        })
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct CollectorStats {
    pub lines: usize,
    pub malformed: usize,
    pub ignored: usize,
    /// Suppressed by the local cache.
    pub cached: usize,
    pub submitted: usize,
    /// Accepted by the core API but matched an existing bug.
    pub duplicates: usize,
    pub failed: usize,
}

impl CollectorStats {
    fn absorb(&mut self, other: &CollectorStats) {
        self.lines += other.lines;
        self.malformed += other.malformed;
        self.ignored += other.ignored;
        self.cached += other.cached;
        self.submitted += other.submitted;
        self.duplicates += other.duplicates;
        self.failed += other.failed;
    }
}

impl fmt::Display for CollectorStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} lines: {} submitted ({} duplicates), {} cached, {} ignored, {} malformed, {} failed",
            self.lines, self.submitted, self.duplicates, self.cached, self.ignored, self.malformed, self.failed
        )
    }
}

pub struct Collector {
    ingest: Arc<dyn BugIngest>,
    seen: Cache<DedupKey, ()>,
}

impl Collector {
    pub fn new(ingest: Arc<dyn BugIngest>, ttl: Duration, capacity: u64) -> Self {
        Self {
            ingest,
            seen: Cache::builder().max_capacity(capacity).time_to_live(ttl).build(),
        }
    }

    pub fn from_config(ingest: Arc<dyn BugIngest>, config: &CollectorConfig) -> Self {
        Self::new(
            ingest,
            Duration::from_secs(config.dedup_ttl_secs),
            config.dedup_capacity,
        )
    }

    /// Parse, filter, dedup and submit a batch of raw lines.
    pub async fn process_lines(&self, lines: &[String]) -> CollectorStats {
        let mut stats = CollectorStats {
            lines: lines.len(),
            ..Default::default()
        };
        for raw in lines {
            let line: LogLine = match serde_json::from_str(raw) {
                Ok(line) => line,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping malformed log line");
                    stats.malformed += 1;
                    continue;
                }
            };
            let Some(report) = line.into_report() else {
                stats.ignored += 1;
                continue;
            };
            let key = DedupKey::for_log(&report.service_name, &report.details);
            if self.seen.contains_key(&key) {
                stats.cached += 1;
                continue;
            }
            match self.ingest.submit(&report).await {
                Ok(response) => {
                    if response.created {
                        if let Some(bug) = &response.bug {
                            tracing::info!(bug_code = %bug.bug_code, key = %key, "bug reported");
                        }
                    } else {
                        stats.duplicates += 1;
                    }
                    stats.submitted += 1;
                    self.seen.insert(key, ());
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %format!("{:#}", e), "bug report failed, will retry");
                    stats.failed += 1;
                }
            }
        }
        stats
    }

    /// Poll `source` every `interval` until `shutdown` fires. Read errors are
    /// logged and retried on the next poll.
    pub async fn run(
        &self,
        mut source: FileTailSource,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> CollectorStats {
        tracing::info!(path = %source.path().display(), "collector started");
        let mut total = CollectorStats::default();
        loop {
            match source.poll() {
                Ok(lines) if !lines.is_empty() => {
                    let stats = self.process_lines(&lines).await;
                    tracing::debug!("{}", stats);
                    total.absorb(&stats);
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %format!("{:#}", e), "failed to read log source"),
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        tracing::info!("collector stopped: {}", total);
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::io::Write;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Remembers what it was sent; reports a duplicate for details seen before.
    #[derive(Default)]
    struct FakeIngest {
        sent: Mutex<Vec<IngestBugRequest>>,
        down: AtomicBool,
    }

    #[async_trait]
    impl BugIngest for FakeIngest {
        async fn submit(&self, report: &IngestBugRequest) -> anyhow::Result<selfheal_common::IngestBugResponse> {
            if self.down.load(Ordering::SeqCst) {
                anyhow::bail!("connection refused");
            }
            let mut sent = self.sent.lock().unwrap();
            let seen = sent.iter().any(|r| r.details == report.details);
            sent.push(report.clone());
            Ok(selfheal_common::IngestBugResponse {
                created: !seen,
                bug: None,
                existing_code: seen.then(|| "BUG-20260401-abcd".to_string()),
            })
        }
    }

    fn collector(ingest: Arc<FakeIngest>) -> Collector {
        Collector::new(ingest, Duration::from_secs(3600), 100)
    }

    fn line(level: &str, message: &str, status: Option<i64>) -> String {
        serde_json::json!({
            "service": "orders",
            "level": level,
            "message": message,
            "stack": "at handler.rs:10",
            "http_status": status,
        })
        .to_string()
    }

    #[test]
    fn test_report_fields_from_line() {
        let parsed: LogLine = serde_json::from_str(&line("ERROR", "db down", Some(503))).unwrap();
        let report = parsed.into_report().unwrap();
        assert_eq!(report.service_name, "orders");
        assert_eq!(report.severity, Severity::High);
        assert_eq!(report.title, "orders: db down");
        assert_eq!(report.details, "db down");
        assert_eq!(report.log_excerpt.as_deref(), Some("at handler.rs:10"));
    }

    #[test]
    fn test_non_failures_produce_no_report() {
        let parsed: LogLine = serde_json::from_str(&line("INFO", "started", Some(200))).unwrap();
        assert!(parsed.into_report().is_none());
        let parsed: LogLine = serde_json::from_str(&line("WARN", "not found", Some(404))).unwrap();
        assert!(parsed.into_report().is_none());
    }

    #[tokio::test]
    async fn test_repeats_are_cached_after_first_submit() {
        let ingest = Arc::new(FakeIngest::default());
        let collector = collector(ingest.clone());
        let lines = vec![
            line("ERROR", "db down", None),
            line("ERROR", "db down", None),
            line("INFO", "healthy", None),
            "not json".to_string(),
            line("FATAL", "oom", None),
        ];

        let stats = collector.process_lines(&lines).await;
        assert_eq!(stats.submitted, 2);
        assert_eq!(stats.cached, 1);
        assert_eq!(stats.ignored, 1);
        assert_eq!(stats.malformed, 1);
        assert_eq!(ingest.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_submit_is_retried() {
        let ingest = Arc::new(FakeIngest::default());
        ingest.down.store(true, Ordering::SeqCst);
        let collector = collector(ingest.clone());
        let lines = vec![line("ERROR", "db down", None)];

        assert_eq!(collector.process_lines(&lines).await.failed, 1);
        ingest.down.store(false, Ordering::SeqCst);
        assert_eq!(collector.process_lines(&lines).await.submitted, 1);
        assert_eq!(ingest.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_server_side_duplicate_is_counted_and_cached() {
        let ingest = Arc::new(FakeIngest::default());
        ingest.sent.lock().unwrap().push(IngestBugRequest {
            service_name: "orders".into(),
            module: None,
            severity: Severity::Low,
            title: "earlier".into(),
            details: "db down".into(),
            log_excerpt: None,
            http_status: None,
        });
        let collector = collector(ingest.clone());

        let stats = collector.process_lines(&[line("ERROR", "db down", None)]).await;
        assert_eq!(stats.duplicates, 1);
        let again = collector.process_lines(&[line("ERROR", "db down", None)]).await;
        assert_eq!(again.cached, 1);
    }

    #[tokio::test]
    async fn test_run_tails_file_until_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orders.log");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "{}", line("ERROR", "db down", Some(500))).unwrap();
        writeln!(f, "{}", line("ERROR", "timeout", Some(504))).unwrap();
        drop(f);

        let ingest = Arc::new(FakeIngest::default());
        let collector = Arc::new(collector(ingest.clone()));
        let shutdown = CancellationToken::new();
        let task = {
            let collector = collector.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                collector
                    .run(FileTailSource::new(path), Duration::from_millis(10), shutdown)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();
        let total = task.await.unwrap();
        assert_eq!(total.submitted, 2);
        assert_eq!(ingest.sent.lock().unwrap().len(), 2);
    }
}
