//! AI fix check: hand the most pressing open bugs to the analyzer.
//!
//! Candidates are open, unanalysed bugs from the backlog window, highest
//! severity first and oldest first. A successful analysis is committed in
//! one store transaction: the analysis text, the move to `analyzing` with its
//! outbox event, and any proposed patches as unapproved fix suggestions. A
//! bug whose analysis fails (or whose write fails) stays `open` and is
//! selected again on a later tick.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::clients::{Analysis, Analyzer};
use crate::config::{JOB_AI_FIX_CHECK, TriageConfig};
use crate::errors::PipelineError;
use crate::scheduler::Job;
use crate::store::DbHandle;

#[derive(Debug, Default, Clone, Serialize)]
pub struct TriageReport {
    pub selected: usize,
    pub analyzed: usize,
    pub failed: usize,
    pub suggestions: usize,
}

impl fmt::Display for TriageReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "selected {}: {} analyzed, {} failed, {} suggestions",
            self.selected, self.analyzed, self.failed, self.suggestions
        )
    }
}

pub struct AiFixCheckJob {
    db: DbHandle,
    analyzer: Arc<dyn Analyzer>,
    settings: TriageConfig,
    store_timeout: Duration,
}

impl AiFixCheckJob {
    pub fn new(db: DbHandle, analyzer: Arc<dyn Analyzer>, settings: TriageConfig, store_timeout: Duration) -> Self {
        Self {
            db,
            analyzer,
            settings,
            store_timeout,
        }
    }

    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<TriageReport, PipelineError> {
        let backlog = chrono::Duration::hours(self.settings.backlog_hours);
        let limit = self.settings.batch_size;
        let candidates = self
            .db
            .call_with_timeout("select_triage_candidates", self.store_timeout, move |db| {
                db.select_triage_candidates(now, backlog, limit)
            })
            .await?;

        let mut report = TriageReport {
            selected: candidates.len(),
            ..Default::default()
        };
        let request_timeout = Duration::from_secs(self.settings.request_timeout_secs);

        for bug in candidates {
            let analysis = match tokio::time::timeout(request_timeout, self.analyzer.analyze(&bug)).await {
                Ok(Ok(analysis)) => analysis,
                Ok(Err(e)) => {
                    tracing::warn!(bug_code = %bug.bug_code, error = %format!("{:#}", e), "analysis failed, will retry");
                    report.failed += 1;
                    continue;
                }
                Err(_) => {
                    tracing::warn!(bug_code = %bug.bug_code, "analysis timed out, will retry");
                    report.failed += 1;
                    continue;
                }
            };
            let suggestions = analysis.suggestions.len();
            if self.store(bug.id, analysis, now).await? {
                tracing::info!(bug_code = %bug.bug_code, suggestions, "bug analyzed");
                report.analyzed += 1;
                report.suggestions += suggestions;
            }
        }

        if report.analyzed == 0 && report.failed > 0 {
            return Err(PipelineError::collaborator(
                "analysis",
                format!("all {} analyses failed", report.failed),
            ));
        }
        Ok(report)
    }

    /// Returns false when the bug moved on before the analysis landed.
    async fn store(&self, bug_id: i64, analysis: Analysis, now: DateTime<Utc>) -> Result<bool, PipelineError> {
        self.db
            .call_with_timeout("record_analysis", self.store_timeout, move |db| {
                let fixes: Vec<(&str, f64)> = analysis
                    .suggestions
                    .iter()
                    .map(|fix| (fix.diff.as_str(), fix.confidence))
                    .collect();
                Ok(db.record_analysis(bug_id, &analysis.summary, &fixes, now)?.is_some())
            })
            .await
    }
}

#[async_trait]
impl Job for AiFixCheckJob {
    fn name(&self) -> &str {
        JOB_AI_FIX_CHECK
    }

    async fn run(&self) -> anyhow::Result<String> {
        Ok(self.run_at(Utc::now()).await?.to_string())
    }
}
