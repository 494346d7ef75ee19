//! Auto-fix worker: dispatch approved fix suggestions to the patch runner.
//!
//! Success marks the suggestion executed and the bug `fixed`. A failed or
//! unreachable run counts an attempt and leaves the suggestion queued; at the
//! attempt cap it is flagged for manual work and the bug is acknowledged.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use selfheal_common::FixSuggestion;
use serde::Serialize;
use tracing::Instrument;

use crate::clients::Patcher;
use crate::config::{JOB_AUTO_FIX_WORKER, RemediationConfig};
use crate::errors::PipelineError;
use crate::scheduler::Job;
use crate::store::{DbHandle, FixFailure};

#[derive(Debug, Default, Clone, Serialize)]
pub struct DispatchReport {
    pub dispatched: usize,
    pub fixed: usize,
    pub retrying: usize,
    pub escalated: usize,
}

impl fmt::Display for DispatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "dispatched {}: {} fixed, {} retrying, {} escalated",
            self.dispatched, self.fixed, self.retrying, self.escalated
        )
    }
}

pub struct AutoFixWorker {
    db: DbHandle,
    patcher: Arc<dyn Patcher>,
    settings: RemediationConfig,
    store_timeout: Duration,
}

impl AutoFixWorker {
    pub fn new(db: DbHandle, patcher: Arc<dyn Patcher>, settings: RemediationConfig, store_timeout: Duration) -> Self {
        Self {
            db,
            patcher,
            settings,
            store_timeout,
        }
    }

    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<DispatchReport, PipelineError> {
        let limit = self.settings.batch_size;
        let pending = self
            .db
            .call_with_timeout("pending_fix_suggestions", self.store_timeout, move |db| {
                db.pending_fix_suggestions(limit)
            })
            .await?;

        let mut report = DispatchReport::default();
        for fix in pending {
            report.dispatched += 1;
            let span = tracing::info_span!("dispatch", suggestion_id = %fix.id, bug_id = fix.bug_id);
            match self.patcher.apply_and_test(&fix).instrument(span).await {
                Ok(outcome) if outcome.success => {
                    if self.complete(&fix, outcome.note, now).await? {
                        tracing::info!(suggestion_id = %fix.id, bug_id = fix.bug_id, "fix applied, bug fixed");
                        report.fixed += 1;
                    }
                }
                Ok(outcome) => {
                    let reason = if outcome.note.is_empty() {
                        "patch tests failed".to_string()
                    } else {
                        outcome.note
                    };
                    self.fail(&fix, reason, now, &mut report).await?;
                }
                Err(e) => {
                    self.fail(&fix, format!("{:#}", e), now, &mut report).await?;
                }
            }
        }
        Ok(report)
    }

    async fn complete(&self, fix: &FixSuggestion, note: String, now: DateTime<Utc>) -> Result<bool, PipelineError> {
        let id = fix.id.clone();
        let done = self
            .db
            .call_with_timeout("complete_fix_suggestion", self.store_timeout, move |db| {
                db.complete_fix_suggestion(&id, &note, now)
            })
            .await?;
        Ok(done.is_some())
    }

    async fn fail(
        &self,
        fix: &FixSuggestion,
        reason: String,
        now: DateTime<Utc>,
        report: &mut DispatchReport,
    ) -> Result<(), PipelineError> {
        let id = fix.id.clone();
        let max_attempts = self.settings.max_attempts;
        let failure = self
            .db
            .call_with_timeout("record_fix_failure", self.store_timeout, move |db| {
                db.record_fix_failure(&id, &reason, max_attempts, now)
            })
            .await?;
        match failure {
            FixFailure::WillRetry { attempts } => {
                tracing::warn!(suggestion_id = %fix.id, attempts, "fix failed, will retry");
                report.retrying += 1;
            }
            FixFailure::Escalated { attempts, bug } => {
                tracing::warn!(
                    suggestion_id = %fix.id,
                    bug_code = %bug.bug_code,
                    attempts,
                    "fix failed too often, escalated to manual"
                );
                report.escalated += 1;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Job for AutoFixWorker {
    fn name(&self) -> &str {
        JOB_AUTO_FIX_WORKER
    }

    async fn run(&self) -> anyhow::Result<String> {
        Ok(self.run_at(Utc::now()).await?.to_string())
    }
}
