use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use selfheal_common::time::format_ts;
use selfheal_common::{BugRecord, BugStatus, FixSuggestion};

use super::PipelineDb;
use super::bugs::apply_transition;
use crate::errors::PipelineError;

const FIX_COLUMNS: &str =
    "id, bug_id, diff_patch, confidence, approved, executed, attempts, last_error, needs_manual, created_at";

fn fix_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FixSuggestion> {
    Ok(FixSuggestion {
        id: row.get(0)?,
        bug_id: row.get(1)?,
        diff_patch: row.get(2)?,
        confidence: row.get(3)?,
        approved: row.get(4)?,
        executed: row.get(5)?,
        attempts: row.get(6)?,
        last_error: row.get(7)?,
        needs_manual: row.get(8)?,
        created_at: row.get(9)?,
    })
}

/// What happened to a suggestion after a failed dispatch.
#[derive(Debug)]
pub enum FixFailure {
    /// Stays queued; `attempts` failures so far.
    WillRetry { attempts: i64 },
    /// Hit the attempt cap: flagged for manual work and the bug acknowledged.
    Escalated { attempts: i64, bug: BugRecord },
}

/// Insert an unapproved suggestion on `conn`. The caller has checked the bug.
pub(super) fn insert_suggestion(
    conn: &Connection,
    bug_id: i64,
    diff_patch: &str,
    confidence: f64,
    now: DateTime<Utc>,
) -> Result<String> {
    let id = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO fix_suggestions (id, bug_id, diff_patch, confidence, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![id, bug_id, diff_patch, confidence, format_ts(now)],
    )
    .context("Failed to insert fix suggestion")?;
    Ok(id)
}

impl PipelineDb {
    /// Register a suggestion produced by the analysis collaborator.
    pub fn insert_fix_suggestion(
        &self,
        bug_id: i64,
        diff_patch: &str,
        confidence: f64,
        now: DateTime<Utc>,
    ) -> Result<FixSuggestion> {
        self.require_bug(bug_id)?;
        let id = insert_suggestion(&self.conn, bug_id, diff_patch, confidence, now)?;
        self.require_fix_suggestion(&id)
    }

    pub fn get_fix_suggestion(&self, id: &str) -> Result<Option<FixSuggestion>> {
        let sql = format!("SELECT {} FROM fix_suggestions WHERE id = ?1", FIX_COLUMNS);
        self.conn
            .query_row(&sql, params![id], fix_from_row)
            .optional()
            .context("Failed to query fix suggestion")
    }

    fn require_fix_suggestion(&self, id: &str) -> Result<FixSuggestion> {
        self.get_fix_suggestion(id)?.ok_or_else(|| {
            PipelineError::SuggestionNotFound {
                id: id.to_string(),
            }
            .into()
        })
    }

    pub fn list_fix_suggestions_for_bug(&self, bug_id: i64) -> Result<Vec<FixSuggestion>> {
        let sql = format!(
            "SELECT {} FROM fix_suggestions WHERE bug_id = ?1 ORDER BY created_at ASC",
            FIX_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_fix_suggestions_for_bug")?;
        let rows = stmt
            .query_map(params![bug_id], fix_from_row)
            .context("Failed to query fix suggestions")?;
        let mut fixes = Vec::new();
        for row in rows {
            fixes.push(row.context("Failed to read fix suggestion row")?);
        }
        Ok(fixes)
    }

    /// Operator approval. Approving twice is harmless.
    pub fn approve_fix_suggestion(&self, id: &str) -> Result<FixSuggestion> {
        self.require_fix_suggestion(id)?;
        self.conn
            .execute(
                "UPDATE fix_suggestions SET approved = 1 WHERE id = ?1",
                params![id],
            )
            .context("Failed to approve fix suggestion")?;
        self.require_fix_suggestion(id)
    }

    /// Approved, unexecuted suggestions that have not been escalated,
    /// oldest first.
    pub fn pending_fix_suggestions(&self, limit: i64) -> Result<Vec<FixSuggestion>> {
        let sql = format!(
            "SELECT {} FROM fix_suggestions
             WHERE approved = 1 AND executed = 0 AND needs_manual = 0
             ORDER BY created_at ASC, rowid ASC LIMIT ?1",
            FIX_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare pending_fix_suggestions")?;
        let rows = stmt
            .query_map(params![limit], fix_from_row)
            .context("Failed to query pending fix suggestions")?;
        let mut fixes = Vec::new();
        for row in rows {
            fixes.push(row.context("Failed to read fix suggestion row")?);
        }
        Ok(fixes)
    }

    /// Mark a suggestion executed and move its bug to `fixed`, writing a
    /// `bug.fixed` event, all in one transaction.
    ///
    /// Returns `None` when the suggestion was already executed. A bug that
    /// an operator has already resolved keeps its status; the suggestion is
    /// still marked executed and no event is written.
    pub fn complete_fix_suggestion(
        &self,
        id: &str,
        note: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<BugRecord>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin fix completion transaction")?;
        let changed = tx
            .execute(
                "UPDATE fix_suggestions SET executed = 1 WHERE id = ?1 AND executed = 0",
                params![id],
            )
            .context("Failed to mark suggestion executed")?;
        if changed == 0 {
            return match self.get_fix_suggestion(id)? {
                Some(_) => Ok(None),
                None => Err(PipelineError::SuggestionNotFound { id: id.to_string() }.into()),
            };
        }
        let bug_id: i64 = tx
            .query_row(
                "SELECT bug_id FROM fix_suggestions WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .context("Failed to read suggestion bug id")?;
        let bug = self.require_bug(bug_id)?;
        let bug = if bug.status.can_transition_to(BugStatus::Fixed) {
            apply_transition(
                &tx,
                &bug,
                BugStatus::Fixed,
                "bug.fixed",
                serde_json::json!({ "suggestion_id": id, "note": note }),
                now,
            )?
        } else {
            tracing::info!(
                bug_code = %bug.bug_code,
                status = bug.status.as_str(),
                "fix applied to a bug no longer awaiting one; status left unchanged"
            );
            bug
        };
        tx.commit().context("Failed to commit fix completion")?;
        Ok(Some(bug))
    }

    /// Count a failed dispatch. At `max_attempts` the suggestion is flagged
    /// `needs_manual` and its bug moves to `acknowledged` with a
    /// `bug.escalated` event, in one transaction.
    pub fn record_fix_failure(
        &self,
        id: &str,
        error: &str,
        max_attempts: i64,
        now: DateTime<Utc>,
    ) -> Result<FixFailure> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin fix failure transaction")?;
        tx.execute(
            "UPDATE fix_suggestions SET attempts = attempts + 1, last_error = ?1
             WHERE id = ?2 AND executed = 0",
            params![error, id],
        )
        .context("Failed to record fix failure")?;
        let fix = self.require_fix_suggestion(id)?;
        if fix.attempts < max_attempts {
            tx.commit().context("Failed to commit fix failure")?;
            return Ok(FixFailure::WillRetry {
                attempts: fix.attempts,
            });
        }

        tx.execute(
            "UPDATE fix_suggestions SET needs_manual = 1 WHERE id = ?1",
            params![id],
        )
        .context("Failed to flag suggestion for manual work")?;
        let bug = self.require_bug(fix.bug_id)?;
        let bug = if bug.status.can_transition_to(BugStatus::Acknowledged) {
            apply_transition(
                &tx,
                &bug,
                BugStatus::Acknowledged,
                "bug.escalated",
                serde_json::json!({
                    "suggestion_id": id,
                    "attempts": fix.attempts,
                    "last_error": error,
                    "needs_manual": true,
                }),
                now,
            )?
        } else {
            bug
        };
        tx.commit().context("Failed to commit fix escalation")?;
        Ok(FixFailure::Escalated {
            attempts: fix.attempts,
            bug,
        })
    }
}
