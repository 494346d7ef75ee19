use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension, Transaction, TransactionBehavior, params};
use selfheal_common::time::format_ts;
use selfheal_common::{BugRecord, BugStatus, DedupKey, NewBug, Severity, generate_bug_code};

use super::PipelineDb;
use super::fixes::insert_suggestion;
use super::outbox::insert_outbox_event;
use crate::errors::PipelineError;

pub(super) const BUG_COLUMNS: &str = "id, bug_code, service_name, module, severity, title, details, log_excerpt, http_status, status, ai_analysis, dedup_key, created_at, updated_at";

/// Raw row; enum columns are parsed in `into_bug`.
struct BugRow {
    id: i64,
    bug_code: String,
    service_name: String,
    module: Option<String>,
    severity: String,
    title: String,
    details: String,
    log_excerpt: Option<String>,
    http_status: Option<i64>,
    status: String,
    ai_analysis: Option<String>,
    dedup_key: String,
    created_at: String,
    updated_at: String,
}

impl BugRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            bug_code: row.get(1)?,
            service_name: row.get(2)?,
            module: row.get(3)?,
            severity: row.get(4)?,
            title: row.get(5)?,
            details: row.get(6)?,
            log_excerpt: row.get(7)?,
            http_status: row.get(8)?,
            status: row.get(9)?,
            ai_analysis: row.get(10)?,
            dedup_key: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
        })
    }

    fn into_bug(self) -> Result<BugRecord> {
        Ok(BugRecord {
            id: self.id,
            bug_code: self.bug_code,
            service_name: self.service_name,
            module: self.module,
            severity: Severity::from_str(&self.severity).map_err(|e| anyhow::anyhow!(e))?,
            title: self.title,
            details: self.details,
            log_excerpt: self.log_excerpt,
            http_status: self.http_status,
            status: BugStatus::from_str(&self.status).map_err(|e| anyhow::anyhow!(e))?,
            ai_analysis: self.ai_analysis,
            dedup_key: self.dedup_key,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Result of a dedup-guarded insert.
#[derive(Debug)]
pub enum DedupOutcome {
    Created(BugRecord),
    /// A bug with the same dedup key was created inside the window.
    Duplicate { existing_code: String },
}

impl DedupOutcome {
    pub fn created(self) -> Option<BugRecord> {
        match self {
            Self::Created(bug) => Some(bug),
            Self::Duplicate { .. } => None,
        }
    }
}

/// Filters for `list_bugs`; all optional.
#[derive(Debug, Clone, Default)]
pub struct BugFilter {
    pub status: Option<BugStatus>,
    pub severity: Option<Severity>,
    pub service_name: Option<String>,
    pub module: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

fn query_bug(conn: &Connection, id: i64) -> Result<Option<BugRecord>> {
    let sql = format!("SELECT {} FROM bug_records WHERE id = ?1", BUG_COLUMNS);
    let row = conn
        .query_row(&sql, params![id], BugRow::from_row)
        .optional()
        .context("Failed to query bug")?;
    row.map(BugRow::into_bug).transpose()
}

/// Move `bug` to `next` and write the matching outbox event on `conn`.
/// The caller owns the transaction.
pub(super) fn apply_transition(
    conn: &Connection,
    bug: &BugRecord,
    next: BugStatus,
    event_type: &str,
    extra: serde_json::Value,
    now: DateTime<Utc>,
) -> Result<BugRecord> {
    if !bug.status.can_transition_to(next) {
        return Err(PipelineError::InvalidTransition {
            from: bug.status.as_str().to_string(),
            to: next.as_str().to_string(),
        }
        .into());
    }
    let now_s = format_ts(now);
    conn.execute(
        "UPDATE bug_records SET status = ?1, updated_at = ?2 WHERE id = ?3",
        params![next.as_str(), now_s, bug.id],
    )
    .context("Failed to update bug status")?;

    let mut payload = serde_json::json!({
        "bug_id": bug.id,
        "bug_code": bug.bug_code,
        "from": bug.status.as_str(),
        "to": next.as_str(),
    });
    if let (Some(map), serde_json::Value::Object(extra)) = (payload.as_object_mut(), extra) {
        map.extend(extra);
    }
    insert_outbox_event(conn, "bug", &bug.id.to_string(), event_type, &payload, now)?;

    query_bug(conn, bug.id)?.context("Bug not found after status update")
}

impl PipelineDb {
    /// Insert a bug unless one with the same dedup key was created within
    /// `window` of `now`. Check and insert share one IMMEDIATE transaction,
    /// so concurrent writers on this store cannot both pass the check.
    pub fn insert_bug_deduped(
        &self,
        bug: &NewBug,
        key: &DedupKey,
        now: DateTime<Utc>,
        window: Duration,
        max_code_attempts: u32,
    ) -> Result<DedupOutcome> {
        let mut rng = rand::rng();
        self.insert_bug_deduped_with(bug, key, now, window, max_code_attempts, &mut |ts| {
            generate_bug_code(ts, &mut rng)
        })
    }

    /// `insert_bug_deduped` with an explicit code generator.
    pub fn insert_bug_deduped_with(
        &self,
        bug: &NewBug,
        key: &DedupKey,
        now: DateTime<Utc>,
        window: Duration,
        max_code_attempts: u32,
        next_code: &mut dyn FnMut(DateTime<Utc>) -> String,
    ) -> Result<DedupOutcome> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .context("Failed to begin dedup transaction")?;

        let cutoff = format_ts(now - window);
        let existing: Option<String> = tx
            .query_row(
                "SELECT bug_code FROM bug_records
                 WHERE dedup_key = ?1 AND julianday(created_at) >= julianday(?2)
                 ORDER BY julianday(created_at) DESC LIMIT 1",
                params![key.as_str(), cutoff],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to check for duplicate bug")?;
        if let Some(existing_code) = existing {
            tx.commit().context("Failed to commit dedup check")?;
            return Ok(DedupOutcome::Duplicate { existing_code });
        }

        let now_s = format_ts(now);
        for _ in 0..max_code_attempts {
            let code = next_code(now);
            let inserted = tx.execute(
                "INSERT INTO bug_records (bug_code, service_name, module, severity, title, details,
                    log_excerpt, http_status, status, dedup_key, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'open', ?9, ?10, ?10)",
                params![
                    code,
                    bug.service_name,
                    bug.module,
                    bug.severity.as_str(),
                    bug.title,
                    bug.details,
                    bug.log_excerpt,
                    bug.http_status,
                    key.as_str(),
                    now_s,
                ],
            );
            match inserted {
                Ok(_) => {
                    let id = tx.last_insert_rowid();
                    let created = query_bug(&tx, id)?.context("Bug not found after insert")?;
                    tx.commit().context("Failed to commit bug insert")?;
                    return Ok(DedupOutcome::Created(created));
                }
                Err(e) if is_unique_violation(&e) => {
                    tracing::debug!(bug_code = %code, "bug code collision, retrying");
                }
                Err(e) => return Err(anyhow::Error::new(e).context("Failed to insert bug")),
            }
        }
        Err(PipelineError::BugCodeExhausted {
            attempts: max_code_attempts,
        }
        .into())
    }

    pub fn get_bug(&self, id: i64) -> Result<Option<BugRecord>> {
        query_bug(&self.conn, id)
    }

    /// `get_bug`, but a missing row is `PipelineError::BugNotFound`.
    pub fn require_bug(&self, id: i64) -> Result<BugRecord> {
        self.get_bug(id)?
            .ok_or_else(|| PipelineError::BugNotFound { id }.into())
    }

    pub fn get_bug_by_code(&self, code: &str) -> Result<Option<BugRecord>> {
        let sql = format!("SELECT {} FROM bug_records WHERE bug_code = ?1", BUG_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![code], BugRow::from_row)
            .optional()
            .context("Failed to query bug by code")?;
        row.map(BugRow::into_bug).transpose()
    }

    /// Newest first.
    pub fn list_bugs(&self, filter: &BugFilter) -> Result<Vec<BugRecord>> {
        let sql = format!(
            "SELECT {} FROM bug_records
             WHERE (?1 IS NULL OR status = ?1)
               AND (?2 IS NULL OR severity = ?2)
               AND (?3 IS NULL OR service_name = ?3)
               AND (?4 IS NULL OR module = ?4)
             ORDER BY created_at DESC, id DESC
             LIMIT ?5 OFFSET ?6",
            BUG_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare list_bugs")?;
        let rows = stmt
            .query_map(
                params![
                    filter.status.map(|s| s.as_str()),
                    filter.severity.map(|s| s.as_str()),
                    filter.service_name,
                    filter.module,
                    filter.limit,
                    filter.offset,
                ],
                BugRow::from_row,
            )
            .context("Failed to query bugs")?;
        let mut bugs = Vec::new();
        for row in rows {
            bugs.push(row.context("Failed to read bug row")?.into_bug()?);
        }
        Ok(bugs)
    }

    /// Open, unanalysed bugs created within `backlog` of `now`, highest
    /// severity first and oldest first within a severity.
    pub fn select_triage_candidates(
        &self,
        now: DateTime<Utc>,
        backlog: Duration,
        limit: i64,
    ) -> Result<Vec<BugRecord>> {
        let sql = format!(
            "SELECT {} FROM bug_records
             WHERE status = 'open' AND ai_analysis IS NULL
               AND julianday(created_at) >= julianday(?1)
             ORDER BY {} DESC, julianday(created_at) ASC, id ASC
             LIMIT ?2",
            BUG_COLUMNS,
            Severity::rank_sql("severity")
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare triage selection")?;
        let rows = stmt
            .query_map(params![format_ts(now - backlog), limit], BugRow::from_row)
            .context("Failed to query triage candidates")?;
        let mut bugs = Vec::new();
        for row in rows {
            bugs.push(row.context("Failed to read bug row")?.into_bug()?);
        }
        Ok(bugs)
    }

    /// Store an analysis and its proposed fixes (`(diff, confidence)` pairs)
    /// and advance `open → analyzing` with a `bug.analyzed` event, all in one
    /// transaction. Returns `None` when the bug is no longer open and
    /// unanalysed (another writer got there first).
    pub fn record_analysis(
        &self,
        id: i64,
        analysis: &str,
        fixes: &[(&str, f64)],
        now: DateTime<Utc>,
    ) -> Result<Option<BugRecord>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin analysis transaction")?;
        let bug = match query_bug(&tx, id)? {
            Some(bug) if bug.status == BugStatus::Open && bug.ai_analysis.is_none() => bug,
            Some(_) => return Ok(None),
            None => return Err(PipelineError::BugNotFound { id }.into()),
        };
        tx.execute(
            "UPDATE bug_records SET ai_analysis = ?1 WHERE id = ?2",
            params![analysis, id],
        )
        .context("Failed to store analysis")?;
        for (diff, confidence) in fixes {
            insert_suggestion(&tx, id, diff, *confidence, now)?;
        }
        let updated = apply_transition(
            &tx,
            &bug,
            BugStatus::Analyzing,
            "bug.analyzed",
            serde_json::json!({
                "severity": bug.severity.as_str(),
                "suggestions": fixes.len(),
            }),
            now,
        )?;
        tx.commit().context("Failed to commit analysis")?;
        Ok(Some(updated))
    }

    /// Operator or completion-endpoint transition, with a status-change event.
    pub fn transition_bug(
        &self,
        id: i64,
        next: BugStatus,
        note: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<BugRecord> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transition transaction")?;
        let bug = query_bug(&tx, id)?.ok_or(PipelineError::BugNotFound { id })?;
        let event_type = match next {
            BugStatus::Fixed => "bug.fixed",
            BugStatus::Acknowledged => "bug.acknowledged",
            BugStatus::Resolved => "bug.resolved",
            _ => "bug.status_changed",
        };
        let updated = apply_transition(
            &tx,
            &bug,
            next,
            event_type,
            serde_json::json!({ "note": note }),
            now,
        )?;
        tx.commit().context("Failed to commit transition")?;
        Ok(updated)
    }

    /// Insert a bug without the dedup guard or code retry. Test fixtures only.
    #[cfg(test)]
    pub(crate) fn insert_bug_raw(
        &self,
        code: &str,
        severity: Severity,
        status: BugStatus,
        created_at: DateTime<Utc>,
    ) -> Result<BugRecord> {
        let ts = format_ts(created_at);
        self.conn
            .execute(
                "INSERT INTO bug_records (bug_code, service_name, severity, title, details, status, dedup_key, created_at, updated_at)
                 VALUES (?1, 'svc', ?2, ?1, ?1, ?3, ?1, ?4, ?4)",
                params![code, severity.as_str(), status.as_str(), ts],
            )
            .context("Failed to insert fixture bug")?;
        let id = self.conn.last_insert_rowid();
        self.require_bug(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use selfheal_common::is_valid_bug_code;

    fn t(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 1, h, m, 0).unwrap()
    }

    fn new_bug(service: &str, message: &str) -> NewBug {
        NewBug {
            service_name: service.to_string(),
            module: None,
            severity: Severity::High,
            title: format!("{}: {}", service, message),
            details: message.to_string(),
            log_excerpt: None,
            http_status: Some(500),
        }
    }

    #[test]
    fn test_insert_assigns_valid_code_and_open_status() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let key = DedupKey::for_log("X", "boom");
        let bug = db
            .insert_bug_deduped(&new_bug("X", "boom"), &key, t(10, 0), Duration::hours(1), 5)?
            .created()
            .expect("bug should be created");
        assert!(is_valid_bug_code(&bug.bug_code));
        assert_eq!(bug.status, BugStatus::Open);
        assert_eq!(bug.dedup_key, key.as_str());
        assert!(bug.ai_analysis.is_none());
        Ok(())
    }

    #[test]
    fn test_duplicate_inside_window_is_skipped() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let key = DedupKey::for_log("X", "boom");
        let first = db
            .insert_bug_deduped(&new_bug("X", "boom"), &key, t(10, 0), Duration::hours(1), 5)?
            .created()
            .unwrap();
        let second =
            db.insert_bug_deduped(&new_bug("X", "boom"), &key, t(10, 59), Duration::hours(1), 5)?;
        match second {
            DedupOutcome::Duplicate { existing_code } => assert_eq!(existing_code, first.bug_code),
            DedupOutcome::Created(_) => panic!("expected duplicate"),
        }
        Ok(())
    }

    #[test]
    fn test_duplicate_outside_window_is_created() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let key = DedupKey::for_log("X", "boom");
        db.insert_bug_deduped(&new_bug("X", "boom"), &key, t(10, 0), Duration::hours(1), 5)?;
        let later =
            db.insert_bug_deduped(&new_bug("X", "boom"), &key, t(11, 1), Duration::hours(1), 5)?;
        assert!(later.created().is_some());
        Ok(())
    }

    #[test]
    fn test_code_collision_is_retried() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        db.insert_bug_raw("BUG-20260401-aaaa", Severity::Low, BugStatus::Open, t(9, 0))?;

        let mut codes = vec!["BUG-20260401-bbbb", "BUG-20260401-aaaa"];
        let bug = db
            .insert_bug_deduped_with(
                &new_bug("Y", "kaput"),
                &DedupKey::for_log("Y", "kaput"),
                t(10, 0),
                Duration::hours(1),
                5,
                &mut |_| codes.pop().unwrap().to_string(),
            )?
            .created()
            .unwrap();
        assert_eq!(bug.bug_code, "BUG-20260401-bbbb");
        Ok(())
    }

    #[test]
    fn test_code_exhaustion_is_reported() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        db.insert_bug_raw("BUG-20260401-aaaa", Severity::Low, BugStatus::Open, t(9, 0))?;
        let err = db
            .insert_bug_deduped_with(
                &new_bug("Y", "kaput"),
                &DedupKey::for_log("Y", "kaput"),
                t(10, 0),
                Duration::hours(1),
                3,
                &mut |_| "BUG-20260401-aaaa".to_string(),
            )
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::BugCodeExhausted { attempts: 3 })
        ));
        // Nothing half-written.
        assert_eq!(db.list_bugs(&BugFilter { limit: 10, ..Default::default() })?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_triage_order_is_severity_desc_then_oldest() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        db.insert_bug_raw("BUG-20260401-hi10", Severity::High, BugStatus::Open, t(10, 0))?;
        db.insert_bug_raw("BUG-20260401-lo09", Severity::Low, BugStatus::Open, t(9, 0))?;
        db.insert_bug_raw("BUG-20260401-hi93", Severity::High, BugStatus::Open, t(9, 30))?;

        let picked = db.select_triage_candidates(t(11, 0), Duration::hours(24), 10)?;
        let codes: Vec<_> = picked.iter().map(|b| b.bug_code.as_str()).collect();
        assert_eq!(
            codes,
            vec!["BUG-20260401-hi93", "BUG-20260401-hi10", "BUG-20260401-lo09"]
        );
        Ok(())
    }

    #[test]
    fn test_triage_skips_analysed_closed_and_stale() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let analysed =
            db.insert_bug_raw("BUG-20260401-anal", Severity::High, BugStatus::Open, t(10, 0))?;
        db.record_analysis(analysed.id, "done", &[], t(10, 5))?;
        db.insert_bug_raw("BUG-20260401-fixd", Severity::High, BugStatus::Fixed, t(10, 0))?;
        db.insert_bug_raw(
            "BUG-20260331-old1",
            Severity::High,
            BugStatus::Open,
            t(10, 0) - Duration::hours(30),
        )?;
        db.insert_bug_raw("BUG-20260401-keep", Severity::Medium, BugStatus::Open, t(10, 0))?;

        let picked = db.select_triage_candidates(t(11, 0), Duration::hours(24), 10)?;
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].bug_code, "BUG-20260401-keep");
        Ok(())
    }

    #[test]
    fn test_triage_respects_limit() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        for i in 0..5 {
            db.insert_bug_raw(&format!("BUG-20260401-000{}", i), Severity::Low, BugStatus::Open, t(10, i))?;
        }
        assert_eq!(db.select_triage_candidates(t(11, 0), Duration::hours(24), 2)?.len(), 2);
        Ok(())
    }

    #[test]
    fn test_record_analysis_writes_outbox_event() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let bug = db.insert_bug_raw("BUG-20260401-abcd", Severity::High, BugStatus::Open, t(10, 0))?;
        let updated = db.record_analysis(bug.id, "null deref", &[("+ guard", 0.7)], t(10, 1))?.unwrap();
        assert_eq!(updated.status, BugStatus::Analyzing);
        assert_eq!(updated.ai_analysis.as_deref(), Some("null deref"));

        let events = db.fetch_unpublished(10)?.rows;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "bug.analyzed");
        assert_eq!(events[0].payload["bug_code"], "BUG-20260401-abcd");
        assert_eq!(events[0].payload["to"], "analyzing");

        // Second analysis is a no-op.
        assert!(db.record_analysis(bug.id, "again", &[], t(10, 2))?.is_none());
        assert_eq!(db.fetch_unpublished(10)?.rows.len(), 1);
        Ok(())
    }

    #[test]
    fn test_analysis_and_suggestions_commit_together() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let bug = db.insert_bug_raw("BUG-20260401-atom", Severity::High, BugStatus::Open, t(10, 0))?;
        db.conn.execute_batch(
            "CREATE TRIGGER reject_second_fix BEFORE INSERT ON fix_suggestions
             WHEN NEW.diff_patch = '+ second'
             BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
        )?;

        let fixes = [("+ first", 0.9), ("+ second", 0.5)];
        assert!(db.record_analysis(bug.id, "race in cache", &fixes, t(10, 1)).is_err());

        let unchanged = db.require_bug(bug.id)?;
        assert_eq!(unchanged.status, BugStatus::Open);
        assert!(unchanged.ai_analysis.is_none());
        assert!(db.list_fix_suggestions_for_bug(bug.id)?.is_empty());
        assert!(db.fetch_unpublished(10)?.rows.is_empty());
        // Still a triage candidate on the next tick.
        assert_eq!(db.select_triage_candidates(t(11, 0), Duration::hours(24), 10)?.len(), 1);

        db.conn.execute_batch("DROP TRIGGER reject_second_fix;")?;
        db.record_analysis(bug.id, "race in cache", &fixes, t(10, 2))?.unwrap();
        assert_eq!(db.list_fix_suggestions_for_bug(bug.id)?.len(), 2);
        Ok(())
    }

    #[test]
    fn test_transition_rejects_invalid_moves_without_event() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let bug = db.insert_bug_raw("BUG-20260401-rslv", Severity::Low, BugStatus::Resolved, t(10, 0))?;
        let err = db
            .transition_bug(bug.id, BugStatus::Acknowledged, None, t(10, 1))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::InvalidTransition { .. })
        ));
        assert!(db.fetch_unpublished(10)?.rows.is_empty());
        Ok(())
    }

    #[test]
    fn test_operator_transition_emits_event_with_note() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let bug = db.insert_bug_raw("BUG-20260401-ackn", Severity::Low, BugStatus::Open, t(10, 0))?;
        let updated = db.transition_bug(bug.id, BugStatus::Acknowledged, Some("on it"), t(10, 1))?;
        assert_eq!(updated.status, BugStatus::Acknowledged);
        let events = db.fetch_unpublished(10)?.rows;
        assert_eq!(events[0].event_type, "bug.acknowledged");
        assert_eq!(events[0].payload["note"], "on it");
        Ok(())
    }

    #[test]
    fn test_list_bugs_filters() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        db.insert_bug_raw("BUG-20260401-aaa1", Severity::High, BugStatus::Open, t(9, 0))?;
        db.insert_bug_raw("BUG-20260401-aaa2", Severity::Low, BugStatus::Open, t(10, 0))?;
        db.insert_bug_raw("BUG-20260401-aaa3", Severity::High, BugStatus::Fixed, t(11, 0))?;

        let all = db.list_bugs(&BugFilter { limit: 50, ..Default::default() })?;
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].bug_code, "BUG-20260401-aaa3");

        let open_high = db.list_bugs(&BugFilter {
            status: Some(BugStatus::Open),
            severity: Some(Severity::High),
            limit: 50,
            ..Default::default()
        })?;
        assert_eq!(open_high.len(), 1);
        assert_eq!(open_high[0].bug_code, "BUG-20260401-aaa1");
        Ok(())
    }

    #[test]
    fn test_get_bug_by_code() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let bug = db.insert_bug_raw("BUG-20260401-find", Severity::Low, BugStatus::Open, t(9, 0))?;
        assert_eq!(db.get_bug_by_code("BUG-20260401-find")?.unwrap().id, bug.id);
        assert!(db.get_bug_by_code("BUG-20260401-none")?.is_none());
        Ok(())
    }
}
