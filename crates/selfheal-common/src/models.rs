use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ── Severity ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub const ALL: [Severity; 3] = [Self::Low, Self::Medium, Self::High];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    /// Higher is more severe.
    pub fn rank(&self) -> i64 {
        match self {
            Self::Low => 1,
            Self::Medium => 2,
            Self::High => 3,
        }
    }

    /// SQL expression mapping a severity `column` to its `rank`, for ordering.
    pub fn rank_sql(column: &str) -> String {
        let arms: String = Self::ALL
            .iter()
            .map(|s| format!(" WHEN '{}' THEN {}", s.as_str(), s.rank()))
            .collect();
        format!("CASE {}{} ELSE 0 END", column, arms)
    }

    /// `>= 500` is high, `400..=499` is medium, anything else (or no status) is low.
    pub fn from_http_status(status: Option<i64>) -> Self {
        match status {
            Some(s) if s >= 500 => Self::High,
            Some(s) if (400..500).contains(&s) => Self::Medium,
            _ => Self::Low,
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            _ => Err(format!("Invalid severity: {}", s)),
        }
    }
}

// ── Bug lifecycle ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BugStatus {
    Open,
    Analyzing,
    Fixed,
    Acknowledged,
    Resolved,
}

impl BugStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Analyzing => "analyzing",
            Self::Fixed => "fixed",
            Self::Acknowledged => "acknowledged",
            Self::Resolved => "resolved",
        }
    }

    /// Whether a bug in this state may move to `next`.
    ///
    /// `fixed` ends the automated path; from there only an operator may
    /// resolve. `resolved` accepts nothing.
    pub fn can_transition_to(&self, next: BugStatus) -> bool {
        use BugStatus::*;
        matches!(
            (self, next),
            (Open, Analyzing)
                | (Open, Fixed)
                | (Open, Acknowledged)
                | (Open, Resolved)
                | (Analyzing, Fixed)
                | (Analyzing, Acknowledged)
                | (Analyzing, Resolved)
                | (Acknowledged, Fixed)
                | (Acknowledged, Resolved)
                | (Fixed, Resolved)
        )
    }

    /// States an operator may set directly.
    pub fn is_operator_state(&self) -> bool {
        matches!(self, Self::Acknowledged | Self::Resolved)
    }
}

impl FromStr for BugStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "analyzing" => Ok(Self::Analyzing),
            "fixed" => Ok(Self::Fixed),
            "acknowledged" => Ok(Self::Acknowledged),
            "resolved" => Ok(Self::Resolved),
            _ => Err(format!("Invalid bug status: {}", s)),
        }
    }
}

// ── Registry records ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BugRecord {
    pub id: i64,
    pub bug_code: String,
    pub service_name: String,
    pub module: Option<String>,
    pub severity: Severity,
    pub title: String,
    pub details: String,
    pub log_excerpt: Option<String>,
    pub http_status: Option<i64>,
    pub status: BugStatus,
    pub ai_analysis: Option<String>,
    pub dedup_key: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Fields needed to create a bug record; `bug_code`, status and timestamps
/// are assigned by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewBug {
    pub service_name: String,
    pub module: Option<String>,
    pub severity: Severity,
    pub title: String,
    pub details: String,
    pub log_excerpt: Option<String>,
    pub http_status: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixSuggestion {
    pub id: String,
    pub bug_id: i64,
    pub diff_patch: String,
    pub confidence: f64,
    pub approved: bool,
    pub executed: bool,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub needs_manual: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub published: bool,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub created_at: String,
    pub published_at: Option<String>,
}

impl OutboxEvent {
    /// Bus topic the event is delivered to.
    pub fn topic(&self) -> String {
        format!("{}.events", self.aggregate_type)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CronStatus {
    Success,
    Error,
}

impl CronStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

impl FromStr for CronStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid cron status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronExecutionLog {
    pub id: i64,
    pub job_name: String,
    pub status: CronStatus,
    pub message: Option<String>,
    pub duration_ms: i64,
    pub executed_at: String,
}

// ── Telemetry (written by other services) ─────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub id: i64,
    pub service: String,
    pub level: String,
    pub message: String,
    pub stack: Option<String>,
    pub http_status: Option<i64>,
    pub created_at: String,
}

/// The failure predicate shared by the bug scan and the ingestion gateway:
/// level `ERROR`/`FATAL` (any case) or an HTTP status of 500 and above.
pub fn is_failure(level: &str, http_status: Option<i64>) -> bool {
    let level = level.trim();
    level.eq_ignore_ascii_case("error")
        || level.eq_ignore_ascii_case("fatal")
        || http_status.is_some_and(|s| s >= 500)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DlqEntry {
    pub id: i64,
    pub topic: String,
    pub partition: i64,
    pub offset: i64,
    pub key: Option<String>,
    pub value: Option<String>,
    pub error_reason: String,
    pub failed_at: String,
    pub processed: bool,
}

// ── Wire shapes ───────────────────────────────────────────────────────

/// Body of `POST /api/bugs/ingest`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngestBugRequest {
    pub service_name: String,
    #[serde(default)]
    pub module: Option<String>,
    pub severity: Severity,
    pub title: String,
    pub details: String,
    #[serde(default)]
    pub log_excerpt: Option<String>,
    #[serde(default)]
    pub http_status: Option<i64>,
}

impl IngestBugRequest {
    pub fn into_new_bug(self) -> NewBug {
        NewBug {
            service_name: self.service_name,
            module: self.module,
            severity: self.severity,
            title: self.title,
            details: self.details,
            log_excerpt: self.log_excerpt,
            http_status: self.http_status,
        }
    }
}

/// Response of `POST /api/bugs/ingest`: the new record, or the code of the
/// record that suppressed it as a duplicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestBugResponse {
    pub created: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bug: Option<BugRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub existing_code: Option<String>,
}

/// Body of `POST /api/bugs/:id/complete`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompleteBugRequest {
    pub status: BugStatus,
    #[serde(default)]
    pub note: Option<String>,
}

/// Truncate `s` to at most `max` characters, appending an ellipsis when cut.
pub fn truncate_title(s: &str, max: usize) -> String {
    let s = s.trim();
    if s.chars().count() <= max {
        return s.to_string();
    }
    let cut: String = s.chars().take(max.saturating_sub(1)).collect();
    format!("{}…", cut.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_follows_http_status_bands() {
        assert_eq!(Severity::from_http_status(Some(503)), Severity::High);
        assert_eq!(Severity::from_http_status(Some(500)), Severity::High);
        assert_eq!(Severity::from_http_status(Some(499)), Severity::Medium);
        assert_eq!(Severity::from_http_status(Some(404)), Severity::Medium);
        assert_eq!(Severity::from_http_status(Some(302)), Severity::Low);
        assert_eq!(Severity::from_http_status(None), Severity::Low);
    }

    #[test]
    fn severity_orders_by_rank() {
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
        assert_eq!(Severity::High.rank(), 3);
    }

    #[test]
    fn rank_sql_covers_every_severity() {
        assert_eq!(
            Severity::rank_sql("severity"),
            "CASE severity WHEN 'low' THEN 1 WHEN 'medium' THEN 2 WHEN 'high' THEN 3 ELSE 0 END"
        );
    }

    #[test]
    fn failure_predicate_matches_levels_and_5xx() {
        assert!(is_failure("ERROR", None));
        assert!(is_failure("fatal", None));
        assert!(is_failure("INFO", Some(502)));
        assert!(!is_failure("WARN", Some(404)));
        assert!(!is_failure("INFO", None));
    }

    #[test]
    fn status_roundtrips_through_str() {
        for status in [
            BugStatus::Open,
            BugStatus::Analyzing,
            BugStatus::Fixed,
            BugStatus::Acknowledged,
            BugStatus::Resolved,
        ] {
            assert_eq!(BugStatus::from_str(status.as_str()).unwrap(), status);
        }
        assert!(BugStatus::from_str("closed").is_err());
    }

    #[test]
    fn automated_path_ends_at_fixed() {
        assert!(BugStatus::Open.can_transition_to(BugStatus::Analyzing));
        assert!(BugStatus::Analyzing.can_transition_to(BugStatus::Fixed));
        assert!(!BugStatus::Fixed.can_transition_to(BugStatus::Analyzing));
        assert!(!BugStatus::Fixed.can_transition_to(BugStatus::Open));
        assert!(BugStatus::Fixed.can_transition_to(BugStatus::Resolved));
    }

    #[test]
    fn resolved_is_terminal() {
        for next in [
            BugStatus::Open,
            BugStatus::Analyzing,
            BugStatus::Fixed,
            BugStatus::Acknowledged,
        ] {
            assert!(!BugStatus::Resolved.can_transition_to(next));
        }
    }

    #[test]
    fn complete_request_parses_snake_case_status() {
        let req: CompleteBugRequest =
            serde_json::from_str(r#"{"status":"fixed","note":"patched"}"#).unwrap();
        assert_eq!(req.status, BugStatus::Fixed);
        assert_eq!(req.note.as_deref(), Some("patched"));
    }

    #[test]
    fn truncate_title_keeps_short_strings() {
        assert_eq!(truncate_title("  boom ", 10), "boom");
        let long = "x".repeat(50);
        let t = truncate_title(&long, 10);
        assert_eq!(t.chars().count(), 10);
        assert!(t.ends_with('…'));
    }

    #[test]
    fn outbox_topic_uses_aggregate_type() {
        let event = OutboxEvent {
            id: "e1".into(),
            aggregate_type: "bug".into(),
            aggregate_id: "1".into(),
            event_type: "bug.fixed".into(),
            payload: serde_json::json!({}),
            published: false,
            attempts: 0,
            last_error: None,
            created_at: String::new(),
            published_at: None,
        };
        assert_eq!(event.topic(), "bug.events");
    }
}
