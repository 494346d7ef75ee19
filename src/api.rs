use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use chrono::Utc;
use selfheal_common::{
    BugRecord, BugStatus, CompleteBugRequest, DedupKey, FixSuggestion, IngestBugRequest, IngestBugResponse,
    Severity,
};
use serde::{Deserialize, Serialize};

use crate::config::{JOB_OUTBOX_PUBLISHER, SelfHealConfig};
use crate::errors::PipelineError;
use crate::scheduler::Scheduler;
use crate::store::{BugFilter, DbHandle, DedupOutcome};

const DEFAULT_PAGE: i64 = 50;
const MAX_PAGE: i64 = 500;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub scheduler: Arc<Scheduler>,
    pub config: Arc<SelfHealConfig>,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ListBugsQuery {
    pub status: Option<String>,
    pub severity: Option<String>,
    pub service: Option<String>,
    pub module: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Deserialize)]
pub struct UpdateStatusRequest {
    pub status: BugStatus,
    pub note: Option<String>,
}

#[derive(Deserialize)]
pub struct CreateFixRequest {
    pub bug_id: i64,
    pub diff_patch: String,
    #[serde(default)]
    pub confidence: f64,
}

#[derive(Deserialize)]
pub struct ListEventsQuery {
    pub published: Option<bool>,
    pub limit: Option<i64>,
}

#[derive(Deserialize)]
pub struct ListCronLogsQuery {
    pub job: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Serialize)]
pub struct BugDetail {
    #[serde(flatten)]
    pub bug: BugRecord,
    pub fix_suggestions: Vec<FixSuggestion>,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        let message = err.to_string();
        match err {
            PipelineError::BugNotFound { .. }
            | PipelineError::SuggestionNotFound { .. }
            | PipelineError::EventNotFound { .. }
            | PipelineError::UnknownJob { .. } => ApiError::NotFound(message),
            PipelineError::InvalidTransition { .. } => ApiError::Conflict(message),
            PipelineError::BadRequest(_) => ApiError::BadRequest(message),
            other => {
                tracing::error!(error = %format!("{:#}", other), "request failed");
                ApiError::Internal(message)
            }
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/bugs", get(list_bugs))
        .route("/api/bugs/ingest", post(ingest_bug))
        .route("/api/bugs/{id}", get(get_bug))
        .route("/api/bugs/{id}/complete", post(complete_bug))
        .route("/api/bugs/{id}/status", put(update_bug_status))
        .route("/api/fixes", post(create_fix))
        .route("/api/fixes/{id}/approve", post(approve_fix))
        .route("/api/outbox/events", get(list_outbox_events))
        .route("/api/outbox/events/{id}", get(get_outbox_event))
        .route("/api/outbox/process", post(process_outbox))
        .route("/api/cron/logs", get(list_cron_logs))
        .route("/api/jobs", get(list_jobs))
        .route("/api/jobs/{name}/run", post(run_job))
        .route("/api/pipeline/stats", get(pipeline_stats))
        .route("/health", get(health_check))
}

// ── Helpers ───────────────────────────────────────────────────────────

fn page_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE)
}

fn parse_param<T: FromStr<Err = String>>(value: Option<&str>) -> Result<Option<T>, ApiError> {
    value
        .filter(|v| !v.is_empty())
        .map(T::from_str)
        .transpose()
        .map_err(ApiError::BadRequest)
}

fn require_text(field: &str, value: &str) -> Result<(), ApiError> {
    if value.trim().is_empty() {
        return Err(ApiError::BadRequest(format!("'{}' must not be empty", field)));
    }
    Ok(())
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn ingest_bug(
    State(state): State<SharedState>,
    Json(req): Json<IngestBugRequest>,
) -> Result<Response, ApiError> {
    require_text("service_name", &req.service_name)?;
    require_text("title", &req.title)?;

    let key = DedupKey::new(&req.service_name, &req.details);
    let window = chrono::Duration::seconds(state.config.detection.dedup_window_secs as i64);
    let max_code_attempts = state.config.detection.max_code_attempts;
    let bug = req.into_new_bug();
    let now = Utc::now();

    let outcome = state
        .db
        .call_with_timeout("ingest_bug", state.config.store.timeout(), move |db| {
            db.insert_bug_deduped(&bug, &key, now, window, max_code_attempts)
        })
        .await?;

    let response = match outcome {
        DedupOutcome::Created(bug) => {
            tracing::info!(bug_code = %bug.bug_code, service = %bug.service_name, "bug ingested");
            let body = IngestBugResponse {
                created: true,
                bug: Some(bug),
                existing_code: None,
            };
            (StatusCode::CREATED, Json(body)).into_response()
        }
        DedupOutcome::Duplicate { existing_code } => {
            tracing::debug!(bug_code = %existing_code, "ingest suppressed as duplicate");
            let body = IngestBugResponse {
                created: false,
                bug: None,
                existing_code: Some(existing_code),
            };
            (StatusCode::OK, Json(body)).into_response()
        }
    };
    Ok(response)
}

async fn list_bugs(
    State(state): State<SharedState>,
    Query(query): Query<ListBugsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let filter = BugFilter {
        status: parse_param::<BugStatus>(query.status.as_deref())?,
        severity: parse_param::<Severity>(query.severity.as_deref())?,
        service_name: query.service.filter(|s| !s.is_empty()),
        module: query.module.filter(|m| !m.is_empty()),
        limit: page_limit(query.limit),
        offset: query.offset.unwrap_or(0).max(0),
    };
    let bugs = state
        .db
        .call_with_timeout("list_bugs", state.config.store.timeout(), move |db| {
            db.list_bugs(&filter)
        })
        .await?;
    Ok(Json(bugs))
}

async fn get_bug(State(state): State<SharedState>, Path(id): Path<i64>) -> Result<impl IntoResponse, ApiError> {
    let detail = state
        .db
        .call_with_timeout("get_bug", state.config.store.timeout(), move |db| {
            let bug = db.require_bug(id)?;
            let fix_suggestions = db.list_fix_suggestions_for_bug(id)?;
            Ok(BugDetail { bug, fix_suggestions })
        })
        .await?;
    Ok(Json(detail))
}

async fn complete_bug(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<CompleteBugRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let now = Utc::now();
    let bug = state
        .db
        .call_with_timeout("complete_bug", state.config.store.timeout(), move |db| {
            db.transition_bug(id, req.status, req.note.as_deref(), now)
        })
        .await?;
    tracing::info!(bug_code = %bug.bug_code, status = bug.status.as_str(), "bug completed");
    Ok(Json(bug))
}

async fn update_bug_status(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateStatusRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if !req.status.is_operator_state() {
        return Err(ApiError::BadRequest(format!(
            "Operators may only set 'acknowledged' or 'resolved', not '{}'",
            req.status.as_str()
        )));
    }
    let now = Utc::now();
    let bug = state
        .db
        .call_with_timeout("update_bug_status", state.config.store.timeout(), move |db| {
            db.transition_bug(id, req.status, req.note.as_deref(), now)
        })
        .await?;
    Ok(Json(bug))
}

async fn create_fix(
    State(state): State<SharedState>,
    Json(req): Json<CreateFixRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_text("diff_patch", &req.diff_patch)?;
    if !(0.0..=1.0).contains(&req.confidence) {
        return Err(ApiError::BadRequest("'confidence' must be between 0 and 1".to_string()));
    }
    let now = Utc::now();
    let fix = state
        .db
        .call_with_timeout("insert_fix_suggestion", state.config.store.timeout(), move |db| {
            db.insert_fix_suggestion(req.bug_id, &req.diff_patch, req.confidence, now)
        })
        .await?;
    Ok((StatusCode::CREATED, Json(fix)))
}

async fn approve_fix(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let fix = state
        .db
        .call_with_timeout("approve_fix_suggestion", state.config.store.timeout(), move |db| {
            db.approve_fix_suggestion(&id)
        })
        .await?;
    tracing::info!(suggestion_id = %fix.id, bug_id = fix.bug_id, "fix suggestion approved");
    Ok(Json(fix))
}

async fn list_outbox_events(
    State(state): State<SharedState>,
    Query(query): Query<ListEventsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = page_limit(query.limit);
    let events = state
        .db
        .call_with_timeout("list_outbox_events", state.config.store.timeout(), move |db| {
            db.list_outbox_events(query.published, limit)
        })
        .await?;
    Ok(Json(events))
}

async fn get_outbox_event(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let event = state
        .db
        .call_with_timeout("get_outbox_event", state.config.store.timeout(), move |db| {
            db.get_outbox_event(&id)?
                .ok_or_else(|| PipelineError::EventNotFound { id }.into())
        })
        .await?;
    Ok(Json(event))
}

async fn process_outbox(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    trigger(&state, JOB_OUTBOX_PUBLISHER).await
}

async fn run_job(State(state): State<SharedState>, Path(name): Path<String>) -> Result<impl IntoResponse, ApiError> {
    trigger(&state, &name).await
}

async fn trigger(state: &AppState, name: &str) -> Result<Json<crate::scheduler::RunOutcome>, ApiError> {
    match state.scheduler.trigger(name).await? {
        Some(outcome) => Ok(Json(outcome)),
        None => Err(ApiError::Conflict(format!("Job '{}' is already running", name))),
    }
}

async fn list_jobs(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.scheduler.jobs())
}

async fn list_cron_logs(
    State(state): State<SharedState>,
    Query(query): Query<ListCronLogsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = page_limit(query.limit);
    let logs = state
        .db
        .call_with_timeout("list_cron_logs", state.config.store.timeout(), move |db| {
            db.list_cron_logs(query.job.as_deref(), limit)
        })
        .await?;
    Ok(Json(logs))
}

async fn pipeline_stats(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let stats = state
        .db
        .call_with_timeout("pipeline_stats", state.config.store.timeout(), |db| db.pipeline_stats())
        .await?;
    Ok(Json(stats))
}

// ── Tests ─────────────────────────────────────────────────────────────
