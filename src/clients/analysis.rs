use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use selfheal_common::BugRecord;
use serde::{Deserialize, Serialize};

use super::{Analysis, Analyzer, SuggestedFix, http_client, join_url};

const FIX_PATH: &str = "/api/v1/ai/fix";

#[derive(Debug, Serialize)]
struct FixRequest<'a> {
    bug_id: &'a str,
    context: FixContext<'a>,
}

#[derive(Debug, Serialize)]
struct FixContext<'a> {
    service_name: &'a str,
    module: Option<&'a str>,
    severity: &'a str,
    title: &'a str,
    details: &'a str,
    log_excerpt: Option<&'a str>,
    http_status: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct FixResponse {
    #[serde(default)]
    analysis: Option<String>,
    #[serde(default)]
    fix_suggestions: Vec<SuggestedFix>,
}

impl FixResponse {
    /// The service may omit a prose analysis; fall back to the suggestion
    /// titles so the bug still records what was proposed.
    fn into_analysis(self) -> Analysis {
        let summary = match self.analysis.filter(|a| !a.trim().is_empty()) {
            Some(text) => text,
            None => {
                let titles: Vec<&str> = self
                    .fix_suggestions
                    .iter()
                    .filter_map(|s| s.title.as_deref())
                    .collect();
                if titles.is_empty() {
                    format!("{} fix suggestion(s) proposed", self.fix_suggestions.len())
                } else {
                    titles.join("; ")
                }
            }
        };
        Analysis {
            summary,
            suggestions: self.fix_suggestions,
        }
    }
}

/// Client for the AI debug analyzer.
pub struct HttpAnalyzer {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAnalyzer {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            base_url: base_url.to_string(),
        })
    }
}

#[async_trait]
impl Analyzer for HttpAnalyzer {
    async fn analyze(&self, bug: &BugRecord) -> anyhow::Result<Analysis> {
        let body = FixRequest {
            bug_id: &bug.bug_code,
            context: FixContext {
                service_name: &bug.service_name,
                module: bug.module.as_deref(),
                severity: bug.severity.as_str(),
                title: &bug.title,
                details: &bug.details,
                log_excerpt: bug.log_excerpt.as_deref(),
                http_status: bug.http_status,
            },
        };
        let resp: FixResponse = self
            .client
            .post(join_url(&self.base_url, FIX_PATH))
            .json(&body)
            .send()
            .await
            .context("Failed to send analysis request")?
            .error_for_status()
            .context("Analysis service returned error status")?
            .json()
            .await
            .context("Failed to parse analysis response")?;
        Ok(resp.into_analysis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::testing::serve;
    use axum::{Json, Router, routing::post};
    use selfheal_common::{BugStatus, Severity};

    fn bug() -> BugRecord {
        BugRecord {
            id: 1,
            bug_code: "BUG-20260401-ab12".to_string(),
            service_name: "orders".to_string(),
            module: None,
            severity: Severity::High,
            title: "orders: boom".to_string(),
            details: "boom".to_string(),
            log_excerpt: None,
            http_status: Some(500),
            status: BugStatus::Open,
            ai_analysis: None,
            dedup_key: "orders\u{1f}boom".to_string(),
            created_at: "2026-04-01T10:00:00.000Z".to_string(),
            updated_at: "2026-04-01T10:00:00.000Z".to_string(),
        }
    }

    #[test]
    fn test_summary_falls_back_to_titles() {
        let resp: FixResponse = serde_json::from_value(serde_json::json!({
            "bug_id": "BUG-20260401-ab12",
            "fix_suggestions": [
                {"id": "x", "title": "Add nil-check", "diff": "--- a\n+++ b", "confidence": 0.92}
            ]
        }))
        .unwrap();
        let analysis = resp.into_analysis();
        assert_eq!(analysis.summary, "Add nil-check");
        assert_eq!(analysis.suggestions.len(), 1);
        assert!((analysis.suggestions[0].confidence - 0.92).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_analyze_posts_bug_context() {
        let router = Router::new().route(
            FIX_PATH,
            post(|Json(body): Json<serde_json::Value>| async move {
                assert_eq!(body["bug_id"], "BUG-20260401-ab12");
                assert_eq!(body["context"]["service_name"], "orders");
                Json(serde_json::json!({
                    "analysis": "nil dereference in handler",
                    "fix_suggestions": [{"title": "guard", "diff": "+ if x.is_none() { return }", "confidence": 0.5}]
                }))
            }),
        );
        let base = serve(router).await;
        let analyzer = HttpAnalyzer::new(&base, Duration::from_secs(5)).unwrap();

        let analysis = analyzer.analyze(&bug()).await.unwrap();
        assert_eq!(analysis.summary, "nil dereference in handler");
        assert_eq!(analysis.suggestions[0].title.as_deref(), Some("guard"));
    }

    #[tokio::test]
    async fn test_error_status_is_an_error() {
        let router = Router::new().route(
            FIX_PATH,
            post(|| async { (axum::http::StatusCode::SERVICE_UNAVAILABLE, "busy") }),
        );
        let base = serve(router).await;
        let analyzer = HttpAnalyzer::new(&base, Duration::from_secs(5)).unwrap();
        assert!(analyzer.analyze(&bug()).await.is_err());
    }
}
