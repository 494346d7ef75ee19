use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use selfheal_common::FixSuggestion;
use serde::Serialize;

use super::{PatchOutcome, Patcher, http_client, join_url};

#[derive(Debug, Serialize)]
struct ApplyRequest<'a> {
    suggestion_id: &'a str,
    bug_id: i64,
    diff_patch: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    repo_url: Option<&'a str>,
}

/// Client for the patch-apply-and-test runner.
///
/// A 2xx response carries the outcome; a failed test run is a normal
/// `success: false` outcome, while transport errors and non-2xx statuses
/// are errors.
pub struct HttpPatcher {
    client: reqwest::Client,
    base_url: String,
    repo_url: Option<String>,
}

impl HttpPatcher {
    pub fn new(base_url: &str, repo_url: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            base_url: base_url.to_string(),
            repo_url,
        })
    }
}

#[async_trait]
impl Patcher for HttpPatcher {
    async fn apply_and_test(&self, fix: &FixSuggestion) -> anyhow::Result<PatchOutcome> {
        let body = ApplyRequest {
            suggestion_id: &fix.id,
            bug_id: fix.bug_id,
            diff_patch: &fix.diff_patch,
            repo_url: self.repo_url.as_deref(),
        };
        self.client
            .post(join_url(&self.base_url, "/apply"))
            .json(&body)
            .send()
            .await
            .context("Failed to send patch request")?
            .error_for_status()
            .context("Patch runner returned error status")?
            .json::<PatchOutcome>()
            .await
            .context("Failed to parse patch outcome")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::testing::serve;
    use axum::{Json, Router, routing::post};

    fn fix() -> FixSuggestion {
        FixSuggestion {
            id: "fix-1".to_string(),
            bug_id: 7,
            diff_patch: "+ guard".to_string(),
            confidence: 0.9,
            approved: true,
            executed: false,
            attempts: 0,
            last_error: None,
            needs_manual: false,
            created_at: "2026-04-01T10:00:00.000Z".to_string(),
        }
    }

    #[tokio::test]
    async fn test_apply_sends_repo_and_reads_outcome() {
        let router = Router::new().route(
            "/apply",
            post(|Json(body): Json<serde_json::Value>| async move {
                assert_eq!(body["suggestion_id"], "fix-1");
                assert_eq!(body["repo_url"], "git@example.com:shop/api.git");
                Json(serde_json::json!({"success": false, "note": "2 tests failed"}))
            }),
        );
        let base = serve(router).await;
        let patcher = HttpPatcher::new(
            &base,
            Some("git@example.com:shop/api.git".to_string()),
            Duration::from_secs(5),
        )
        .unwrap();

        let outcome = patcher.apply_and_test(&fix()).await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.note, "2 tests failed");
    }
}
