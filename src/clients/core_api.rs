use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use selfheal_common::{IngestBugRequest, IngestBugResponse};

use super::{http_client, join_url};

const INGEST_PATH: &str = "/api/bugs/ingest";

/// Where the ingestion gateway sends normalised bug reports.
#[async_trait]
pub trait BugIngest: Send + Sync {
    async fn submit(&self, report: &IngestBugRequest) -> anyhow::Result<IngestBugResponse>;
}

/// Client for the core API's ingestion endpoint.
pub struct CoreApiClient {
    client: reqwest::Client,
    base_url: String,
}

impl CoreApiClient {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            base_url: base_url.to_string(),
        })
    }
}

#[async_trait]
impl BugIngest for CoreApiClient {
    async fn submit(&self, report: &IngestBugRequest) -> anyhow::Result<IngestBugResponse> {
        self.client
            .post(join_url(&self.base_url, INGEST_PATH))
            .json(report)
            .send()
            .await
            .context("Failed to send bug report to core API")?
            .error_for_status()
            .context("Core API rejected bug report")?
            .json::<IngestBugResponse>()
            .await
            .context("Failed to parse ingest response")
    }
}
