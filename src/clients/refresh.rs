use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;

use super::{AggregateRefresher, http_client};

#[derive(Debug, Serialize)]
struct RefreshRequest<'a> {
    shop_id: Option<&'a str>,
}

/// Triggers the `refresh_expiry_summary` computation behind an HTTP endpoint.
/// The call runs under the bulk timeout.
pub struct HttpRefresher {
    client: reqwest::Client,
    url: String,
}

impl HttpRefresher {
    pub fn new(url: &str, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl AggregateRefresher for HttpRefresher {
    async fn refresh_expiry_summary(&self, shop_id: Option<&str>) -> anyhow::Result<()> {
        self.client
            .post(&self.url)
            .json(&RefreshRequest { shop_id })
            .send()
            .await
            .context("Failed to send expiry summary refresh")?
            .error_for_status()
            .context("Expiry summary refresh returned error status")?;
        Ok(())
    }
}
