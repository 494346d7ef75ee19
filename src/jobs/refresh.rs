//! Periodic `refresh_expiry_summary` call, bounded by the bulk timeout.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::clients::AggregateRefresher;
use crate::config::JOB_EXPIRY_REFRESH;
use crate::errors::PipelineError;
use crate::scheduler::Job;

pub struct ExpiryRefreshJob {
    refresher: Arc<dyn AggregateRefresher>,
    shop_id: Option<String>,
    timeout: Duration,
}

impl ExpiryRefreshJob {
    pub fn new(refresher: Arc<dyn AggregateRefresher>, shop_id: Option<String>, timeout: Duration) -> Self {
        Self {
            refresher,
            shop_id,
            timeout,
        }
    }

    pub async fn refresh(&self) -> Result<String, PipelineError> {
        let call = self.refresher.refresh_expiry_summary(self.shop_id.as_deref());
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(())) => Ok(match &self.shop_id {
                Some(shop) => format!("expiry summary refreshed for shop {}", shop),
                None => "expiry summary refreshed for all shops".to_string(),
            }),
            Ok(Err(e)) => Err(PipelineError::collaborator("expiry refresh", format!("{:#}", e))),
            Err(_) => Err(PipelineError::StoreTimeout {
                operation: "refresh_expiry_summary".to_string(),
                timeout_secs: self.timeout.as_secs(),
            }),
        }
    }
}

#[async_trait]
impl Job for ExpiryRefreshJob {
    fn name(&self) -> &str {
        JOB_EXPIRY_REFRESH
    }

    async fn run(&self) -> anyhow::Result<String> {
        Ok(self.refresh().await?)
    }
}
