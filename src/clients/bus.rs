use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;

use super::{EventBus, http_client, join_url};

#[derive(Debug, Serialize)]
struct PublishRequest<'a> {
    event_type: &'a str,
    payload: &'a serde_json::Value,
}

/// Publishes through an HTTP bridge in front of the message broker:
/// `POST {bus_url}/topics/{topic}`.
pub struct HttpBus {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBus {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            base_url: base_url.to_string(),
        })
    }
}

#[async_trait]
impl EventBus for HttpBus {
    async fn publish(&self, topic: &str, event_type: &str, payload: &serde_json::Value) -> anyhow::Result<()> {
        self.client
            .post(join_url(&self.base_url, &format!("/topics/{}", topic)))
            .json(&PublishRequest { event_type, payload })
            .send()
            .await
            .with_context(|| format!("Failed to publish to topic {}", topic))?
            .error_for_status()
            .with_context(|| format!("Bus rejected event for topic {}", topic))?;
        Ok(())
    }
}

/// Used when no bus is configured: events are logged and count as sent.
#[derive(Debug, Default)]
pub struct LogBus;

#[async_trait]
impl EventBus for LogBus {
    async fn publish(&self, topic: &str, event_type: &str, payload: &serde_json::Value) -> anyhow::Result<()> {
        tracing::info!(topic, event_type, payload = %payload, "event published (log bus)");
        Ok(())
    }
}
