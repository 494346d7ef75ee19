//! Contracts for the services the pipeline delegates to, and their HTTP
//! implementations.
//!
//! Jobs depend on the traits only; `serve` wires the HTTP clients from
//! `[collaborators]` and tests substitute in-process fakes.

mod analysis;
mod bus;
mod core_api;
mod patch;
mod refresh;

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use selfheal_common::{BugRecord, FixSuggestion};
use serde::{Deserialize, Serialize};

pub use analysis::HttpAnalyzer;
pub use bus::{HttpBus, LogBus};
pub use core_api::{BugIngest, CoreApiClient};
pub use patch::HttpPatcher;
pub use refresh::HttpRefresher;

/// A candidate patch returned alongside an analysis.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SuggestedFix {
    #[serde(default)]
    pub title: Option<String>,
    pub diff: String,
    #[serde(default)]
    pub confidence: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Analysis {
    pub summary: String,
    #[serde(default)]
    pub suggestions: Vec<SuggestedFix>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PatchOutcome {
    pub success: bool,
    #[serde(default)]
    pub note: String,
}

#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, bug: &BugRecord) -> anyhow::Result<Analysis>;
}

#[async_trait]
pub trait Patcher: Send + Sync {
    /// Apply the suggestion's patch and run the test suite against it.
    async fn apply_and_test(&self, fix: &FixSuggestion) -> anyhow::Result<PatchOutcome>;
}

#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, topic: &str, event_type: &str, payload: &serde_json::Value) -> anyhow::Result<()>;
}

#[async_trait]
pub trait AggregateRefresher: Send + Sync {
    /// Recompute the expiry summary, for one shop or all of them.
    async fn refresh_expiry_summary(&self, shop_id: Option<&str>) -> anyhow::Result<()>;
}

pub(crate) fn http_client(timeout: Duration) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("selfheal/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")
}

pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}
