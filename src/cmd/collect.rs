//! Ingestion gateway: `selfheal collect`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use selfheal::clients::CoreApiClient;
use selfheal::collector::{Collector, FileTailSource};
use selfheal::config::SelfHealConfig;
use tokio_util::sync::CancellationToken;

pub async fn cmd_collect(config: SelfHealConfig, source: Option<PathBuf>, from_start: bool) -> Result<()> {
    let api_url = config
        .collaborators
        .api_url
        .as_deref()
        .context("collaborators.api_url (or SELFHEAL_API_URL) must be set to run the collector")?;
    let path = source
        .or_else(|| config.collector.source_path.clone())
        .context("No log source: pass --source or set collector.source_path")?;

    let client = CoreApiClient::new(api_url, config.store.timeout())?;
    let collector = Collector::from_config(Arc::new(client), &config.collector);
    let tail = if from_start {
        FileTailSource::new(path)
    } else {
        FileTailSource::from_end(path)
    };

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        selfheal::server::shutdown_signal().await;
        token.cancel();
    });

    let stats = collector
        .run(tail, Duration::from_secs(config.collector.poll_interval_secs), shutdown)
        .await;
    println!("{}", stats);
    Ok(())
}
