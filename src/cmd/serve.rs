//! API server and scheduler: `selfheal serve`.

use anyhow::Result;
use selfheal::config::SelfHealConfig;

pub async fn cmd_serve(mut config: SelfHealConfig, port: Option<u16>, dev: bool) -> Result<()> {
    if let Some(port) = port {
        config.server.port = port;
    }
    if dev {
        config.server.dev_mode = true;
    }
    for warning in config.validate() {
        tracing::warn!("config: {}", warning);
    }
    selfheal::server::start_server(config).await
}
