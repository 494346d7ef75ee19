//! Project setup: `selfheal init`.

use std::path::Path;

use anyhow::{Context, Result};
use selfheal::config::SelfHealConfig;
use selfheal::server::open_database;

/// Write a default config at `config_path` (unless one exists) and create the
/// database it points at.
pub fn cmd_init(config_path: &Path, force: bool) -> Result<()> {
    let config = if config_path.exists() && !force {
        println!("Config already exists at {}", config_path.display());
        SelfHealConfig::load(config_path)?
    } else {
        let config = SelfHealConfig::default();
        config
            .save(config_path)
            .context("Failed to write default config")?;
        println!("Wrote config to {}", config_path.display());
        config
    };

    open_database(&config.server.db_path)?;
    println!("Pipeline database ready at {}", config.server.db_path.display());

    for warning in config.validate() {
        println!("  warning: {}", warning);
    }
    Ok(())
}
