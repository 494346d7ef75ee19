//! Configuration view and validation: `selfheal config`.

use std::path::Path;

use anyhow::Result;
use selfheal::config::SelfHealConfig;

use super::super::ConfigCommands;

pub fn cmd_config(config_path: &Path, config: &SelfHealConfig, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            if config_path.exists() {
                println!("# {}", config_path.display());
            } else {
                println!("# {} (not found, showing defaults)", config_path.display());
            }
            print!("{}", toml::to_string_pretty(config)?);
        }
        Some(ConfigCommands::Validate) => {
            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                for warning in &warnings {
                    println!("warning: {}", warning);
                }
                println!("{} warning(s).", warnings.len());
            }
        }
    }
    Ok(())
}
