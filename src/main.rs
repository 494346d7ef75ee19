use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use selfheal::config::SelfHealConfig;
use selfheal::logging::init_logging;

mod cmd;

#[derive(Parser)]
#[command(name = "selfheal")]
#[command(version, about = "Self-healing operational pipeline: detect, triage, remediate, publish")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to selfheal.toml (defaults to .selfheal/selfheal.toml)
    #[arg(long, global = true, env = "SELFHEAL_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a default config and create the pipeline database
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Serve the HTTP API and run the scheduled jobs
    Serve {
        /// Port to serve on (overrides server.port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Enable dev mode (permissive CORS)
        #[arg(long)]
        dev: bool,
    },
    /// Tail a service log and report failures to the core API
    Collect {
        /// JSON-lines log file (overrides collector.source_path)
        #[arg(long)]
        source: Option<PathBuf>,

        /// Read the file from the beginning instead of only new lines
        #[arg(long)]
        from_start: bool,
    },
    /// Run one job now, through the same guard as scheduled ticks
    RunJob {
        /// Job name, e.g. bug-scan or outbox-publisher
        name: String,
    },
    /// List scheduled jobs with their cadence and next fire time
    Jobs,
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Check the configuration for problems
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config_path = match cli.config.clone() {
        Some(path) => path,
        None => SelfHealConfig::default_path(
            &std::env::current_dir().context("Failed to get current directory")?,
        ),
    };

    let command = match cli.command {
        Commands::Init { force } => return cmd::cmd_init(&config_path, force),
        command => command,
    };

    let mut config = SelfHealConfig::load_or_default(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    config.apply_env();

    let _log_guard = init_logging(&config.log, cli.verbose).context("Failed to initialise logging")?;

    match command {
        Commands::Init { .. } => {}
        Commands::Serve { port, dev } => cmd::cmd_serve(config, port, dev).await?,
        Commands::Collect { source, from_start } => cmd::cmd_collect(config, source, from_start).await?,
        Commands::RunJob { name } => cmd::cmd_run_job(&config, &name).await?,
        Commands::Jobs => cmd::cmd_jobs(&config)?,
        Commands::Config { command } => cmd::cmd_config(&config_path, &config, command)?,
    }

    Ok(())
}
