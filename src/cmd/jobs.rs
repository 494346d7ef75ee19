//! One-off job runs and the job listing: `selfheal run-job`, `selfheal jobs`.

use anyhow::{Result, bail};
use selfheal::config::SelfHealConfig;
use selfheal::errors::PipelineError;
use selfheal::jobs::{Collaborators, build_scheduler};
use selfheal::scheduler::Scheduler;
use selfheal::server::open_database;
use selfheal_common::CronStatus;

fn scheduler(config: &SelfHealConfig) -> Result<Scheduler> {
    let db = open_database(&config.server.db_path)?;
    let collaborators = Collaborators::from_config(config)?;
    build_scheduler(config, db, &collaborators)
}

pub async fn cmd_run_job(config: &SelfHealConfig, name: &str) -> Result<()> {
    let scheduler = scheduler(config)?;
    let outcome = match scheduler.trigger(name).await {
        Ok(Some(outcome)) => outcome,
        Ok(None) => bail!("Job '{}' is already running", name),
        Err(PipelineError::UnknownJob { .. })
            if config.jobs.entries().iter().any(|(job, _)| *job == name) =>
        {
            bail!(
                "Job '{}' is not scheduled: it is disabled or its collaborator is not configured",
                name
            )
        }
        Err(e) => return Err(e.into()),
    };

    println!(
        "{} {} in {} ms: {}",
        outcome.job,
        outcome.status.as_str(),
        outcome.duration_ms,
        outcome.message
    );
    if outcome.status == CronStatus::Error {
        bail!("Job '{}' failed", name);
    }
    Ok(())
}

pub fn cmd_jobs(config: &SelfHealConfig) -> Result<()> {
    let scheduler = scheduler(config)?;
    let jobs = scheduler.jobs();

    println!("{:<18} {:<20} NEXT RUN (UTC)", "JOB", "CADENCE");
    for (name, schedule) in config.jobs.entries() {
        match jobs.iter().find(|j| j.name == name) {
            Some(job) => {
                let next = job
                    .next_run
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!("{:<18} {:<20} {}", job.name, job.cadence, next);
            }
            None => println!("{:<18} {:<20} not scheduled", name, schedule.cron),
        }
    }
    Ok(())
}
