//! The scheduled jobs and their wiring.

mod detection;
mod outbox;
mod refresh;
mod remediation;
mod triage;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use crate::clients::{
    AggregateRefresher, Analyzer, EventBus, HttpAnalyzer, HttpBus, HttpPatcher, HttpRefresher, LogBus, Patcher,
};
use crate::config::{
    JOB_AI_FIX_CHECK, JOB_AUTO_FIX_WORKER, JOB_BUG_SCAN, JOB_EXPIRY_REFRESH, JOB_OUTBOX_PUBLISHER, SelfHealConfig,
};
use crate::scheduler::{Cadence, Job, Scheduler};
use crate::store::DbHandle;

pub use detection::{BugScanJob, ScanReport};
pub use outbox::{OutboxPublisher, PublishReport};
pub use refresh::ExpiryRefreshJob;
pub use remediation::{AutoFixWorker, DispatchReport};
pub use triage::{AiFixCheckJob, TriageReport};

/// Collaborator clients; `None` where no endpoint is configured.
#[derive(Clone)]
pub struct Collaborators {
    pub analyzer: Option<Arc<dyn Analyzer>>,
    pub patcher: Option<Arc<dyn Patcher>>,
    pub bus: Arc<dyn EventBus>,
    pub refresher: Option<Arc<dyn AggregateRefresher>>,
}

impl Collaborators {
    pub fn from_config(config: &SelfHealConfig) -> anyhow::Result<Self> {
        let c = &config.collaborators;
        let interactive = config.store.timeout();

        let analyzer: Option<Arc<dyn Analyzer>> = match &c.analysis_url {
            Some(url) => Some(Arc::new(HttpAnalyzer::new(
                url,
                Duration::from_secs(config.triage.request_timeout_secs),
            )?)),
            None => None,
        };
        let patcher: Option<Arc<dyn Patcher>> = match &c.patch_url {
            Some(url) => Some(Arc::new(HttpPatcher::new(
                url,
                c.repo_url.clone(),
                Duration::from_secs(config.remediation.request_timeout_secs),
            )?)),
            None => None,
        };
        let bus: Arc<dyn EventBus> = match &c.bus_url {
            Some(url) => Arc::new(HttpBus::new(url, interactive)?),
            None => {
                tracing::info!("no bus configured, outbox events will be logged");
                Arc::new(LogBus)
            }
        };
        let refresher: Option<Arc<dyn AggregateRefresher>> = match &c.refresh_url {
            Some(url) => Some(Arc::new(HttpRefresher::new(url, config.store.bulk_timeout())?)),
            None => None,
        };
        Ok(Self {
            analyzer,
            patcher,
            bus,
            refresher,
        })
    }
}

/// Register every enabled job whose collaborators are available.
pub fn build_scheduler(config: &SelfHealConfig, db: DbHandle, collaborators: &Collaborators) -> anyhow::Result<Scheduler> {
    let timeout = config.store.timeout();
    let mut scheduler = Scheduler::new(
        db.clone(),
        timeout,
        Duration::from_secs(config.scheduler.shutdown_grace_secs),
    );

    for (name, schedule) in config.jobs.entries() {
        if !schedule.enabled {
            tracing::info!(job = name, "job disabled");
            continue;
        }
        let cadence = schedule
            .cron
            .parse::<Cadence>()
            .map_err(|e| anyhow::anyhow!(e))
            .with_context(|| format!("Invalid cadence for job {}", name))?;

        let job: Option<Arc<dyn Job>> = match name {
            JOB_BUG_SCAN => Some(Arc::new(BugScanJob::new(db.clone(), config.detection.clone(), timeout)) as Arc<dyn Job>),
            JOB_AI_FIX_CHECK => collaborators.analyzer.clone().map(|analyzer| {
                Arc::new(AiFixCheckJob::new(db.clone(), analyzer, config.triage.clone(), timeout)) as Arc<dyn Job>
            }),
            JOB_AUTO_FIX_WORKER => collaborators.patcher.clone().map(|patcher| {
                Arc::new(AutoFixWorker::new(db.clone(), patcher, config.remediation.clone(), timeout)) as Arc<dyn Job>
            }),
            JOB_OUTBOX_PUBLISHER => Some(Arc::new(OutboxPublisher::new(
                db.clone(),
                collaborators.bus.clone(),
                config.outbox.clone(),
                timeout,
            )) as Arc<dyn Job>),
            JOB_EXPIRY_REFRESH => collaborators.refresher.clone().map(|refresher| {
                Arc::new(ExpiryRefreshJob::new(
                    refresher,
                    config.collaborators.shop_id.clone(),
                    config.store.bulk_timeout(),
                )) as Arc<dyn Job>
            }),
            _ => None,
        };

        match job {
            Some(job) => scheduler.register(job, cadence),
            None => tracing::warn!(job = name, "collaborator not configured, job not scheduled"),
        }
    }
    Ok(scheduler)
}
