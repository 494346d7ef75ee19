//! Configuration for the selfheal service and ingestion gateway.
//!
//! Read from `.selfheal/selfheal.toml` (or `--config`), then overlaid with
//! environment variables (a `.env` file is loaded first), then CLI flags.
//! Every field has a default, so an empty file is a valid configuration.
//!
//! ```toml
//! [server]
//! port = 8088
//! db_path = ".selfheal/pipeline.db"
//!
//! [log]
//! level = "info"
//! format = "json"
//!
//! [detection]
//! scan_window_secs = 600
//! dedup_window_secs = 3600
//!
//! [jobs.bug_scan]
//! cron = "0 */5 * * * *"
//!
//! [jobs.expiry_refresh]
//! enabled = false
//!
//! [collaborators]
//! analysis_url = "http://ai-service:8000"
//! bus_url = "http://bus-bridge:9000"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;
use crate::logging::LogConfig;
use crate::scheduler::Cadence;

pub const DEFAULT_CONFIG_DIR: &str = ".selfheal";
pub const DEFAULT_CONFIG_FILE: &str = "selfheal.toml";

/// Job names as they appear in logs, the cron audit table and the API.
pub const JOB_BUG_SCAN: &str = "bug-scan";
pub const JOB_AI_FIX_CHECK: &str = "ai-fix-check";
pub const JOB_OUTBOX_PUBLISHER: &str = "outbox-publisher";
pub const JOB_AUTO_FIX_WORKER: &str = "auto-fix-worker";
pub const JOB_EXPIRY_REFRESH: &str = "expiry-refresh";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Permissive CORS for local dashboards.
    #[serde(default)]
    pub dev_mode: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8088
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".selfheal/pipeline.db")
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            db_path: default_db_path(),
            dev_mode: false,
        }
    }
}

/// Store timeouts: interactive paths vs bulk refreshes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_bulk_timeout")]
    pub bulk_timeout_secs: u64,
}

fn default_store_timeout() -> u64 {
    30
}

fn default_bulk_timeout() -> u64 {
    300
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_store_timeout(),
            bulk_timeout_secs: default_bulk_timeout(),
        }
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn bulk_timeout(&self) -> Duration {
        Duration::from_secs(self.bulk_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// How long in-flight runs may continue after shutdown is requested.
    #[serde(default = "default_grace")]
    pub shutdown_grace_secs: u64,
}

fn default_grace() -> u64 {
    30
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            shutdown_grace_secs: default_grace(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Trailing window the bug scan reads telemetry from.
    #[serde(default = "default_scan_window")]
    pub scan_window_secs: u64,
    /// A key already recorded within this window is not recorded again.
    #[serde(default = "default_dedup_window")]
    pub dedup_window_secs: u64,
    #[serde(default = "default_max_code_attempts")]
    pub max_code_attempts: u32,
}

fn default_scan_window() -> u64 {
    600
}

fn default_dedup_window() -> u64 {
    3600
}

fn default_max_code_attempts() -> u32 {
    5
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            scan_window_secs: default_scan_window(),
            dedup_window_secs: default_dedup_window(),
            max_code_attempts: default_max_code_attempts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriageConfig {
    #[serde(default = "default_triage_batch")]
    pub batch_size: i64,
    #[serde(default = "default_backlog_hours")]
    pub backlog_hours: i64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_triage_batch() -> i64 {
    10
}

fn default_backlog_hours() -> i64 {
    24
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self {
            batch_size: default_triage_batch(),
            backlog_hours: default_backlog_hours(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationConfig {
    #[serde(default = "default_remediation_batch")]
    pub batch_size: i64,
    /// Failed dispatches before a suggestion is escalated to manual work.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i64,
    #[serde(default = "default_patch_timeout")]
    pub request_timeout_secs: u64,
}

fn default_remediation_batch() -> i64 {
    20
}

fn default_max_attempts() -> i64 {
    5
}

fn default_patch_timeout() -> u64 {
    600
}

impl Default for RemediationConfig {
    fn default() -> Self {
        Self {
            batch_size: default_remediation_batch(),
            max_attempts: default_max_attempts(),
            request_timeout_secs: default_patch_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxConfig {
    #[serde(default = "default_outbox_batch")]
    pub batch_size: i64,
    /// Store retries for the mark-published step after a successful send.
    #[serde(default = "default_mark_retries")]
    pub mark_retries: u32,
}

fn default_outbox_batch() -> i64 {
    100
}

fn default_mark_retries() -> u32 {
    3
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            batch_size: default_outbox_batch(),
            mark_retries: default_mark_retries(),
        }
    }
}

/// Cadence and on/off switch for one scheduled job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSchedule {
    pub cron: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl JobSchedule {
    fn every(cron: &str) -> Self {
        Self {
            cron: cron.to_string(),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    #[serde(default = "default_bug_scan")]
    pub bug_scan: JobSchedule,
    #[serde(default = "default_ai_fix_check")]
    pub ai_fix_check: JobSchedule,
    #[serde(default = "default_outbox_publisher")]
    pub outbox_publisher: JobSchedule,
    #[serde(default = "default_auto_fix_worker")]
    pub auto_fix_worker: JobSchedule,
    #[serde(default = "default_expiry_refresh")]
    pub expiry_refresh: JobSchedule,
}

fn default_bug_scan() -> JobSchedule {
    JobSchedule::every("0 */5 * * * *")
}

fn default_ai_fix_check() -> JobSchedule {
    JobSchedule::every("0 0 * * * *")
}

fn default_outbox_publisher() -> JobSchedule {
    JobSchedule::every("*/30 * * * * *")
}

fn default_auto_fix_worker() -> JobSchedule {
    JobSchedule::every("*/30 * * * * *")
}

fn default_expiry_refresh() -> JobSchedule {
    JobSchedule::every("@hourly")
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            bug_scan: default_bug_scan(),
            ai_fix_check: default_ai_fix_check(),
            outbox_publisher: default_outbox_publisher(),
            auto_fix_worker: default_auto_fix_worker(),
            expiry_refresh: default_expiry_refresh(),
        }
    }
}

impl JobsConfig {
    /// `(job name, schedule)` pairs in registration order.
    pub fn entries(&self) -> [(&'static str, &JobSchedule); 5] {
        [
            (JOB_BUG_SCAN, &self.bug_scan),
            (JOB_AI_FIX_CHECK, &self.ai_fix_check),
            (JOB_OUTBOX_PUBLISHER, &self.outbox_publisher),
            (JOB_AUTO_FIX_WORKER, &self.auto_fix_worker),
            (JOB_EXPIRY_REFRESH, &self.expiry_refresh),
        ]
    }
}

/// Endpoints of the services the pipeline talks to. Unset means "not
/// available": the corresponding job is skipped or falls back (the event
/// bus falls back to logging).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollaboratorsConfig {
    /// Core API base URL, used by the ingestion gateway.
    #[serde(default)]
    pub api_url: Option<String>,
    /// Repository the patch collaborator applies fixes to.
    #[serde(default)]
    pub repo_url: Option<String>,
    #[serde(default)]
    pub analysis_url: Option<String>,
    #[serde(default)]
    pub patch_url: Option<String>,
    #[serde(default)]
    pub bus_url: Option<String>,
    #[serde(default)]
    pub refresh_url: Option<String>,
    /// Scope passed to the aggregate refresh; all shops when unset.
    #[serde(default)]
    pub shop_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// JSON-lines log file the gateway tails.
    #[serde(default)]
    pub source_path: Option<PathBuf>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_dedup_window")]
    pub dedup_ttl_secs: u64,
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: u64,
}

fn default_poll_interval() -> u64 {
    5
}

fn default_dedup_capacity() -> u64 {
    10_000
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            source_path: None,
            poll_interval_secs: default_poll_interval(),
            dedup_ttl_secs: default_dedup_window(),
            dedup_capacity: default_dedup_capacity(),
        }
    }
}

/// Root of `selfheal.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelfHealConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub triage: TriageConfig,
    #[serde(default)]
    pub remediation: RemediationConfig,
    #[serde(default)]
    pub outbox: OutboxConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub collaborators: CollaboratorsConfig,
    #[serde(default)]
    pub collector: CollectorConfig,
}

impl SelfHealConfig {
    pub fn default_path(project_dir: &Path) -> PathBuf {
        project_dir.join(DEFAULT_CONFIG_DIR).join(DEFAULT_CONFIG_FILE)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load `path` if it exists, otherwise start from defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Overlay values from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Overlay using an arbitrary lookup (the environment, or a map in tests).
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let c = &mut self.collaborators;
        for (key, slot) in [
            ("SELFHEAL_API_URL", &mut c.api_url),
            ("SELFHEAL_REPO_URL", &mut c.repo_url),
            ("SELFHEAL_ANALYSIS_URL", &mut c.analysis_url),
            ("SELFHEAL_PATCH_URL", &mut c.patch_url),
            ("SELFHEAL_BUS_URL", &mut c.bus_url),
            ("SELFHEAL_REFRESH_URL", &mut c.refresh_url),
        ] {
            if let Some(value) = non_empty(key) {
                *slot = Some(value);
            }
        }
        if let Some(path) = non_empty("SELFHEAL_DB_PATH") {
            self.server.db_path = PathBuf::from(path);
        }
        if let Some(port) = non_empty("SELFHEAL_PORT").and_then(|p| p.parse().ok()) {
            self.server.port = port;
        }
    }

    /// Human-readable problems; empty means the configuration is usable.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        for (name, schedule) in self.jobs.entries() {
            if let Err(e) = schedule.cron.parse::<Cadence>() {
                warnings.push(format!("jobs.{}: invalid cron '{}': {}", name, schedule.cron, e));
            }
        }
        for (field, value) in [
            ("triage.batch_size", self.triage.batch_size),
            ("remediation.batch_size", self.remediation.batch_size),
            ("remediation.max_attempts", self.remediation.max_attempts),
            ("outbox.batch_size", self.outbox.batch_size),
        ] {
            if value <= 0 {
                warnings.push(format!("{} must be positive (got {})", field, value));
            }
        }
        if self.detection.max_code_attempts == 0 {
            warnings.push("detection.max_code_attempts must be positive".to_string());
        }
        if self.detection.scan_window_secs == 0 {
            warnings.push("detection.scan_window_secs must be positive".to_string());
        }
        if self.jobs.ai_fix_check.enabled && self.collaborators.analysis_url.is_none() {
            warnings.push("ai-fix-check is enabled but collaborators.analysis_url is unset".to_string());
        }
        if self.jobs.auto_fix_worker.enabled && self.collaborators.patch_url.is_none() {
            warnings.push("auto-fix-worker is enabled but collaborators.patch_url is unset".to_string());
        }
        if self.jobs.expiry_refresh.enabled && self.collaborators.refresh_url.is_none() {
            warnings.push("expiry-refresh is enabled but collaborators.refresh_url is unset".to_string());
        }
        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = SelfHealConfig::parse("").unwrap();
        assert_eq!(config.server.port, 8088);
        assert_eq!(config.detection.scan_window_secs, 600);
        assert_eq!(config.detection.dedup_window_secs, 3600);
        assert_eq!(config.triage.batch_size, 10);
        assert_eq!(config.triage.backlog_hours, 24);
        assert_eq!(config.outbox.batch_size, 100);
        assert_eq!(config.store.timeout_secs, 30);
        assert_eq!(config.jobs.outbox_publisher.cron, "*/30 * * * * *");
        assert!(config.jobs.bug_scan.enabled);
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let config = SelfHealConfig::parse(
            r#"
            [detection]
            scan_window_secs = 120

            [jobs.expiry_refresh]
            cron = "@daily"
            enabled = false
            "#,
        )
        .unwrap();
        assert_eq!(config.detection.scan_window_secs, 120);
        assert_eq!(config.detection.dedup_window_secs, 3600);
        assert!(!config.jobs.expiry_refresh.enabled);
        assert_eq!(config.jobs.bug_scan.cron, "0 */5 * * * *");
    }

    #[test]
    fn test_unknown_format_is_a_parse_error() {
        let err = SelfHealConfig::parse("[log]\nformat = \"xml\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_env_overrides_collaborators() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("SELFHEAL_API_URL", "http://core:8088"),
            ("SELFHEAL_BUS_URL", ""),
            ("SELFHEAL_DB_PATH", "/var/lib/selfheal.db"),
            ("SELFHEAL_PORT", "9999"),
        ]);
        let mut config = SelfHealConfig::default();
        config.collaborators.bus_url = Some("http://kept".to_string());
        config.apply_env_from(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.collaborators.api_url.as_deref(), Some("http://core:8088"));
        assert_eq!(config.collaborators.bus_url.as_deref(), Some("http://kept"));
        assert_eq!(config.server.db_path, PathBuf::from("/var/lib/selfheal.db"));
        assert_eq!(config.server.port, 9999);
    }

    #[test]
    fn test_validate_flags_bad_cron_and_batches() {
        let mut config = SelfHealConfig::default();
        config.jobs.bug_scan.cron = "every now and then".to_string();
        config.outbox.batch_size = 0;
        let warnings = config.validate();
        assert!(warnings.iter().any(|w| w.contains("jobs.bug-scan")));
        assert!(warnings.iter().any(|w| w.contains("outbox.batch_size")));
    }

    #[test]
    fn test_validate_default_cadences_parse() {
        let config = SelfHealConfig::default();
        assert!(!config.validate().iter().any(|w| w.contains("invalid cron")));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = SelfHealConfig::default_path(dir.path());
        let mut config = SelfHealConfig::default();
        config.remediation.max_attempts = 7;
        config.save(&path).unwrap();

        let loaded = SelfHealConfig::load(&path).unwrap();
        assert_eq!(loaded.remediation.max_attempts, 7);
        assert!(SelfHealConfig::load_or_default(&dir.path().join("missing.toml")).is_ok());
    }
}
