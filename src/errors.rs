//! Typed error hierarchy for the selfheal pipeline.
//!
//! Two top-level enums:
//! - `PipelineError`: store, job and collaborator failures
//! - `ConfigError`: configuration load and parse failures
//!
//! Jobs never let an error escape the scheduler. `is_transient()` tells a job
//! whether to abort the current run (retry next tick) or skip a single row.

use thiserror::Error;

/// Errors from the store, the scheduled jobs and the HTTP surface.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Bug {id} not found")]
    BugNotFound { id: i64 },

    #[error("Fix suggestion {id} not found")]
    SuggestionNotFound { id: String },

    #[error("Outbox event {id} not found")]
    EventNotFound { id: String },

    #[error("Invalid status transition from '{from}' to '{to}'")]
    InvalidTransition { from: String, to: String },

    #[error("Could not allocate a unique bug code after {attempts} attempts")]
    BugCodeExhausted { attempts: u32 },

    #[error("Store operation '{operation}' timed out after {timeout_secs}s")]
    StoreTimeout {
        operation: String,
        timeout_secs: u64,
    },

    #[error("Unknown job '{name}'")]
    UnknownJob { name: String },

    #[error("{collaborator} failed: {message}")]
    Collaborator {
        collaborator: &'static str,
        message: String,
    },

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    /// Connection, timeout and collaborator failures clear up on their own;
    /// the owning row stays untouched and the next tick retries it.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::StoreTimeout { .. } | Self::Database(_) | Self::Collaborator { .. }
        )
    }

    pub fn collaborator(collaborator: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Collaborator {
            collaborator,
            message: err.to_string(),
        }
    }
}

/// Errors while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {source}")]
    Read {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Failed to write config file at {path}: {source}")]
    Write {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bug_not_found_carries_id() {
        let err = PipelineError::BugNotFound { id: 42 };
        match &err {
            PipelineError::BugNotFound { id } => assert_eq!(*id, 42),
            _ => panic!("Expected BugNotFound"),
        }
        assert!(err.to_string().contains("42"));
    }

    #[test]
    fn invalid_transition_names_both_states() {
        let err = PipelineError::InvalidTransition {
            from: "resolved".into(),
            to: "open".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("resolved"));
        assert!(msg.contains("open"));
    }

    #[test]
    fn transient_classification() {
        assert!(
            PipelineError::StoreTimeout {
                operation: "scan".into(),
                timeout_secs: 30
            }
            .is_transient()
        );
        assert!(PipelineError::collaborator("analyzer", "connection refused").is_transient());
        assert!(PipelineError::Database(anyhow::anyhow!("locked")).is_transient());
        assert!(!PipelineError::BugNotFound { id: 1 }.is_transient());
        assert!(!PipelineError::BugCodeExhausted { attempts: 5 }.is_transient());
    }

    #[test]
    fn collaborator_error_names_collaborator() {
        let err = PipelineError::collaborator("event bus", "503 Service Unavailable");
        assert_eq!(err.to_string(), "event bus failed: 503 Service Unavailable");
    }

    #[test]
    fn other_converts_from_anyhow() {
        let err: PipelineError = anyhow::anyhow!("boom").into();
        assert!(matches!(err, PipelineError::Other(_)));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&PipelineError::UnknownJob { name: "x".into() });
        let cfg_err = ConfigError::Read {
            path: "/nope".into(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        };
        assert_std_error(&cfg_err);
    }
}
