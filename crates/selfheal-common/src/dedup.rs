//! Dedup keys shared by the bug scan, the ingest endpoint and the gateway.
//!
//! A key is `(source, reason)`: `(service, message)` for log entries and
//! `(topic, error_reason)` for dead-letter entries. Any record carrying the
//! same key inside the dedup window is treated as the same failure.

use std::fmt;

use serde::{Deserialize, Serialize};

const SEPARATOR: char = '\u{1f}';

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DedupKey(String);

impl DedupKey {
    pub fn new(source: &str, reason: &str) -> Self {
        Self(format!("{}{}{}", source.trim(), SEPARATOR, reason.trim()))
    }

    pub fn for_log(service: &str, message: &str) -> Self {
        Self::new(service, message)
    }

    pub fn for_dlq(topic: &str, error_reason: &str) -> Self {
        Self::new(topic, error_reason)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (source, reason) = self.0.split_once(SEPARATOR).unwrap_or((&self.0, ""));
        write!(f, "{}: {}", source, reason)
    }
}
