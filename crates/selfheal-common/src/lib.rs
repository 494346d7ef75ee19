//! Shared domain types for the selfheal pipeline.
//!
//! Both the core service (store, scheduler, jobs, HTTP API) and the
//! out-of-process ingestion gateway depend on this crate so that they agree
//! on severity classification, bug lifecycle, dedup keys and the wire shapes
//! of the ingestion and completion endpoints.

pub mod bug_code;
pub mod dedup;
pub mod models;
pub mod time;

pub use bug_code::{BUG_CODE_PATTERN, generate_bug_code, is_valid_bug_code};
pub use dedup::DedupKey;
pub use models::*;
