//! CLI command implementations.
//!
//! | Module    | Commands handled      |
//! |-----------|-----------------------|
//! | `init`    | `Init`                |
//! | `serve`   | `Serve`               |
//! | `collect` | `Collect`             |
//! | `jobs`    | `RunJob`, `Jobs`      |
//! | `config`  | `Config`              |

pub mod collect;
pub mod config;
pub mod init;
pub mod jobs;
pub mod serve;

pub use collect::cmd_collect;
pub use config::cmd_config;
pub use init::cmd_init;
pub use jobs::{cmd_jobs, cmd_run_job};
pub use serve::cmd_serve;
