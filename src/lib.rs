//! Unattended backup of a Postgres server and a site tree.
//!
//! One run takes the lock, exports every database, bundles dumps and files into a verified
//! zip archive, ships it to remote storage and prunes old artifacts on both sides.

pub mod backup;
pub mod config;
pub mod errors;
pub mod source;
pub mod storage;
pub mod utils;

pub use backup::logic::{Orchestrator, RunOutcome, RunSummary};
pub use backup::{BackupRun, RunContext, run_backup_flow};
pub use config::AppConfig;
pub use errors::{BackupError, Result};
