pub mod archive;
pub mod compress;
pub mod db_dump;
pub mod literal;
pub mod lock;
pub mod logic;
pub mod notify;
pub mod retention;
pub mod transfer;
pub mod walker;

use chrono::{DateTime, Local};
use std::time::Instant;

use crate::config::{AppConfig, RemoteConfig};
use crate::errors::Result;
use crate::source::postgres::PgSource;
use crate::storage::{DirectoryStore, S3Store};
use crate::utils::deadline::SoftDeadline;
use crate::utils::disk::StatvfsProbe;
use logic::{Orchestrator, RunSummary};

/// `YYYY-MM-DD-HH-mm`, shared by every artifact of a run.
pub const TOKEN_FORMAT: &str = "%Y-%m-%d-%H-%M";

#[derive(Debug, Clone)]
pub struct BackupRun {
    pub started_at: DateTime<Local>,
    pub token: String,
}

impl BackupRun {
    pub fn start() -> Self {
        Self::at(Local::now())
    }

    pub fn at(started_at: DateTime<Local>) -> Self {
        Self {
            token: started_at.format(TOKEN_FORMAT).to_string(),
            started_at,
        }
    }

    pub fn archive_name(&self) -> String {
        format!("backup-{}.zip", self.token)
    }

    pub fn log_name(&self) -> String {
        format!("backup-log-{}.txt", self.token)
    }
}

/// Everything a run needs, fixed before the first stage starts.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub config: AppConfig,
    pub run: BackupRun,
    pub deadline: SoftDeadline,
}

impl RunContext {
    pub fn new(config: AppConfig, run: BackupRun) -> Self {
        let deadline = SoftDeadline::new(
            Instant::now(),
            config.limits.warn_after,
            config.limits.max_run,
        );
        Self {
            config,
            run,
            deadline,
        }
    }
}

/// Runs the whole pipeline against the configured Postgres server and remote backend.
pub async fn run_backup_flow(ctx: &RunContext) -> Result<RunSummary> {
    let source = PgSource::new(&ctx.config.source_db_url)?;
    let summary = match &ctx.config.remote {
        Some(RemoteConfig::S3(s3)) => {
            Orchestrator::new(ctx, source, Some(S3Store::new(s3.clone())), StatvfsProbe)
                .run()
                .await
        }
        Some(RemoteConfig::Directory { root }) => {
            Orchestrator::new(ctx, source, Some(DirectoryStore::new(root)), StatvfsProbe)
                .run()
                .await
        }
        None => {
            Orchestrator::new(ctx, source, None::<DirectoryStore>, StatvfsProbe)
                .run()
                .await
        }
    };
    Ok(summary)
}
