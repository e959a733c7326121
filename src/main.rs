//! Site Backup Tool
//!
//! Command-line entry point; meant to be run from cron.

use clap::Parser;
use sitebackup::backup::notify::{Notification, Notifications, Severity};
use sitebackup::utils::logger;
use sitebackup::{AppConfig, BackupRun, RunContext, run_backup_flow};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "sitebackup", version, about = "Back up databases and site files to local and remote storage")]
struct Args {
    /// Path to the JSON configuration file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let args = Args::parse();

    let config = match AppConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            let _ = logger::init(args.log_level.as_deref().unwrap_or("info"), None);
            error!("❌ Failed to load configuration from {}: {}", args.config.display(), e);
            return ExitCode::FAILURE;
        }
    };

    let run = BackupRun::start();
    let level = args.log_level.clone().unwrap_or_else(|| config.log_level.clone());

    if let Err(e) = config.validate_directories() {
        let _ = logger::init(&level, None);
        error!("❌ {}", e);
        Notifications::from_config(&config.notify)
            .send(Notification {
                severity: Severity::Failure,
                subject: format!("✗ Backup FAILED - {}", run.token),
                body: format!("Error: {}", e),
                run: run.token.clone(),
            })
            .await;
        return ExitCode::FAILURE;
    }

    let log_path = config.local_backup_dir.join(run.log_name());
    if let Err(e) = logger::init(&level, Some(&log_path)) {
        eprintln!("❌ Failed to initialise logging at {}: {:#}", log_path.display(), e);
        return ExitCode::FAILURE;
    }
    info!("Log file: {}", log_path.display());

    let ctx = RunContext::new(config, run);
    tokio::select! {
        result = run_backup_flow(&ctx) => match result {
            Ok(summary) => {
                info!("Run finished: {:?}", summary.outcome);
                ExitCode::from(summary.outcome.exit_status())
            }
            Err(e) => {
                error!("❌ Error: {}", e);
                ExitCode::FAILURE
            }
        },
        signal = shutdown_signal() => {
            error!("FATAL: received {}, backup aborted", signal);
            ExitCode::FAILURE
        }
    }
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => "SIGINT",
        _ = terminate => "SIGTERM",
    }
}
