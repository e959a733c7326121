use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Backup already running (started: {started}, pid: {pid})")]
    LockContention { started: String, pid: u32 },

    #[error("Export of database {database} failed: {reason}")]
    Export { database: String, reason: String },

    #[error("Archive creation failed: {0}")]
    Archive(String),

    #[error("Insufficient disk space: {0}")]
    DiskSpace(String),

    #[error("Transfer failed: {0}")]
    Transfer(String),

    #[error("Upload timed out after {0:?}")]
    TransferTimeout(Duration),

    #[error("Upload verification failed: local {local} bytes, remote {remote:?} bytes")]
    Verification { local: u64, remote: Option<u64> },

    #[error("Remote storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, BackupError>;
