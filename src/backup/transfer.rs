//! Ships the archive to the remote store: retry, resume, verify, then prune.

use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backup::retention::{RemoteDirectory, RetentionManager, RetentionRecord};
use crate::config::AppConfig;
use crate::errors::BackupError;
use crate::storage::RemoteStore;
use crate::utils::deadline::{DeadlineWatch, SoftDeadline};
use crate::utils::format_bytes;

/// How often a running resumable put is checked against the run deadline.
const DEADLINE_POLL: Duration = Duration::from_secs(1);

/// Knobs of one upload; fixed caps, with delays overridable for tests.
#[derive(Debug, Clone)]
pub struct TransferPolicy {
    pub max_attempts: u32,
    /// First retry delay; doubles on every further retry.
    pub base_backoff: Duration,
    pub verify_checks: u32,
    pub verify_delay: Duration,
    /// Files at or above this size use the resumable path.
    pub chunked_threshold: u64,
    /// Hard budget of one resumable put.
    pub upload_timeout: Duration,
    pub remote_keep: usize,
}

impl TransferPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_secs(2),
            verify_checks: 3,
            verify_delay: Duration::from_secs(1),
            chunked_threshold: config.limits.chunked_upload_threshold,
            upload_timeout: config.limits.upload_timeout,
            remote_keep: config.retention.remote_count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub remote_path: String,
    pub uploaded_size: u64,
    pub attempts: u32,
    /// Delays slept before each retry.
    pub backoff: Vec<Duration>,
    /// Remote artifacts removed by retention after the upload.
    pub pruned: Vec<RetentionRecord>,
    /// Whether the upload ran past the run's warning threshold.
    pub deadline_warned: bool,
}

#[derive(Debug, Error)]
#[error("{error} (after {attempts} attempt(s))")]
pub struct TransferFailure {
    pub attempts: u32,
    pub error: BackupError,
}

pub struct TransferClient<'a, R> {
    store: &'a mut R,
    policy: TransferPolicy,
    watch: DeadlineWatch,
}

impl<'a, R: RemoteStore> TransferClient<'a, R> {
    pub fn new(store: &'a mut R, policy: TransferPolicy, deadline: SoftDeadline) -> Self {
        Self {
            store,
            policy,
            watch: deadline.watch("Upload"),
        }
    }

    pub async fn upload(&mut self, local: &Path) -> Result<TransferReport, TransferFailure> {
        let fail = |attempts: u32, error: BackupError| {
            error!("Transfer failed: {}", error);
            TransferFailure { attempts, error }
        };

        let local_size = match std::fs::metadata(local) {
            Ok(meta) => meta.len(),
            Err(e) => {
                return Err(fail(
                    0,
                    BackupError::Transfer(format!("Local file not found: {} ({})", local.display(), e)),
                ));
            }
        };
        let name = match local.file_name() {
            Some(name) => name.to_string_lossy().into_owned(),
            None => {
                return Err(fail(
                    0,
                    BackupError::Transfer(format!("Not a file path: {}", local.display())),
                ));
            }
        };

        info!("Uploading file: {} ({})", name, format_bytes(local_size));
        let mut backoff = Vec::new();
        let mut attempts = 0;
        loop {
            attempts += 1;
            // Every attempt reconnects, so a dropped session is retried like a failed put.
            let outcome = match self.prepare().await {
                Ok(()) => self.attempt(local, &name, local_size).await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(()) => {
                    if attempts > 1 {
                        info!("Upload succeeded on attempt {}", attempts);
                    }
                    break;
                }
                Err(e) => {
                    warn!("Upload attempt {} failed: {}", attempts, e);
                    if attempts >= self.policy.max_attempts {
                        return Err(fail(
                            attempts,
                            BackupError::Transfer(format!(
                                "Upload failed after {} attempts: {}",
                                attempts, e
                            )),
                        ));
                    }
                    let delay = self.policy.base_backoff * 2u32.pow(attempts - 1);
                    warn!(
                        "Retrying upload (attempt {} of {}) after {:?}",
                        attempts + 1,
                        self.policy.max_attempts,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    backoff.push(delay);
                }
            }
        }

        if let Err(e) = self.verify(&name, local_size).await {
            return Err(fail(attempts, e));
        }
        info!("Upload successful and verified: {} ({})", name, format_bytes(local_size));

        info!("Managing remote retention (keep {} backups)", self.policy.remote_keep);
        let pruned = match RetentionManager::archives() {
            Ok(manager) => {
                let mut location = RemoteDirectory::new(&mut *self.store);
                match manager.prune(&mut location, self.policy.remote_keep).await {
                    Ok(pruned) => pruned,
                    Err(e) => {
                        warn!("Could not retrieve remote file list for retention cleanup: {:#}", e);
                        Vec::new()
                    }
                }
            }
            Err(e) => {
                warn!("Remote retention skipped: {:#}", e);
                Vec::new()
            }
        };

        Ok(TransferReport {
            remote_path: self.store.remote_path(&name),
            uploaded_size: local_size,
            attempts,
            backoff,
            pruned,
            deadline_warned: self.watch.has_warned(),
        })
    }

    async fn prepare(&mut self) -> Result<(), BackupError> {
        self.store
            .connect()
            .await
            .map_err(|e| BackupError::Storage(format!("{:#}", e)))?;
        self.store
            .ensure_directory()
            .await
            .map_err(|e| BackupError::Storage(format!("Cannot access/create remote directory: {:#}", e)))
    }

    async fn attempt(&mut self, local: &Path, name: &str, local_size: u64) -> Result<(), BackupError> {
        if local_size < self.policy.chunked_threshold {
            return self
                .store
                .put(local, name)
                .await
                .map_err(|e| BackupError::Transfer(format!("{:#}", e)));
        }

        debug!("Using resumable upload for large file ({})", format_bytes(local_size));
        match self.store.size(name).await {
            Ok(Some(remote)) if remote > 0 && remote < local_size => {
                // Only a nearly empty leftover is treated as corrupt.
                if (remote as f64) < local_size as f64 * 0.01 {
                    warn!(
                        "Corrupted partial upload detected ({}), deleting",
                        format_bytes(remote)
                    );
                    if let Err(e) = self.store.delete(name).await {
                        warn!("Could not delete partial upload {}: {:#}", name, e);
                    }
                } else {
                    info!(
                        "Substantial partial upload exists ({}), resuming",
                        format_bytes(remote)
                    );
                }
            }
            Ok(_) => {}
            Err(e) => debug!("Remote size query failed for {}: {:#}", name, e),
        }

        let budget = self.policy.upload_timeout;
        let token = CancellationToken::new();
        let expiry = tokio::time::sleep(budget);
        let mut poll = tokio::time::interval(DEADLINE_POLL);
        let put = self.store.put_resumable(local, name, &token);
        tokio::pin!(expiry);
        tokio::pin!(put);

        // The put is dropped at the budget even if the backend never looks at the token.
        let result = loop {
            tokio::select! {
                result = &mut put => break result,
                _ = &mut expiry => {
                    token.cancel();
                    warn!("Resumable upload of {} exceeded {:?}, abandoning it", name, budget);
                    return Err(BackupError::TransferTimeout(budget));
                }
                _ = poll.tick() => {
                    self.watch.check(format_args!("uploading {}", name));
                }
            }
        };
        result.map_err(|e| BackupError::Transfer(format!("{:#}", e)))
    }

    async fn verify(&mut self, name: &str, local_size: u64) -> Result<(), BackupError> {
        let mut remote = None;
        for check in 1..=self.policy.verify_checks {
            remote = self.store.size(name).await.ok().flatten();
            if remote == Some(local_size) {
                return Ok(());
            }
            if check < self.policy.verify_checks {
                debug!("Verification attempt {} failed, retrying...", check);
                tokio::time::sleep(self.policy.verify_delay).await;
            }
        }
        // The remote copy stays; retention on a later run deals with it.
        Err(BackupError::Verification {
            local: local_size,
            remote,
        })
    }
}
