//! Cross-process run lock backed by a JSON sentinel file.

use anyhow::{Context, Result};
use chrono::{Local, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub pid: u32,
    /// Unix seconds at acquisition.
    pub timestamp: i64,
    /// `YYYY-MM-DD HH:MM:SS`, local time.
    pub started: String,
}

impl LockRecord {
    fn fresh() -> Self {
        Self {
            pid: std::process::id(),
            timestamp: Utc::now().timestamp(),
            started: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }

    fn age(&self) -> Duration {
        let secs = Utc::now().timestamp().saturating_sub(self.timestamp);
        Duration::from_secs(secs.max(0) as u64)
    }
}

enum Existing {
    Held(LockRecord),
    Reclaimable(String),
}

#[derive(Debug)]
pub struct LockManager {
    path: PathBuf,
    max_age: Duration,
    held: bool,
}

impl LockManager {
    /// `max_age` is the longest a run may legitimately take; older records are stale.
    pub fn new(path: impl Into<PathBuf>, max_age: Duration) -> Self {
        Self {
            path: path.into(),
            max_age,
            held: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_held(&self) -> bool {
        self.held
    }

    /// Returns `Ok(false)` when another run holds a valid lock.
    pub fn acquire(&mut self) -> Result<bool> {
        if self.held {
            return Ok(true);
        }

        // One retry after discarding a stale or malformed record.
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&self.path) {
                Ok(mut file) => {
                    let record = LockRecord::fresh();
                    let written = serde_json::to_vec(&record)
                        .map_err(anyhow::Error::from)
                        .and_then(|bytes| {
                            file.write_all(&bytes)?;
                            file.sync_all()?;
                            Ok(())
                        });
                    if let Err(e) = written {
                        let _ = fs::remove_file(&self.path);
                        return Err(e).with_context(|| {
                            format!("Failed to write lock file {}", self.path.display())
                        });
                    }
                    self.held = true;
                    info!("Lock acquired: {} (pid {})", self.path.display(), record.pid);
                    return Ok(true);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => match self.inspect() {
                    Existing::Held(record) => {
                        debug!(
                            "Lock held by pid {} since {}",
                            record.pid, record.started
                        );
                        return Ok(false);
                    }
                    Existing::Reclaimable(reason) => {
                        warn!("Removing {} lock file {}", reason, self.path.display());
                        match fs::remove_file(&self.path) {
                            Ok(()) => {}
                            Err(e) if e.kind() == ErrorKind::NotFound => {}
                            Err(e) => {
                                return Err(e).with_context(|| {
                                    format!("Failed to remove lock file {}", self.path.display())
                                });
                            }
                        }
                    }
                },
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("Failed to create lock file {}", self.path.display())
                    });
                }
            }
        }
        Ok(false)
    }

    /// The record of whoever currently holds the lock, if it parses.
    pub fn current_holder(&self) -> Option<LockRecord> {
        let content = fs::read_to_string(&self.path).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Idempotent; leaves a record written by another process alone.
    pub fn release(&mut self) {
        if !self.held {
            return;
        }
        self.held = false;

        if let Some(record) = self.current_holder() {
            if record.pid != std::process::id() {
                warn!(
                    "Lock file {} now belongs to pid {}, leaving it",
                    self.path.display(),
                    record.pid
                );
                return;
            }
        }
        match fs::remove_file(&self.path) {
            Ok(()) => info!("Lock released: {}", self.path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove lock file {}: {}", self.path.display(), e),
        }
    }

    fn inspect(&self) -> Existing {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) => return Existing::Reclaimable(format!("unreadable ({})", e)),
        };
        match serde_json::from_str::<LockRecord>(&content) {
            Ok(record) if record.age() > self.max_age => Existing::Reclaimable(format!(
                "stale (pid {}, started {})",
                record.pid, record.started
            )),
            Ok(record) => Existing::Held(record),
            Err(_) => Existing::Reclaimable("malformed".to_string()),
        }
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        self.release();
    }
}
