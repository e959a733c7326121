//! Keeps the newest N artifacts at a location and deletes the rest.

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDateTime, Utc};
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::storage::RemoteStore;
use crate::utils::format_bytes;

pub const ARCHIVE_PATTERN: &str = r"^backup-\d{4}-\d{2}-\d{2}-\d{2}-\d{2}\.zip$";
pub const LOG_PATTERN: &str = r"^backup-log-\d{4}-\d{2}-\d{2}-\d{2}-\d{2}\.txt$";
/// `<database>_<run token>.sql[.gz]`, as written to the temp directory.
pub const DUMP_PATTERN: &str = r"^[A-Za-z0-9_-]+_(\d{4}-\d{2}-\d{2}-\d{2}-\d{2})\.sql(\.gz)?$";

/// What a location knows about one of its files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedArtifact {
    pub name: String,
    pub size: u64,
    /// Authoritative modification time, when the location can report one.
    pub modified: Option<DateTime<Utc>>,
    pub listing: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionRecord {
    pub name: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

#[allow(async_fn_in_trait)]
pub trait RetentionLocation {
    fn label(&self) -> String;
    async fn artifacts(&mut self) -> Result<Vec<ListedArtifact>>;
    async fn remove(&mut self, name: &str) -> Result<()>;
}

/// A directory on the local filesystem.
pub struct LocalDirectory {
    dir: PathBuf,
}

impl LocalDirectory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl RetentionLocation for LocalDirectory {
    fn label(&self) -> String {
        self.dir.display().to_string()
    }

    async fn artifacts(&mut self) -> Result<Vec<ListedArtifact>> {
        let mut artifacts = Vec::new();
        let entries = fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to read directory {}", self.dir.display()))?;
        for entry in entries {
            let entry = entry?;
            let meta = match entry.metadata() {
                Ok(meta) if meta.is_file() => meta,
                Ok(_) => continue,
                Err(e) => {
                    debug!("Cannot stat {}: {}", entry.path().display(), e);
                    continue;
                }
            };
            artifacts.push(ListedArtifact {
                name: entry.file_name().to_string_lossy().into_owned(),
                size: meta.len(),
                modified: meta.modified().ok().map(DateTime::<Utc>::from),
                listing: None,
            });
        }
        Ok(artifacts)
    }

    async fn remove(&mut self, name: &str) -> Result<()> {
        let path = self.dir.join(name);
        fs::remove_file(&path).with_context(|| format!("Failed to delete {}", path.display()))
    }
}

/// The remote store seen as a retention location.
pub struct RemoteDirectory<'a, R> {
    store: &'a mut R,
}

impl<'a, R: RemoteStore> RemoteDirectory<'a, R> {
    pub fn new(store: &'a mut R) -> Self {
        Self { store }
    }
}

impl<R: RemoteStore> RetentionLocation for RemoteDirectory<'_, R> {
    fn label(&self) -> String {
        self.store.remote_path("")
    }

    async fn artifacts(&mut self) -> Result<Vec<ListedArtifact>> {
        let archive_pattern = Regex::new(ARCHIVE_PATTERN)?;
        let mut artifacts = Vec::new();
        for entry in self.store.list().await? {
            if !archive_pattern.is_match(&entry.name) {
                continue;
            }
            let modified = match self.store.modified(&entry.name).await {
                Ok(modified) => modified,
                Err(e) => {
                    debug!("Modification time query failed for {}: {:#}", entry.name, e);
                    None
                }
            };
            // Size before any deletion so the report reflects what was there.
            let size = self.store.size(&entry.name).await.ok().flatten().unwrap_or(0);
            artifacts.push(ListedArtifact {
                name: entry.name,
                size,
                modified,
                listing: entry.listing,
            });
        }
        Ok(artifacts)
    }

    async fn remove(&mut self, name: &str) -> Result<()> {
        self.store.delete(name).await
    }
}

pub struct RetentionManager {
    pattern: Regex,
}

impl RetentionManager {
    pub fn new(pattern: Regex) -> Self {
        Self { pattern }
    }

    pub fn archives() -> Result<Self> {
        Ok(Self::new(Regex::new(ARCHIVE_PATTERN)?))
    }

    pub fn logs() -> Result<Self> {
        Ok(Self::new(Regex::new(LOG_PATTERN)?))
    }

    /// Deletes every matching artifact beyond the `keep` newest and returns what was deleted.
    pub async fn prune<L: RetentionLocation>(
        &self,
        location: &mut L,
        keep: usize,
    ) -> Result<Vec<RetentionRecord>> {
        let now = Utc::now();
        let mut candidates: Vec<RetentionRecord> = location
            .artifacts()
            .await?
            .into_iter()
            .filter(|a| self.pattern.is_match(&a.name))
            .map(|a| {
                let modified = a
                    .modified
                    .or_else(|| a.listing.as_deref().and_then(|l| parse_listing_time(l, now)))
                    .unwrap_or_else(|| {
                        warn!(
                            "Cannot determine age of {}, treating as oldest",
                            a.name
                        );
                        DateTime::<Utc>::UNIX_EPOCH
                    });
                RetentionRecord {
                    name: a.name,
                    size: a.size,
                    modified,
                }
            })
            .collect();

        candidates.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| b.name.cmp(&a.name)));

        let mut deleted = Vec::new();
        for record in candidates.into_iter().skip(keep) {
            match location.remove(&record.name).await {
                Ok(()) => {
                    info!(
                        "Deleted old backup {} ({}) from {}",
                        record.name,
                        format_bytes(record.size),
                        location.label()
                    );
                    deleted.push(record);
                }
                Err(e) => warn!("Failed to delete {}: {:#}", record.name, e),
            }
        }
        Ok(deleted)
    }
}

/// Deletes dumps in `dir` left by runs other than `current_token`.
///
/// Dumps kept after a failed upload only stay until the next run has made its own.
pub fn purge_stale_dumps(dir: &Path, current_token: &str) -> Result<Vec<String>> {
    let pattern = Regex::new(DUMP_PATTERN)?;
    let mut removed = Vec::new();
    let entries =
        fs::read_dir(dir).with_context(|| format!("Failed to list {}", dir.display()))?;
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let stale = pattern
            .captures(&name)
            .and_then(|c| c.get(1))
            .is_some_and(|token| token.as_str() != current_token);
        if !stale {
            continue;
        }
        match fs::remove_file(entry.path()) {
            Ok(()) => {
                info!("Removed stale dump from an earlier run: {}", name);
                removed.push(name);
            }
            Err(e) => warn!("Failed to delete stale dump {}: {}", name, e),
        }
    }
    removed.sort();
    Ok(removed)
}

/// Modification time from a long-format listing line.
///
/// Recent entries show `month day HH:MM` without a year; those take the current year, or
/// the previous one when that would put them in the future.
pub fn parse_listing_time(line: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 9 {
        return None;
    }
    let (month, day, time_or_year) = (parts[5], parts[6], parts[7]);

    let parse = |year: i32, time: &str| {
        NaiveDateTime::parse_from_str(
            &format!("{} {} {} {}", month, day, year, time),
            "%b %d %Y %H:%M",
        )
        .ok()
        .map(|dt| dt.and_utc())
    };

    if time_or_year.contains(':') {
        let this_year = parse(now.year(), time_or_year)?;
        if this_year > now + ChronoDuration::days(1) {
            parse(now.year() - 1, time_or_year)
        } else {
            Some(this_year)
        }
    } else {
        let year: i32 = time_or_year.parse().ok()?;
        parse(year, "00:00")
    }
}
