//! Remote stores an archive can be shipped to.
//!
//! Every backend offers the same small capability set so the transfer and retention logic
//! never needs to know whether it is talking to an object store or a mounted share.

pub mod directory;
pub mod s3;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::path::Path;
use tokio_util::sync::CancellationToken;

pub use directory::DirectoryStore;
pub use s3::S3Store;

/// One name in the remote directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    /// Raw long-format listing line, when the backend produces one
    /// (`permissions links owner group size month day time-or-year name`).
    pub listing: Option<String>,
}

impl RemoteEntry {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            listing: None,
        }
    }

    pub fn listed(name: impl Into<String>, listing: String) -> Self {
        Self {
            name: name.into(),
            listing: Some(listing),
        }
    }
}

/// Renders one long-format listing line the way `ls -l` does.
///
/// `head` carries the first four columns. Entries modified within the last six months show
/// the time of day, older or future ones show the year instead.
pub fn listing_line(
    head: &str,
    size: u64,
    modified: DateTime<Utc>,
    name: &str,
    now: DateTime<Utc>,
) -> String {
    let recent = modified <= now && now - modified < Duration::days(180);
    let stamp = if recent {
        modified.format("%b %d %H:%M")
    } else {
        modified.format("%b %d  %Y")
    };
    format!("{} {} {} {}", head, size, stamp, name)
}

#[allow(async_fn_in_trait)]
pub trait RemoteStore {
    /// Where artifacts land, for logs and reports.
    fn remote_path(&self, name: &str) -> String;

    /// Opens the connection and authenticates.
    async fn connect(&mut self) -> Result<()>;

    /// Creates the target directory (or bucket) if it does not exist yet.
    async fn ensure_directory(&mut self) -> Result<()>;

    async fn list(&mut self) -> Result<Vec<RemoteEntry>>;

    /// `Ok(None)` when the name does not exist.
    async fn size(&mut self, name: &str) -> Result<Option<u64>>;

    /// `Ok(None)` when the backend cannot say.
    async fn modified(&mut self, name: &str) -> Result<Option<DateTime<Utc>>>;

    /// Single blocking transfer of the whole file.
    async fn put(&mut self, local: &Path, name: &str) -> Result<()>;

    /// Continues a previous partial transfer of `name` when one exists.
    ///
    /// Implementations check `cancel` between chunks and leave the partial remote state in
    /// place when they stop early, so the next call can pick it up.
    async fn put_resumable(
        &mut self,
        local: &Path,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<()>;

    async fn delete(&mut self, name: &str) -> Result<()>;
}
