//! A remote directory reached through a mounted filesystem (NFS, SMB, sshfs).

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use std::io::{ErrorKind, SeekFrom};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{RemoteEntry, RemoteStore, listing_line};
use crate::utils::format_bytes;

const CHUNK_SIZE: usize = 1024 * 1024;

/// `-rwxr-xr--` style rendering of a regular file's mode bits.
fn permission_string(mode: u32) -> String {
    let mut out = String::with_capacity(10);
    out.push('-');
    for shift in [6, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_of(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

impl RemoteStore for DirectoryStore {
    fn remote_path(&self, name: &str) -> String {
        self.path_of(name).display().to_string()
    }

    async fn connect(&mut self) -> Result<()> {
        let parent = self.root.parent().unwrap_or(&self.root);
        let meta = fs::metadata(parent)
            .await
            .with_context(|| format!("Remote share not reachable: {}", parent.display()))?;
        if !meta.is_dir() {
            bail!("Remote share is not a directory: {}", parent.display());
        }
        Ok(())
    }

    async fn ensure_directory(&mut self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("Failed to create remote directory {}", self.root.display()))
    }

    async fn list(&mut self) -> Result<Vec<RemoteEntry>> {
        let mut dir = fs::read_dir(&self.root)
            .await
            .with_context(|| format!("Failed to list remote directory {}", self.root.display()))?;
        let now = Utc::now();
        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let modified = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
            let head = format!(
                "{} {} {} {}",
                permission_string(meta.mode()),
                meta.nlink(),
                meta.uid(),
                meta.gid()
            );
            let line = listing_line(&head, meta.len(), modified, &name, now);
            entries.push(RemoteEntry::listed(name, line));
        }
        Ok(entries)
    }

    async fn size(&mut self, name: &str) -> Result<Option<u64>> {
        match fs::metadata(self.path_of(name)).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to stat remote {}", name)),
        }
    }

    async fn modified(&mut self, name: &str) -> Result<Option<DateTime<Utc>>> {
        match fs::metadata(self.path_of(name)).await {
            Ok(meta) => Ok(meta.modified().ok().map(DateTime::<Utc>::from)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to stat remote {}", name)),
        }
    }

    async fn put(&mut self, local: &Path, name: &str) -> Result<()> {
        let target = self.path_of(name);
        let staging = self.path_of(&format!(".{}.part", name));
        fs::copy(local, &staging)
            .await
            .with_context(|| format!("Failed to copy {} to {}", local.display(), staging.display()))?;
        fs::rename(&staging, &target)
            .await
            .with_context(|| format!("Failed to move upload into place at {}", target.display()))?;
        Ok(())
    }

    async fn put_resumable(
        &mut self,
        local: &Path,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let target = self.path_of(name);
        let total = fs::metadata(local).await?.len();

        let mut output = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&target)
            .await
            .with_context(|| format!("Failed to open remote {}", target.display()))?;
        let mut offset = output.metadata().await?.len();
        if offset > total {
            debug!("Remote {} is longer than the source, starting over", name);
            output.set_len(0).await?;
            offset = 0;
        }
        if offset > 0 {
            info!(
                "Resuming upload of {} at {} / {}",
                name,
                format_bytes(offset),
                format_bytes(total)
            );
        }
        output.seek(SeekFrom::Start(offset)).await?;

        let mut input = fs::File::open(local).await?;
        input.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        while offset < total {
            if cancel.is_cancelled() {
                output.flush().await?;
                bail!("Upload of {} cancelled at {} bytes", name, offset);
            }
            let n = input.read(&mut buf).await?;
            if n == 0 {
                bail!("Source {} shrank during upload", local.display());
            }
            output.write_all(&buf[..n]).await?;
            offset += n as u64;
            debug!(
                "Upload progress {}: {} / {}",
                name,
                format_bytes(offset),
                format_bytes(total)
            );
        }
        output.flush().await?;
        output.sync_all().await?;
        Ok(())
    }

    async fn delete(&mut self, name: &str) -> Result<()> {
        fs::remove_file(self.path_of(name))
            .await
            .with_context(|| format!("Failed to delete remote {}", name))
    }
}
