//! S3-compatible object storage (AWS, DigitalOcean Spaces, MinIO, Wasabi).
//!
//! Resumable puts are multipart uploads: an unfinished upload for the same key is found
//! again with `ListMultipartUploads`, its parts are listed, and only the missing parts are
//! sent before the upload is completed.

use anyhow::{Context, Result, anyhow, bail};
use aws_sdk_s3 as s3;
use chrono::{DateTime, Utc};
use s3::config::{Credentials, Region};
use s3::primitives::{ByteStream, Length};
use s3::types::{CompletedMultipartUpload, CompletedPart};
use std::collections::BTreeMap;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{RemoteEntry, RemoteStore, listing_line};
use crate::config::S3Config;
use crate::utils::format_bytes;

/// Objects have no owner or mode; listing lines get fixed columns.
const OBJECT_LISTING_HEAD: &str = "-rw-r--r-- 1 s3 s3";

/// Multipart part size; S3 requires at least 5 MiB for every part but the last.
pub const PART_SIZE: u64 = 8 * 1024 * 1024;

pub struct S3Store {
    config: S3Config,
    client: Option<s3::Client>,
    bucket_missing: bool,
}

impl S3Store {
    pub fn new(config: S3Config) -> Self {
        Self {
            config,
            client: None,
            bucket_missing: false,
        }
    }

    fn client(&self) -> Result<&s3::Client> {
        self.client
            .as_ref()
            .ok_or_else(|| anyhow!("S3 store used before connect()"))
    }

    fn key(&self, name: &str) -> String {
        match &self.config.folder_prefix {
            Some(prefix) => format!("{}/{}", prefix, name),
            None => name.to_string(),
        }
    }

    fn list_prefix(&self) -> Option<String> {
        self.config.folder_prefix.as_ref().map(|p| format!("{}/", p))
    }

    async fn find_open_upload(&self, key: &str) -> Result<Option<String>> {
        let output = self
            .client()?
            .list_multipart_uploads()
            .bucket(&self.config.bucket)
            .prefix(key)
            .send()
            .await
            .context("Failed to list in-progress multipart uploads")?;
        Ok(output
            .uploads()
            .iter()
            .filter(|u| u.key() == Some(key))
            .max_by_key(|u| u.initiated().map(|d| d.secs()))
            .and_then(|u| u.upload_id().map(str::to_string)))
    }

    /// Parts already stored for `upload_id`, keyed by part number.
    async fn uploaded_parts(&self, key: &str, upload_id: &str) -> Result<BTreeMap<i32, (String, u64)>> {
        let client = self.client()?;
        let mut parts = BTreeMap::new();
        let mut marker: Option<String> = None;
        loop {
            let output = client
                .list_parts()
                .bucket(&self.config.bucket)
                .key(key)
                .upload_id(upload_id)
                .set_part_number_marker(marker.take())
                .send()
                .await
                .context("Failed to list uploaded parts")?;
            for part in output.parts() {
                if let (Some(number), Some(etag)) = (part.part_number(), part.e_tag()) {
                    let size = part.size().unwrap_or(0).max(0) as u64;
                    parts.insert(number, (etag.to_string(), size));
                }
            }
            match (output.is_truncated(), output.next_part_number_marker()) {
                (Some(true), Some(next)) => marker = Some(next.to_string()),
                _ => break,
            }
        }
        Ok(parts)
    }
}

fn to_chrono(value: &s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(value.secs(), value.subsec_nanos())
}

impl RemoteStore for S3Store {
    fn remote_path(&self, name: &str) -> String {
        format!("s3://{}/{}", self.config.bucket, self.key(name))
    }

    async fn connect(&mut self) -> Result<()> {
        info!("Connecting to S3 endpoint {}", self.config.endpoint_url);
        let sdk_config = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .endpoint_url(&self.config.endpoint_url)
            .region(Region::new(self.config.region.clone()))
            .credentials_provider(Credentials::new(
                &self.config.access_key_id,
                &self.config.secret_access_key,
                None,
                None,
                "Static",
            ))
            .load()
            .await;
        let s3_config = s3::config::Builder::from(&sdk_config)
            .force_path_style(self.config.path_style)
            .build();
        let client = s3::Client::from_conf(s3_config);

        match client.head_bucket().bucket(&self.config.bucket).send().await {
            Ok(_) => {
                debug!("Bucket {} is accessible", self.config.bucket);
                self.bucket_missing = false;
            }
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_not_found() {
                    self.bucket_missing = true;
                } else {
                    return Err(anyhow!(service_error)).with_context(|| {
                        format!(
                            "S3 authentication or connection failed for bucket {} at {}",
                            self.config.bucket, self.config.endpoint_url
                        )
                    });
                }
            }
        }
        self.client = Some(client);
        Ok(())
    }

    async fn ensure_directory(&mut self) -> Result<()> {
        if !self.bucket_missing {
            return Ok(());
        }
        info!("Creating bucket {}", self.config.bucket);
        self.client()?
            .create_bucket()
            .bucket(&self.config.bucket)
            .send()
            .await
            .with_context(|| format!("Failed to create bucket {}", self.config.bucket))?;
        self.bucket_missing = false;
        Ok(())
    }

    async fn list(&mut self) -> Result<Vec<RemoteEntry>> {
        let client = self.client()?;
        let prefix = self.list_prefix();
        let now = Utc::now();
        let mut entries = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let output = client
                .list_objects_v2()
                .bucket(&self.config.bucket)
                .set_prefix(prefix.clone())
                .set_continuation_token(token.take())
                .send()
                .await
                .with_context(|| format!("Failed to list bucket {}", self.config.bucket))?;
            for object in output.contents() {
                let Some(key) = object.key() else { continue };
                let name = match &prefix {
                    Some(p) => key.strip_prefix(p.as_str()).unwrap_or(key),
                    None => key,
                };
                if name.is_empty() || name.contains('/') {
                    continue;
                }
                let entry = match object.last_modified().and_then(to_chrono) {
                    Some(modified) => {
                        let size = object.size().unwrap_or(0).max(0) as u64;
                        let line = listing_line(OBJECT_LISTING_HEAD, size, modified, name, now);
                        RemoteEntry::listed(name, line)
                    }
                    None => RemoteEntry::named(name),
                };
                entries.push(entry);
            }
            match output.next_continuation_token() {
                Some(next) if output.is_truncated() == Some(true) => token = Some(next.to_string()),
                _ => break,
            }
        }
        Ok(entries)
    }

    async fn size(&mut self, name: &str) -> Result<Option<u64>> {
        let key = self.key(name);
        match self
            .client()?
            .head_object()
            .bucket(&self.config.bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(output) => Ok(Some(output.content_length().unwrap_or(0).max(0) as u64)),
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_not_found() {
                    Ok(None)
                } else {
                    Err(anyhow!(service_error)).with_context(|| format!("Failed to stat {}", key))
                }
            }
        }
    }

    async fn modified(&mut self, name: &str) -> Result<Option<DateTime<Utc>>> {
        let key = self.key(name);
        match self
            .client()?
            .head_object()
            .bucket(&self.config.bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(output) => Ok(output.last_modified().and_then(to_chrono)),
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_not_found() {
                    Ok(None)
                } else {
                    Err(anyhow!(service_error)).with_context(|| format!("Failed to stat {}", key))
                }
            }
        }
    }

    async fn put(&mut self, local: &Path, name: &str) -> Result<()> {
        let key = self.key(name);
        let body = ByteStream::from_path(local)
            .await
            .with_context(|| format!("Failed to create ByteStream from file: {}", local.display()))?;
        self.client()?
            .put_object()
            .bucket(&self.config.bucket)
            .key(&key)
            .body(body)
            .send()
            .await
            .with_context(|| {
                format!(
                    "Failed to upload file {} to S3 bucket {} with key {}",
                    local.display(),
                    self.config.bucket,
                    key
                )
            })?;
        Ok(())
    }

    async fn put_resumable(
        &mut self,
        local: &Path,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let key = self.key(name);
        let total = tokio::fs::metadata(local).await?.len();
        let part_count = total.div_ceil(PART_SIZE).max(1);

        let (upload_id, mut done) = match self.find_open_upload(&key).await? {
            Some(upload_id) => match self.uploaded_parts(&key, &upload_id).await {
                Ok(parts) => {
                    info!(
                        "Resuming multipart upload of {} ({} parts already stored)",
                        key,
                        parts.len()
                    );
                    (upload_id, parts)
                }
                Err(e) => {
                    warn!("Cannot list parts of upload {}, starting a new one: {:#}", upload_id, e);
                    (self.create_upload(&key).await?, BTreeMap::new())
                }
            },
            None => (self.create_upload(&key).await?, BTreeMap::new()),
        };

        let client = self.client()?.clone();
        for number in 1..=part_count {
            let offset = (number - 1) * PART_SIZE;
            let length = PART_SIZE.min(total - offset);
            let part_number = number as i32;
            if done.get(&part_number).is_some_and(|(_, size)| *size == length) {
                continue;
            }
            if cancel.is_cancelled() {
                bail!(
                    "Upload of {} cancelled after {} of {} parts",
                    key,
                    done.len(),
                    part_count
                );
            }

            let body = ByteStream::read_from()
                .path(local)
                .offset(offset)
                .length(Length::Exact(length))
                .build()
                .await
                .with_context(|| format!("Failed to read part {} of {}", number, local.display()))?;
            let output = client
                .upload_part()
                .bucket(&self.config.bucket)
                .key(&key)
                .upload_id(&upload_id)
                .part_number(part_number)
                .body(body)
                .send()
                .await
                .with_context(|| format!("Failed to upload part {} of {}", number, key))?;
            let etag = output
                .e_tag()
                .ok_or_else(|| anyhow!("Part {} of {} returned no ETag", number, key))?;
            done.insert(part_number, (etag.to_string(), length));
            debug!(
                "Upload progress {}: {} / {}",
                key,
                format_bytes((offset + length).min(total)),
                format_bytes(total)
            );
        }

        let parts = done
            .iter()
            .filter(|(number, _)| (**number as u64) <= part_count)
            .map(|(number, (etag, _))| {
                CompletedPart::builder()
                    .part_number(*number)
                    .e_tag(etag)
                    .build()
            })
            .collect();
        client
            .complete_multipart_upload()
            .bucket(&self.config.bucket)
            .key(&key)
            .upload_id(&upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .with_context(|| format!("Failed to complete multipart upload of {}", key))?;
        Ok(())
    }

    async fn delete(&mut self, name: &str) -> Result<()> {
        let key = self.key(name);
        self.client()?
            .delete_object()
            .bucket(&self.config.bucket)
            .key(&key)
            .send()
            .await
            .with_context(|| format!("Failed to delete {}", key))?;
        Ok(())
    }
}

impl S3Store {
    async fn create_upload(&self, key: &str) -> Result<String> {
        let output = self
            .client()?
            .create_multipart_upload()
            .bucket(&self.config.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("Failed to start multipart upload of {}", key))?;
        output
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("Multipart upload of {} returned no upload id", key))
    }
}
