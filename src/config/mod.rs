// sitebackup/src/config/mod.rs
use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::BackupError;

const MB: u64 = 1024 * 1024;

// Structs for deserializing config.json
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonRemoteConfig {
    pub backend: Option<String>,
    pub endpoint_url: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub region: Option<String>,
    pub bucket: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub directory: Option<String>,
    pub use_tls: Option<bool>,
    pub path_style: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonRetention {
    pub remote_count: Option<usize>,
    pub local_count: Option<usize>,
    pub log_count: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonCompression {
    pub archive_level: Option<i64>,
    pub dump_threshold_mb: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonLimits {
    pub max_run_seconds: Option<u64>,
    pub warn_after_seconds: Option<u64>,
    pub upload_timeout_seconds: Option<u64>,
    pub chunked_upload_threshold_mb: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonNotify {
    pub on_success: Option<bool>,
    pub on_failure: Option<bool>,
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawJsonConfig {
    pub source_database_url: Option<String>,
    pub database_list: Option<Vec<String>>,
    #[serde(default)]
    pub exclude_databases: Vec<String>,
    pub remote: Option<JsonRemoteConfig>,
    pub source_dir: Option<PathBuf>,
    pub local_backup_dir: Option<PathBuf>,
    pub temp_dir: Option<PathBuf>,
    #[serde(default)]
    pub retention: JsonRetention,
    #[serde(default)]
    pub compression: JsonCompression,
    #[serde(default)]
    pub limits: JsonLimits,
    #[serde(default)]
    pub notify: JsonNotify,
    pub exclude_patterns: Option<Vec<String>>,
    pub log_level: Option<String>,
}

// Application's internal configuration structs
#[derive(Debug, Clone)]
pub struct S3Config {
    pub endpoint_url: String,
    pub region: String,
    pub bucket: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub folder_prefix: Option<String>,
    pub path_style: bool,
}

#[derive(Debug, Clone)]
pub enum RemoteConfig {
    S3(S3Config),
    /// A mounted share (NFS, SMB, sshfs) reached through the local filesystem.
    Directory { root: PathBuf },
}

#[derive(Debug, Clone)]
pub struct RetentionConfig {
    pub remote_count: usize,
    pub local_count: usize,
    pub log_count: usize,
}

#[derive(Debug, Clone)]
pub struct LimitsConfig {
    pub max_run: Duration,
    pub warn_after: Duration,
    pub upload_timeout: Duration,
    pub chunked_upload_threshold: u64,
}

#[derive(Debug, Clone)]
pub struct NotifyConfig {
    pub on_success: bool,
    pub on_failure: bool,
    pub webhook_url: Option<url::Url>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub source_db_url: String,
    pub databases_to_backup: Option<Vec<String>>,
    pub exclude_databases: Vec<String>,
    pub remote: Option<RemoteConfig>,
    pub source_dir: Option<PathBuf>,
    pub local_backup_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub retention: RetentionConfig,
    pub archive_level: i64,
    pub dump_compress_threshold: u64,
    pub limits: LimitsConfig,
    pub notify: NotifyConfig,
    pub exclude_patterns: Vec<Regex>,
    pub log_level: String,
}

pub fn default_exclude_patterns() -> Vec<String> {
    [
        r"(?i)/cache/",
        r"(?i)/tmp/",
        r"(?i)/temp/",
        r"(?i)/logs/",
        r"(?i)/sessions/",
        r"(?i)/\.git/",
        r"(?i)/node_modules/",
        r"(?i)/\.svn/",
        r"(?i)/\.DS_Store$",
        r"(?i)/Thumbs\.db$",
    ]
    .iter()
    .map(|p| p.to_string())
    .collect()
}

impl RawJsonConfig {
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        let raw: RawJsonConfig = serde_json::from_str(&config_content).with_context(|| {
            format!(
                "Failed to parse JSON from config file at {}",
                config_path.display()
            )
        })?;
        Ok(raw)
    }

    /// Secrets and deployment paths may come from the environment (or `.env`) instead of the file.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = non_empty("SOURCE_DATABASE_URL") {
            self.source_database_url = Some(url);
        }
        if let Some(dir) = non_empty("LOCAL_BACKUP_DIR") {
            self.local_backup_dir = Some(PathBuf::from(dir));
        }
        if let Some(key) = non_empty("REMOTE_ACCESS_KEY_ID") {
            self.remote.get_or_insert_with(Default::default).access_key_id = Some(key);
        }
        if let Some(secret) = non_empty("REMOTE_SECRET_ACCESS_KEY") {
            self.remote
                .get_or_insert_with(Default::default)
                .secret_access_key = Some(secret);
        }
    }
}

impl AppConfig {
    pub fn load(config_path: &Path) -> std::result::Result<Self, BackupError> {
        let mut raw = RawJsonConfig::load_from_json(config_path)
            .map_err(|e| BackupError::Configuration(format!("{:#}", e)))?;
        raw.apply_env_overrides(|key| std::env::var(key).ok());
        Self::from_raw(raw)
    }

    pub fn from_raw(raw: RawJsonConfig) -> std::result::Result<Self, BackupError> {
        let config_err = |msg: String| BackupError::Configuration(msg);

        let source_db_url = raw
            .source_database_url
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| config_err("source_database_url must be set in config.json".into()))?;
        url::Url::parse(&source_db_url)
            .map_err(|e| config_err(format!("source_database_url is not a valid URL: {}", e)))?;

        let local_backup_dir = raw
            .local_backup_dir
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(|| config_err("local_backup_dir must be set in config.json".into()))?;
        let temp_dir = raw
            .temp_dir
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(|| config_err("temp_dir must be set in config.json".into()))?;

        if let Some(dbs) = &raw.database_list {
            if let Some(bad) = dbs.iter().find(|name| name.trim().is_empty()) {
                return Err(config_err(format!(
                    "database_list contains an empty name: {:?}",
                    bad
                )));
            }
        }

        let archive_level = raw.compression.archive_level.unwrap_or(6);
        if !(1..=9).contains(&archive_level) {
            return Err(config_err(format!(
                "compression.archive_level must be between 1 and 9, got {}",
                archive_level
            )));
        }

        let max_run = raw.limits.max_run_seconds.unwrap_or(900);
        let warn_after = raw.limits.warn_after_seconds.unwrap_or(840);
        let upload_timeout = raw.limits.upload_timeout_seconds.unwrap_or(600);
        if warn_after >= max_run {
            return Err(config_err(format!(
                "limits.warn_after_seconds ({}) must be below limits.max_run_seconds ({})",
                warn_after, max_run
            )));
        }
        if upload_timeout >= max_run {
            return Err(config_err(format!(
                "limits.upload_timeout_seconds ({}) must be below limits.max_run_seconds ({})",
                upload_timeout, max_run
            )));
        }

        let megabytes = |value: u64, key: &str| {
            value
                .checked_mul(MB)
                .ok_or_else(|| config_err(format!("{} is too large: {} MB", key, value)))
        };
        let dump_compress_threshold =
            megabytes(raw.compression.dump_threshold_mb.unwrap_or(20), "compression.dump_threshold_mb")?;
        let chunked_upload_threshold = megabytes(
            raw.limits.chunked_upload_threshold_mb.unwrap_or(100),
            "limits.chunked_upload_threshold_mb",
        )?;

        let exclude_patterns = raw
            .exclude_patterns
            .unwrap_or_else(default_exclude_patterns)
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| config_err(format!("Invalid exclude pattern {:?}: {}", p, e)))
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let webhook_url = match raw.notify.webhook_url.filter(|s| !s.trim().is_empty()) {
            Some(s) => Some(
                url::Url::parse(&s)
                    .map_err(|e| config_err(format!("notify.webhook_url is invalid: {}", e)))?,
            ),
            None => None,
        };

        Ok(AppConfig {
            source_db_url,
            databases_to_backup: raw.database_list,
            exclude_databases: raw.exclude_databases,
            remote: raw.remote.map(parse_remote_config).transpose()?,
            source_dir: raw.source_dir.filter(|p| !p.as_os_str().is_empty()),
            local_backup_dir,
            temp_dir,
            retention: RetentionConfig {
                remote_count: raw.retention.remote_count.unwrap_or(14),
                local_count: raw.retention.local_count.unwrap_or(5),
                log_count: raw.retention.log_count.unwrap_or(30),
            },
            archive_level,
            dump_compress_threshold,
            limits: LimitsConfig {
                max_run: Duration::from_secs(max_run),
                warn_after: Duration::from_secs(warn_after),
                upload_timeout: Duration::from_secs(upload_timeout),
                chunked_upload_threshold,
            },
            notify: NotifyConfig {
                on_success: raw.notify.on_success.unwrap_or(true),
                on_failure: raw.notify.on_failure.unwrap_or(true),
                webhook_url,
            },
            exclude_patterns,
            log_level: raw.log_level.unwrap_or_else(|| "info".to_string()),
        })
    }

    /// Path of the cross-process lock record.
    pub fn lock_path(&self) -> PathBuf {
        self.local_backup_dir.join("backup.lock")
    }

    /// Checks that every working directory exists and accepts new files.
    pub fn validate_directories(&self) -> std::result::Result<(), BackupError> {
        if let Some(source) = &self.source_dir {
            if !source.is_dir() {
                return Err(BackupError::Configuration(format!(
                    "Backup source directory does not exist: {}",
                    source.display()
                )));
            }
        }

        let writable = [
            ("Local backup directory", &self.local_backup_dir),
            ("Temporary directory", &self.temp_dir),
        ];
        for (description, dir) in writable {
            if !dir.is_dir() {
                return Err(BackupError::Configuration(format!(
                    "{} does not exist: {}",
                    description,
                    dir.display()
                )));
            }
            tempfile::Builder::new()
                .prefix(".write-probe")
                .tempfile_in(dir)
                .map_err(|e| {
                    BackupError::Configuration(format!(
                        "{} is not writable: {} ({})",
                        description,
                        dir.display(),
                        e
                    ))
                })?;
        }
        Ok(())
    }
}

fn parse_remote_config(raw: JsonRemoteConfig) -> std::result::Result<RemoteConfig, BackupError> {
    let backend = raw.backend.as_deref().unwrap_or("s3");
    let missing = |field: &str| {
        BackupError::Configuration(format!(
            "remote.{} must be set for the {} backend",
            field, backend
        ))
    };
    let non_empty = |v: Option<String>| v.filter(|s| !s.trim().is_empty());

    match backend {
        "s3" => {
            let use_tls = raw.use_tls.unwrap_or(true);
            let endpoint_url = match (non_empty(raw.endpoint_url), non_empty(raw.host)) {
                (Some(url), _) => url,
                (None, Some(host)) => {
                    let scheme = if use_tls { "https" } else { "http" };
                    match raw.port {
                        Some(port) => format!("{}://{}:{}", scheme, host, port),
                        None => format!("{}://{}", scheme, host),
                    }
                }
                (None, None) => return Err(missing("endpoint_url")),
            };
            let parsed = url::Url::parse(&endpoint_url).map_err(|e| {
                BackupError::Configuration(format!("remote.endpoint_url is invalid: {}", e))
            })?;
            if use_tls && parsed.scheme() != "https" {
                return Err(BackupError::Configuration(format!(
                    "remote.use_tls is set but endpoint {} is not https",
                    endpoint_url
                )));
            }

            Ok(RemoteConfig::S3(S3Config {
                endpoint_url,
                region: non_empty(raw.region).unwrap_or_else(|| "us-east-1".to_string()),
                bucket: non_empty(raw.bucket).ok_or_else(|| missing("bucket"))?,
                access_key_id: non_empty(raw.access_key_id)
                    .ok_or_else(|| missing("access_key_id"))?,
                secret_access_key: non_empty(raw.secret_access_key)
                    .ok_or_else(|| missing("secret_access_key"))?,
                folder_prefix: non_empty(raw.directory)
                    .map(|d| d.trim_matches('/').to_string())
                    .filter(|d| !d.is_empty()),
                path_style: raw.path_style.unwrap_or(true),
            }))
        }
        "directory" => {
            let root = non_empty(raw.directory).ok_or_else(|| missing("directory"))?;
            Ok(RemoteConfig::Directory {
                root: PathBuf::from(root),
            })
        }
        other => Err(BackupError::Configuration(format!(
            "Unknown remote.backend {:?} (expected \"s3\" or \"directory\")",
            other
        ))),
    }
}
