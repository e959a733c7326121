//! Run summaries for whoever watches the backups.

use anyhow::{Result, bail};
use serde::Serialize;
use tracing::{error, info, warn};
use url::Url;

use crate::config::NotifyConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Success,
    Warning,
    Failure,
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub severity: Severity,
    pub subject: String,
    pub body: String,
    /// Timestamp token of the run.
    pub run: String,
}

#[allow(async_fn_in_trait)]
pub trait Notifier {
    async fn notify(&self, notification: &Notification) -> Result<()>;
}

/// Writes the summary into the run log.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        match notification.severity {
            Severity::Success => info!("{}\n{}", notification.subject, notification.body),
            Severity::Warning => warn!("{}\n{}", notification.subject, notification.body),
            Severity::Failure => error!("{}\n{}", notification.subject, notification.body),
        }
        Ok(())
    }
}

/// POSTs the notification as JSON.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: Url,
}

impl WebhookNotifier {
    pub fn new(url: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }
}

impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        let resp = self
            .client
            .post(self.url.clone())
            .json(notification)
            .send()
            .await?;
        if !resp.status().is_success() {
            bail!("Webhook {} answered with status {}", self.url, resp.status());
        }
        Ok(())
    }
}

pub struct Notifications {
    log: LogNotifier,
    webhook: Option<WebhookNotifier>,
    on_success: bool,
    on_failure: bool,
}

impl Notifications {
    pub fn from_config(config: &NotifyConfig) -> Self {
        Self {
            log: LogNotifier,
            webhook: config.webhook_url.clone().map(WebhookNotifier::new),
            on_success: config.on_success,
            on_failure: config.on_failure,
        }
    }

    /// Warnings ride on the failure switch.
    pub fn wants(&self, severity: Severity) -> bool {
        match severity {
            Severity::Success => self.on_success,
            Severity::Warning | Severity::Failure => self.on_failure,
        }
    }

    /// Delivery problems are logged, never propagated.
    pub async fn send(&self, notification: Notification) {
        if !self.wants(notification.severity) {
            return;
        }
        if let Err(e) = self.log.notify(&notification).await {
            warn!("Failed to log notification: {:#}", e);
        }
        if let Some(webhook) = &self.webhook {
            match webhook.notify(&notification).await {
                Ok(()) => info!("Notification sent: {}", notification.subject),
                Err(e) => warn!("Failed to send notification: {:#}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warning_follows_failure_switch() {
        let notifications = Notifications::from_config(&NotifyConfig {
            on_success: false,
            on_failure: true,
            webhook_url: None,
        });
        assert!(!notifications.wants(Severity::Success));
        assert!(notifications.wants(Severity::Warning));
        assert!(notifications.wants(Severity::Failure));
    }

    #[test]
    fn test_payload_shape() -> anyhow::Result<()> {
        let value = serde_json::to_value(Notification {
            severity: Severity::Warning,
            subject: "Backup completed with warnings".into(),
            body: "Upload failed".into(),
            run: "2026-10-15-02-00".into(),
        })?;
        assert_eq!(value["severity"], "warning");
        assert_eq!(value["run"], "2026-10-15-02-00");
        Ok(())
    }
}
