//! Notification dispatch: drains the outbox to the configured channel.
//! Supports: HTTP webhook (JSON POST) and log-only delivery.

use std::sync::Arc;
use std::time::Duration;

use brgy_core::config::NotificationConfig;
use brgy_core::error::{BrgyError, Result};
use serde::Serialize;

use crate::db::RecordsDb;
use crate::notify::Notification;

/// Where queued notifications are delivered.
#[derive(Debug, Clone)]
pub enum NotifyTarget {
    /// Generic HTTP webhook: POST with JSON body.
    Webhook {
        url: String,
        headers: Vec<(String, String)>,
    },
    /// Write to the log and mark as sent. Used when no webhook is configured.
    Log,
}

impl NotifyTarget {
    pub fn channel(&self) -> &'static str {
        match self {
            NotifyTarget::Webhook { .. } => "webhook",
            NotifyTarget::Log => "log",
        }
    }
}

/// Build the delivery target from the `[notifications]` config section.
pub fn target_from_config(config: &NotificationConfig) -> NotifyTarget {
    if config.webhook_url.trim().is_empty() {
        NotifyTarget::Log
    } else {
        NotifyTarget::Webhook {
            url: config.webhook_url.clone(),
            headers: config.webhook_headers.clone(),
        }
    }
}

/// Counts from one outbox pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub sent: usize,
    pub failed: usize,
}

/// Deliver one notification.
pub async fn dispatch(
    notification: &Notification,
    target: &NotifyTarget,
    client: &reqwest::Client,
) -> Result<()> {
    match target {
        NotifyTarget::Webhook { url, headers } => {
            send_webhook(client, url, headers, notification).await
        }
        NotifyTarget::Log => {
            tracing::info!(
                "[{}] {} → {} recipient(s): {}",
                notification.priority.as_str(),
                notification.title,
                notification.recipients.len(),
                notification.message
            );
            Ok(())
        }
    }
}

async fn send_webhook(
    client: &reqwest::Client,
    url: &str,
    headers: &[(String, String)],
    notification: &Notification,
) -> Result<()> {
    let mut req = client
        .post(url)
        .json(&serde_json::json!({
            "id": notification.id,
            "title": notification.title,
            "message": notification.message,
            "type": notification.notif_type,
            "priority": notification.priority.as_str(),
            "source": notification.source,
            "recipients": notification.recipients,
            "created_at": notification.created_at.to_rfc3339(),
        }))
        .timeout(Duration::from_secs(10));

    for (key, value) in headers {
        req = req.header(key.as_str(), value.as_str());
    }

    let resp = req
        .send()
        .await
        .map_err(|e| BrgyError::Notify(format!("Webhook send failed: {e}")))?;

    if resp.status().is_success() {
        tracing::info!("Webhook notification {} sent to {}", notification.id, url);
        Ok(())
    } else {
        Err(BrgyError::Notify(format!("Webhook error {}", resp.status())))
    }
}

/// Run a records query on the blocking pool.
async fn with_db<T, F>(db: &Arc<RecordsDb>, f: F) -> Result<T>
where
    F: FnOnce(&RecordsDb) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let db = db.clone();
    tokio::task::spawn_blocking(move || f(db.as_ref()))
        .await
        .map_err(|e| BrgyError::Database(format!("blocking task failed: {e}")))?
}

/// Deliver up to `batch_size` queued notifications.
///
/// Each delivery outcome is written back before the next one is attempted.
/// Notifications that have used up `max_attempts` are left alone.
pub async fn dispatch_pending(
    db: Arc<RecordsDb>,
    target: &NotifyTarget,
    batch_size: usize,
    max_attempts: u32,
) -> Result<DispatchReport> {
    let queued = with_db(&db, move |db| db.pending_notifications(batch_size, max_attempts)).await?;
    let mut report = DispatchReport::default();
    if queued.is_empty() {
        return Ok(report);
    }

    let client = reqwest::Client::new();
    let channel = target.channel();
    for notification in &queued {
        let id = notification.id;
        match dispatch(notification, target, &client).await {
            Ok(()) => {
                with_db(&db, move |db| db.mark_notification_sent(id, channel)).await?;
                report.sent += 1;
            }
            Err(e) => {
                tracing::warn!(
                    "Notification {} delivery failed (attempt {}/{}): {e}",
                    notification.id,
                    notification.attempts + 1,
                    max_attempts
                );
                let error = e.to_string();
                with_db(&db, move |db| db.mark_notification_failed(id, channel, &error)).await?;
                report.failed += 1;
            }
        }
    }

    tracing::info!(
        "Notification dispatch: {} sent, {} failed via {}",
        report.sent,
        report.failed,
        channel
    );
    Ok(report)
}
