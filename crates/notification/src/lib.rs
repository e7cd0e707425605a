//! Notification stage: consume `notifQ`, debounce per camera, deliver to an
//! external chat channel (Telegram-shaped: `sendMessage`/`sendPhoto`).
//!
//! Debounce state (`last_sent_at` per camera) is local to this worker and is
//! lost on restart, same as the Motion Detector's per-camera state in the
//! Detection stage — acceptable because a restart simply means the next
//! notification for that camera is allowed through immediately.

use camwatch_common::{EventType, NotificationJob, PipelineError, QueueMessage, Result};
use camwatch_storage::EventStore;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::Receiver;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Timeout for a single delivery attempt. Delivery failures are logged and
/// never retried (at-most-once).
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Credentials and delivery settings for the external chat channel. `None`
/// fields mean notifications are disabled: the worker still drains `notifQ`
/// but delivers nothing.
#[derive(Debug, Clone)]
pub struct NotificationConfig {
    pub enabled: bool,
    pub bot_token: Option<String>,
    pub chat_id: Option<String>,
    pub debounce_seconds: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: std::env::var("NOTIFICATIONS_ENABLED")
                .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
                .unwrap_or(true),
            bot_token: std::env::var("TELEGRAM_BOT_TOKEN").ok(),
            chat_id: std::env::var("TELEGRAM_CHAT_ID").ok(),
            debounce_seconds: std::env::var("NOTIFICATION_DEBOUNCE_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
        }
    }
}

impl NotificationConfig {
    /// Credentials configured and notifications not explicitly disabled.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.enabled && self.bot_token.is_some() && self.chat_id.is_some()
    }
}

/// A thin client over the Telegram Bot API's `sendMessage`/`sendPhoto`
/// endpoints. Any webhook-style chat API with the same "text or
/// text+photo" shape would slot in behind the same `send` signature.
pub struct TelegramNotifier {
    client: reqwest::Client,
    base_url: String,
    chat_id: String,
}

impl TelegramNotifier {
    #[must_use]
    pub fn new(bot_token: &str, chat_id: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(DELIVERY_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: format!("https://api.telegram.org/bot{bot_token}"),
            chat_id,
        }
    }

    /// Send `message`, attaching the image at `image_path` if it exists on
    /// disk; otherwise send a text-only message.
    pub async fn send(&self, message: &str, image_path: Option<&str>) -> Result<()> {
        let image_bytes = match image_path {
            Some(path) if Path::new(path).exists() => tokio::fs::read(path).await.ok(),
            _ => None,
        };

        let response = if let Some(bytes) = image_bytes {
            let part = reqwest::multipart::Part::bytes(bytes).file_name("event.jpg");
            let form = reqwest::multipart::Form::new()
                .text("chat_id", self.chat_id.clone())
                .text("caption", message.to_string())
                .part("photo", part);
            self.client
                .post(format!("{}/sendPhoto", self.base_url))
                .multipart(form)
                .send()
                .await
        } else {
            self.client
                .post(format!("{}/sendMessage", self.base_url))
                .json(&serde_json::json!({ "chat_id": self.chat_id, "text": message }))
                .send()
                .await
        };

        let response = response.map_err(|e| PipelineError::Delivery(e.to_string()))?;
        if !response.status().is_success() {
            return Err(PipelineError::Delivery(format!(
                "delivery failed with status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

fn human_message(event_type: EventType, occurred_at: chrono::DateTime<chrono::Utc>, camera: &str) -> String {
    let title = match event_type {
        EventType::Person => "Person detected",
        EventType::Vehicle => "Vehicle detected",
    };
    format!("{title}\nCamera: {camera}\nWhen: {}", occurred_at.to_rfc3339())
}

/// Run the Notification stage until `stop` is cancelled or `notifQ` closes.
/// Sends no further poison pills: this is the last stage in the pipeline.
pub async fn run(
    notif_rx: &mut Receiver<QueueMessage<NotificationJob>>,
    notifier: Option<Arc<TelegramNotifier>>,
    store: Arc<dyn EventStore>,
    debounce: Duration,
    stop: CancellationToken,
) -> Result<()> {
    info!(active = notifier.is_some(), "notification worker starting");
    let mut last_sent: HashMap<String, Instant> = HashMap::new();

    loop {
        let message = tokio::select! {
            _ = stop.cancelled() => break,
            message = notif_rx.recv() => message,
        };

        match message {
            Some(QueueMessage::Item(job)) => {
                deliver_one(job, &notifier, &*store, debounce, &mut last_sent).await;
            }
            Some(QueueMessage::PoisonPill) | None => break,
        }
    }

    info!("notification worker stopped");
    Ok(())
}

async fn deliver_one(
    job: NotificationJob,
    notifier: &Option<Arc<TelegramNotifier>>,
    store: &dyn EventStore,
    debounce: Duration,
    last_sent: &mut HashMap<String, Instant>,
) {
    let Some(notifier) = notifier else {
        return;
    };

    if should_skip(&job.camera, last_sent, debounce) {
        return;
    }

    let message = human_message(job.event_type, job.occurred_at, &job.camera);
    let result = notifier.send(&message, Some(&job.crop_path)).await;

    let status = match &result {
        Ok(()) => {
            last_sent.insert(job.camera.clone(), Instant::now());
            "sent"
        }
        Err(err) => {
            error!(camera = %job.camera, error = %err, "notification delivery failed");
            "failed"
        }
    };

    let sent_at = result.is_ok().then(chrono::Utc::now);
    if let Err(err) = store
        .record_notification(job.event_type, job.event_id, &job.camera, job.occurred_at, sent_at, status)
        .await
    {
        warn!(error = %err, "failed to record notification outcome");
    }
}

/// `now - last_sent_at < debounce` skips; equality or later proceeds (strict
/// `<` on the skip condition).
fn should_skip(camera: &str, last_sent: &HashMap<String, Instant>, debounce: Duration) -> bool {
    match last_sent.get(camera) {
        Some(last) => last.elapsed() < debounce,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_active_requires_both_credentials() {
        let mut config = NotificationConfig {
            enabled: true,
            bot_token: None,
            chat_id: None,
            debounce_seconds: 60,
        };
        assert!(!config.is_active());
        config.bot_token = Some("t".to_string());
        assert!(!config.is_active());
        config.chat_id = Some("c".to_string());
        assert!(config.is_active());
    }

    #[test]
    fn test_is_active_respects_disabled_flag() {
        let config = NotificationConfig {
            enabled: false,
            bot_token: Some("t".to_string()),
            chat_id: Some("c".to_string()),
            debounce_seconds: 60,
        };
        assert!(!config.is_active());
    }

    #[test]
    fn test_should_skip_within_debounce_window() {
        let mut last_sent = HashMap::new();
        last_sent.insert("cam1".to_string(), Instant::now());
        assert!(should_skip("cam1", &last_sent, Duration::from_secs(60)));
    }

    #[test]
    fn test_should_skip_false_for_unknown_camera() {
        let last_sent = HashMap::new();
        assert!(!should_skip("cam1", &last_sent, Duration::from_secs(60)));
    }

    #[test]
    fn test_should_skip_false_after_window_elapses() {
        let mut last_sent = HashMap::new();
        // A "sent" time far enough in the past that the zero-length debounce
        // window has certainly elapsed.
        last_sent.insert(
            "cam1".to_string(),
            Instant::now()
                .checked_sub(Duration::from_millis(5))
                .unwrap_or_else(Instant::now),
        );
        assert!(!should_skip("cam1", &last_sent, Duration::from_millis(1)));
    }

    #[test]
    fn test_human_message_person() {
        let now = chrono::Utc::now();
        let msg = human_message(EventType::Person, now, "front-door");
        assert!(msg.contains("Person detected"));
        assert!(msg.contains("front-door"));
    }

    #[test]
    fn test_human_message_vehicle() {
        let now = chrono::Utc::now();
        let msg = human_message(EventType::Vehicle, now, "driveway");
        assert!(msg.contains("Vehicle detected"));
    }
}
