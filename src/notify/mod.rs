// src/notify/mod.rs
//! Outbound chat notifications (Discord webhook, Telegram bot).
//!
//! Delivery is best effort: failures are logged and never reach the capture
//! path. Which events produce a message is controlled by [`NotifyToggles`].

pub mod discord;
pub mod telegram;

use anyhow::{anyhow, Result};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use std::time::Duration;

use crate::capture::task::{format_size, CaptureTask};
use crate::config::NotifySettings;
use crate::events::PipelineEvent;
use crate::item::{EphemeralItem, ItemKind};

pub use discord::DiscordNotifier;
pub use telegram::TelegramNotifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub level: Level,
}

impl Notification {
    pub fn new(level: Level, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            level,
        }
    }
}

#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &'static str;
    async fn send(&self, n: &Notification) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct NotifyToggles {
    pub on_detected: bool,
    pub on_complete: bool,
    pub on_failed: bool,
    pub on_retry: bool,
    pub on_error: bool,
    pub lifecycle: bool,
}

impl From<&NotifySettings> for NotifyToggles {
    fn from(s: &NotifySettings) -> Self {
        Self {
            on_detected: s.on_detected,
            on_complete: s.on_complete,
            on_failed: s.on_failed,
            on_retry: s.on_retry,
            on_error: s.on_error,
            lifecycle: s.lifecycle,
        }
    }
}

fn kind_label(item: &EphemeralItem) -> &'static str {
    match item.kind {
        ItemKind::Broadcast => "live broadcast",
        ItemKind::Story => "story",
    }
}

fn task_duration(task: &CaptureTask) -> String {
    match task.duration() {
        Some(d) => {
            let secs = d.num_seconds().max(0);
            format!("{}m {:02}s", secs / 60, secs % 60)
        }
        None => "-".into(),
    }
}

/// Message for an event, or `None` when the event is never announced.
pub fn render_event(ev: &PipelineEvent) -> Option<Notification> {
    let n = match ev {
        PipelineEvent::ItemAppeared(item) => {
            let mut body = format!("{} started a {}", item.display_name, kind_label(item));
            if !item.title.is_empty() {
                body.push_str(&format!("\nTitle: {}", item.title));
            }
            if let Some(v) = item.viewer_count {
                body.push_str(&format!("\nViewers: {v}"));
            }
            Notification::new(Level::Info, format!("Detected: {}", item.target_id), body)
        }
        PipelineEvent::CaptureCompleted(t) => Notification::new(
            Level::Success,
            format!("Captured: {}", t.item.target_id),
            format!(
                "{} from {}\nSize: {}\nDuration: {}\nFile: {}",
                kind_label(&t.item),
                t.item.display_name,
                format_size(t.bytes_written),
                task_duration(t),
                t.output_path
                    .file_name()
                    .map(|f| f.to_string_lossy().into_owned())
                    .unwrap_or_default()
            ),
        ),
        PipelineEvent::CaptureRetry(t) => Notification::new(
            Level::Warning,
            format!("Retrying: {}", t.item.target_id),
            format!(
                "Attempt {}/{} failed: {}\nNext attempt: {}",
                t.attempt_count,
                t.max_attempts,
                t.error_message,
                t.attempt_count + 1
            ),
        ),
        PipelineEvent::CaptureFailed(t) => Notification::new(
            Level::Error,
            format!("Capture failed: {}", t.item.target_id),
            format!(
                "{} from {}\nReason ({}): {}\nAttempts: {}/{}",
                kind_label(&t.item),
                t.item.display_name,
                t.error_class.map(|c| c.as_str()).unwrap_or("unknown"),
                t.error_message,
                t.attempt_count,
                t.max_attempts
            ),
        ),
        PipelineEvent::PollError { target_id, message } => Notification::new(
            Level::Warning,
            format!("Check failed: {target_id}"),
            message.clone(),
        ),
        PipelineEvent::ItemEnded(_) | PipelineEvent::CaptureStarted(_) => return None,
    };
    Some(n)
}

/// Fans one notification out to every configured channel.
pub struct NotifierMux {
    notifiers: Vec<Box<dyn Notifier>>,
    toggles: NotifyToggles,
}

impl NotifierMux {
    pub fn new(notifiers: Vec<Box<dyn Notifier>>, toggles: NotifyToggles) -> Self {
        Self { notifiers, toggles }
    }

    /// Channels without credentials are left out.
    pub fn from_settings(s: &NotifySettings) -> Self {
        let mut notifiers: Vec<Box<dyn Notifier>> = Vec::new();
        if !s.discord_webhook_url.trim().is_empty() {
            notifiers.push(Box::new(DiscordNotifier::new(s.discord_webhook_url.clone())));
        }
        if !s.telegram_bot_token.trim().is_empty() && !s.telegram_chat_id.trim().is_empty() {
            notifiers.push(Box::new(TelegramNotifier::new(
                s.telegram_bot_token.clone(),
                s.telegram_chat_id.clone(),
            )));
        }
        if notifiers.is_empty() {
            tracing::info!(target: "notify", "no notification channels configured");
        }
        Self::new(notifiers, NotifyToggles::from(s))
    }

    pub fn is_empty(&self) -> bool {
        self.notifiers.is_empty()
    }

    fn wants(&self, ev: &PipelineEvent) -> bool {
        let t = &self.toggles;
        match ev {
            PipelineEvent::ItemAppeared(_) => t.on_detected,
            PipelineEvent::CaptureCompleted(_) => t.on_complete,
            PipelineEvent::CaptureFailed(_) => t.on_failed,
            PipelineEvent::CaptureRetry(_) => t.on_retry,
            PipelineEvent::PollError { .. } => t.on_error,
            PipelineEvent::ItemEnded(_) | PipelineEvent::CaptureStarted(_) => false,
        }
    }

    /// Render (subject to toggles) and send.
    pub async fn on_event(&self, ev: &PipelineEvent) {
        if self.notifiers.is_empty() || !self.wants(ev) {
            return;
        }
        if let Some(n) = render_event(ev) {
            self.notify(&n).await;
        }
    }

    pub async fn notify(&self, n: &Notification) {
        for notifier in &self.notifiers {
            match notifier.send(n).await {
                Ok(()) => {
                    tracing::debug!(target: "notify", channel = notifier.name(), title = %n.title, "notification sent")
                }
                Err(e) => {
                    tracing::warn!(target: "notify", channel = notifier.name(), error = %format!("{e:#}"), "notification failed")
                }
            }
        }
    }

    pub async fn startup(&self, targets: usize, max_concurrent: usize) {
        if self.toggles.lifecycle {
            self.notify(&Notification::new(
                Level::Info,
                "Recorder started",
                format!("Watching {targets} accounts, up to {max_concurrent} concurrent captures"),
            ))
            .await;
        }
    }

    pub async fn shutdown(&self, completed: usize, failed: usize) {
        if self.toggles.lifecycle {
            self.notify(&Notification::new(
                Level::Info,
                "Recorder stopped",
                format!("Completed {completed} captures, {failed} failed"),
            ))
            .await;
        }
    }
}

const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

/// POST `body` as JSON with bounded retries. Exponential backoff between
/// attempts; HTTP 429 waits for `Retry-After` instead.
pub(crate) async fn post_json_with_retry<T: Serialize + ?Sized>(
    client: &Client,
    url: &str,
    body: &T,
    timeout: Duration,
    max_retries: u8,
) -> Result<()> {
    let max_retries = max_retries.max(1);
    let mut attempt: u8 = 0;
    loop {
        attempt += 1;
        let backoff = Duration::from_millis(500u64 << (attempt - 1).min(6));
        // URLs can carry bot tokens; keep them out of error text.
        let res = client
            .post(url)
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(reqwest::Error::without_url);
        match res {
            Ok(rsp) if rsp.status() == StatusCode::TOO_MANY_REQUESTS => {
                if attempt >= max_retries {
                    return Err(anyhow!("rate limited by notification endpoint"));
                }
                let wait = rsp
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.trim().parse::<f64>().ok())
                    .map(|secs| Duration::from_secs_f64(secs.max(0.0)).min(MAX_RETRY_AFTER))
                    .unwrap_or(backoff);
                tracing::debug!(target: "notify", wait_ms = wait.as_millis() as u64, "notification endpoint rate limited");
                tokio::time::sleep(wait).await;
            }
            Ok(rsp) => match rsp.error_for_status().map_err(reqwest::Error::without_url) {
                Ok(_) => return Ok(()),
                Err(e) if attempt < max_retries => {
                    tracing::debug!(target: "notify", error = %e, attempt, "notification HTTP error, retrying");
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(anyhow!("notification HTTP error: {e}")),
            },
            Err(e) if attempt < max_retries => {
                tracing::debug!(target: "notify", error = %e, attempt, "notification request failed, retrying");
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(anyhow!("notification request failed: {e}")),
        }
    }
}
