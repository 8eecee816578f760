use anyhow::Result;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;

use super::{post_json_with_retry, Level, Notification, Notifier};

#[derive(Clone)]
pub struct DiscordNotifier {
    webhook: String,
    client: Client,
    timeout: Duration,
    max_retries: u8,
}

impl DiscordNotifier {
    pub fn new(webhook: String) -> Self {
        Self {
            webhook,
            client: Client::new(),
            timeout: Duration::from_secs(10),
            max_retries: 3,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }

    pub fn with_retries(mut self, retries: u8) -> Self {
        self.max_retries = retries;
        self
    }
}

#[async_trait::async_trait]
impl Notifier for DiscordNotifier {
    fn name(&self) -> &'static str {
        "discord"
    }

    async fn send(&self, n: &Notification) -> Result<()> {
        let payload = DiscordWebhookPayload::embed(n);
        post_json_with_retry(
            &self.client,
            &self.webhook,
            &payload,
            self.timeout,
            self.max_retries,
        )
        .await
    }
}

fn color(level: Level) -> u32 {
    match level {
        Level::Info => 0x3498db,
        Level::Success => 0x2ecc71,
        Level::Warning => 0xf39c12,
        Level::Error => 0xe74c3c,
    }
}

#[derive(Serialize)]
struct DiscordEmbed {
    title: String,
    description: String,
    color: u32,
    timestamp: String,
}

#[derive(Serialize)]
struct DiscordWebhookPayload {
    content: Option<String>,
    embeds: Vec<DiscordEmbed>,
}

impl DiscordWebhookPayload {
    fn embed(n: &Notification) -> Self {
        // Discord caps embed titles at 256 and descriptions at 4096 chars.
        Self {
            content: None,
            embeds: vec![DiscordEmbed {
                title: n.title.chars().take(256).collect(),
                description: n.body.chars().take(4096).collect(),
                color: color(n.level),
                timestamp: chrono::Utc::now().to_rfc3339(),
            }],
        }
    }
}
