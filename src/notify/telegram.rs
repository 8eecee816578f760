use anyhow::Result;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;

use super::{post_json_with_retry, Level, Notification, Notifier};

const API_BASE: &str = "https://api.telegram.org";

pub struct TelegramNotifier {
    token: String,
    chat_id: String,
    api_base: String,
    client: Client,
    timeout: Duration,
    max_retries: u8,
}

impl TelegramNotifier {
    pub fn new(token: String, chat_id: String) -> Self {
        Self {
            token,
            chat_id,
            api_base: API_BASE.to_string(),
            client: Client::new(),
            timeout: Duration::from_secs(10),
            max_retries: 3,
        }
    }

    /// Point at a different Bot API host.
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into();
        self
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/bot{}/sendMessage",
            self.api_base.trim_end_matches('/'),
            self.token
        )
    }
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: String,
    parse_mode: &'static str,
    disable_web_page_preview: bool,
}

fn marker(level: Level) -> &'static str {
    match level {
        Level::Info => "[info]",
        Level::Success => "[ok]",
        Level::Warning => "[warn]",
        Level::Error => "[error]",
    }
}

fn render(n: &Notification) -> String {
    let text = format!(
        "{} <b>{}</b>\n{}",
        marker(n.level),
        html_escape::encode_text(&n.title),
        html_escape::encode_text(&n.body)
    );
    // Bot API message limit.
    text.chars().take(4096).collect()
}

#[async_trait::async_trait]
impl Notifier for TelegramNotifier {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn send(&self, n: &Notification) -> Result<()> {
        let body = SendMessage {
            chat_id: &self.chat_id,
            text: render(n),
            parse_mode: "HTML",
            disable_web_page_preview: true,
        };
        post_json_with_retry(
            &self.client,
            &self.endpoint(),
            &body,
            self.timeout,
            self.max_retries,
        )
        .await
    }
}
