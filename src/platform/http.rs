// src/platform/http.rs
//! Thin JSON adapter over the platform's private HTTP API.
//!
//! Session establishment is handled elsewhere; this client only replays a
//! session cookie supplied through configuration.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;

use super::{FeedEntry, PlatformClient, RawItem};
use crate::error::PlatformError;
use crate::item::{ItemKind, MediaCandidate, MediaType};
use crate::target::Target;

#[derive(Debug, Clone)]
pub struct HttpPlatformConfig {
    pub base_url: String,
    pub session_cookie: Option<String>,
    pub user_agent: String,
    pub timeout: Duration,
}

#[derive(Clone)]
pub struct HttpPlatformClient {
    cfg: HttpPlatformConfig,
    client: Client,
}

impl HttpPlatformClient {
    pub fn new(cfg: HttpPlatformConfig) -> Result<Self, PlatformError> {
        let client = Client::builder()
            .user_agent(cfg.user_agent.clone())
            .timeout(cfg.timeout)
            .build()
            .map_err(|e| PlatformError::Network(e.to_string()))?;
        Ok(Self { cfg, client })
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.cfg.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T, PlatformError> {
        let mut req = self.client.get(self.url(path));
        if let Some(cookie) = &self.cfg.session_cookie {
            req = req.header(reqwest::header::COOKIE, cookie);
        }
        let resp = req.send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        classify_status(status, &body)?;
        serde_json::from_str(&body).map_err(|e| PlatformError::Malformed(format!("{path}: {e}")))
    }
}

/// Map an HTTP status + body onto the platform error taxonomy.
pub(crate) fn classify_status(status: StatusCode, body: &str) -> Result<(), PlatformError> {
    let lower = body.to_ascii_lowercase();
    if status == StatusCode::TOO_MANY_REQUESTS
        || lower.contains("please wait")
        || lower.contains("rate limit")
    {
        return Err(PlatformError::RateLimited(format!("status {status}")));
    }
    if status == StatusCode::NOT_FOUND {
        return Err(PlatformError::NotFound(format!("status {status}")));
    }
    if !status.is_success() {
        let snippet: String = body.chars().take(200).collect();
        return Err(PlatformError::Api {
            status: status.as_u16(),
            message: snippet,
        });
    }
    Ok(())
}

// --- wire shapes (tolerant: every field optional) ---

#[derive(Debug, Deserialize, Default)]
struct WireUser {
    #[serde(default)]
    username: String,
    #[serde(default)]
    pk: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct TrayResponse {
    #[serde(default)]
    broadcasts: Vec<TrayBroadcast>,
    #[serde(default)]
    tray: Vec<TrayReel>,
}

#[derive(Debug, Deserialize)]
struct TrayBroadcast {
    #[serde(default)]
    user: WireUser,
    #[serde(default)]
    published_time: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct TrayReel {
    #[serde(default)]
    user: WireUser,
    #[serde(default)]
    latest_reel_media: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct LiveInfo {
    #[serde(default)]
    id: Option<serde_json::Value>,
    #[serde(default)]
    broadcast_message: String,
    #[serde(default)]
    viewer_count: Option<f64>,
    #[serde(default)]
    published_time: Option<i64>,
    #[serde(default)]
    dash_abr_playback_url: Option<String>,
    #[serde(default)]
    dash_playback_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReelResponse {
    #[serde(default)]
    reel: Option<Reel>,
}

#[derive(Debug, Deserialize, Default)]
struct Reel {
    #[serde(default)]
    items: Vec<ReelItem>,
}

#[derive(Debug, Deserialize)]
struct ReelItem {
    #[serde(default)]
    pk: Option<serde_json::Value>,
    #[serde(default)]
    id: Option<serde_json::Value>,
    #[serde(default = "default_media_type")]
    media_type: u8,
    #[serde(default)]
    taken_at: Option<i64>,
    #[serde(default)]
    video_versions: Vec<WireVersion>,
    #[serde(default)]
    image_versions2: Option<ImageVersions>,
}

fn default_media_type() -> u8 {
    1
}

#[derive(Debug, Deserialize)]
struct ImageVersions {
    #[serde(default)]
    candidates: Vec<WireVersion>,
}

#[derive(Debug, Deserialize)]
struct WireVersion {
    #[serde(default)]
    url: String,
    #[serde(default)]
    height: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct UserInfoResponse {
    #[serde(default)]
    user: WireUser,
}

fn id_string(v: &Option<serde_json::Value>) -> Option<String> {
    match v {
        Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

fn id_u64(v: &Option<serde_json::Value>) -> Option<u64> {
    id_string(v).and_then(|s| s.parse().ok())
}

fn to_candidates(versions: Vec<WireVersion>) -> Vec<MediaCandidate> {
    versions
        .into_iter()
        .filter(|v| !v.url.is_empty())
        .map(|v| MediaCandidate {
            url: v.url,
            height: v.height,
        })
        .collect()
}

fn parse_feed(kind: ItemKind, tray: TrayResponse) -> Vec<FeedEntry> {
    match kind {
        ItemKind::Broadcast => tray
            .broadcasts
            .into_iter()
            .filter(|b| !b.user.username.is_empty())
            .map(|b| FeedEntry {
                account_id: id_u64(&b.user.pk),
                username: b.user.username,
                freshness: b.published_time,
            })
            .collect(),
        ItemKind::Story => tray
            .tray
            .into_iter()
            .filter(|r| !r.user.username.is_empty())
            .map(|r| FeedEntry {
                account_id: id_u64(&r.user.pk),
                username: r.user.username,
                freshness: r.latest_reel_media,
            })
            .collect(),
    }
}

fn parse_live(target: &Target, info: LiveInfo) -> Option<RawItem> {
    let item_id = id_string(&info.id)?;
    let media: Vec<MediaCandidate> = [info.dash_abr_playback_url, info.dash_playback_url]
        .into_iter()
        .flatten()
        .filter(|u| !u.is_empty())
        .map(MediaCandidate::new)
        .collect();
    Some(RawItem {
        item_id,
        account_username: target.id.clone(),
        account_id: target.external_account_id,
        kind: ItemKind::Broadcast,
        media_type: MediaType::Video,
        started_at: info.published_time,
        viewer_count: info.viewer_count.map(|v| v.max(0.0) as u64),
        title: info.broadcast_message,
        media,
    })
}

fn parse_reel_item(target: &Target, item: ReelItem) -> Option<RawItem> {
    let item_id = id_string(&item.pk).or_else(|| id_string(&item.id))?;
    let images = item
        .image_versions2
        .map(|v| to_candidates(v.candidates))
        .unwrap_or_default();
    let (media_type, media) = if item.media_type == 2 {
        let mut videos = to_candidates(item.video_versions);
        if videos.is_empty() {
            videos = images;
        }
        (MediaType::Video, videos)
    } else {
        (MediaType::Image, images)
    };
    Some(RawItem {
        item_id,
        account_username: target.id.clone(),
        account_id: target.external_account_id,
        kind: ItemKind::Story,
        media_type,
        started_at: item.taken_at,
        viewer_count: None,
        title: String::new(),
        media,
    })
}

#[async_trait]
impl PlatformClient for HttpPlatformClient {
    async fn fetch_active_feed(&self, kind: ItemKind) -> Result<Vec<FeedEntry>, PlatformError> {
        let tray: TrayResponse = self.get_json("feed/reels_tray/").await?;
        Ok(parse_feed(kind, tray))
    }

    async fn fetch_item_detail(
        &self,
        target: &Target,
        kind: ItemKind,
    ) -> Result<Vec<RawItem>, PlatformError> {
        let Some(user_id) = target.external_account_id else {
            return Ok(Vec::new());
        };
        match kind {
            ItemKind::Broadcast => {
                match self.get_json::<LiveInfo>(&format!("live/{user_id}/info/")).await {
                    Ok(info) => Ok(parse_live(target, info).into_iter().collect()),
                    // 404 simply means "not live".
                    Err(PlatformError::NotFound(_)) => Ok(Vec::new()),
                    Err(e) => Err(e),
                }
            }
            ItemKind::Story => {
                match self
                    .get_json::<ReelResponse>(&format!("feed/user/{user_id}/story/"))
                    .await
                {
                    Ok(resp) => Ok(resp
                        .reel
                        .unwrap_or_default()
                        .items
                        .into_iter()
                        .filter_map(|it| parse_reel_item(target, it))
                        .collect()),
                    Err(PlatformError::NotFound(_)) => Ok(Vec::new()),
                    Err(e) => Err(e),
                }
            }
        }
    }

    async fn resolve_identifier(&self, username: &str) -> Result<u64, PlatformError> {
        let info: UserInfoResponse = self
            .get_json(&format!("users/{username}/usernameinfo/"))
            .await?;
        id_u64(&info.user.pk)
            .ok_or_else(|| PlatformError::Malformed(format!("no account id for {username}")))
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
