// src/item.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Broadcast,
    Story,
}

impl ItemKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemKind::Broadcast => "broadcast",
            ItemKind::Story => "story",
        }
    }
}

/// Media type of a story item. Broadcasts are always video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    Video,
    Image,
}

/// One downloadable rendition of an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaCandidate {
    pub url: String,
    /// Pixel height when the platform reports it.
    #[serde(default)]
    pub height: Option<u32>,
}

impl MediaCandidate {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            height: None,
        }
    }
}

/// A time-limited content unit observed on the platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EphemeralItem {
    /// Platform-unique id within `kind`.
    pub item_id: String,
    /// Registry id (username) of the owning target.
    pub target_id: String,
    pub display_name: String,
    pub kind: ItemKind,
    pub media_type: MediaType,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Volatile: refreshed in place on every tick while the item is active.
    #[serde(default)]
    pub viewer_count: Option<u64>,
    #[serde(default)]
    pub title: String,
    /// Ranked best-first.
    pub media: Vec<MediaCandidate>,
}

impl EphemeralItem {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| now > exp)
    }

    /// File extension used for the captured artifact.
    pub fn file_extension<'a>(&self, broadcast_format: &'a str) -> &'a str {
        match (self.kind, self.media_type) {
            (ItemKind::Broadcast, _) => broadcast_format,
            (ItemKind::Story, MediaType::Video) => "mp4",
            (ItemKind::Story, MediaType::Image) => "jpg",
        }
    }
}

/// Rendition preference for ranked candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quality {
    Highest,
    Lowest,
    /// Largest candidate whose height is `<=` the bound.
    MaxHeight(u32),
}

impl Quality {
    /// Parses `highest`, `lowest`, `best`, `720p`, ... Unknown input means highest.
    pub fn parse(s: &str) -> Self {
        let s = s.trim().to_ascii_lowercase();
        match s.as_str() {
            "lowest" | "worst" => Quality::Lowest,
            "highest" | "best" | "" => Quality::Highest,
            other => other
                .strip_suffix('p')
                .and_then(|n| n.parse::<u32>().ok())
                .map(Quality::MaxHeight)
                .unwrap_or(Quality::Highest),
        }
    }

    /// yt-dlp `--format` selector for this preference.
    pub fn ytdlp_format(self) -> String {
        match self {
            Quality::Highest => "best".to_string(),
            Quality::Lowest => "worst".to_string(),
            Quality::MaxHeight(h) => format!("best[height<={h}]"),
        }
    }

    /// Pick a URL from best-first candidates.
    pub fn select<'a>(self, candidates: &'a [MediaCandidate]) -> Option<&'a str> {
        let usable: Vec<&MediaCandidate> =
            candidates.iter().filter(|c| !c.url.trim().is_empty()).collect();
        let picked = match self {
            Quality::Highest => usable.first().copied(),
            Quality::Lowest => usable.last().copied(),
            Quality::MaxHeight(bound) => usable
                .iter()
                .copied()
                .find(|c| c.height.unwrap_or(0) <= bound)
                .or_else(|| usable.last().copied()),
        };
        picked.map(|c| c.url.as_str())
    }
}
