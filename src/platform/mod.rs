// src/platform/mod.rs
//! Contract of the authenticated platform client plus the session cooldown
//! gate the poller consults before every tick.

pub mod http;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::PlatformError;
use crate::item::{ItemKind, MediaCandidate, MediaType};
use crate::target::Target;

/// An item as reported by the platform, before it is bound to a registry target.
#[derive(Debug, Clone, PartialEq)]
pub struct RawItem {
    pub item_id: String,
    pub account_username: String,
    pub account_id: Option<u64>,
    pub kind: ItemKind,
    pub media_type: MediaType,
    /// Unix seconds.
    pub started_at: Option<i64>,
    pub viewer_count: Option<u64>,
    pub title: String,
    /// Ranked best-first.
    pub media: Vec<MediaCandidate>,
}

impl RawItem {
    pub fn started_at_utc(&self) -> DateTime<Utc> {
        self.started_at
            .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
            .unwrap_or_else(Utc::now)
    }
}

/// One account in the aggregate feed of accounts currently publishing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedEntry {
    pub username: String,
    pub account_id: Option<u64>,
    /// Opaque per-account marker; unchanged marker = nothing new to fetch.
    pub freshness: Option<i64>,
}

#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// One bulk request listing accounts with active items of `kind`.
    async fn fetch_active_feed(&self, kind: ItemKind) -> Result<Vec<FeedEntry>, PlatformError>;

    /// Full detail for one target. Empty means nothing active.
    async fn fetch_item_detail(
        &self,
        target: &Target,
        kind: ItemKind,
    ) -> Result<Vec<RawItem>, PlatformError>;

    /// Username → platform account id.
    async fn resolve_identifier(&self, username: &str) -> Result<u64, PlatformError>;

    fn name(&self) -> &'static str {
        "platform"
    }
}

#[derive(Debug)]
struct GuardState {
    cooldown_until: Option<Instant>,
    consecutive_failures: u32,
}

/// Cooldown gate shared by everything that talks to one platform session.
///
/// A rate-limited response trips the cooldown at once; generic failures trip it
/// after `max_failures` consecutive failed ticks.
#[derive(Debug)]
pub struct SessionGuard {
    cooldown: Duration,
    max_failures: u32,
    state: Mutex<GuardState>,
}

impl SessionGuard {
    pub fn new(cooldown: Duration, max_failures: u32) -> Self {
        Self {
            cooldown,
            max_failures: max_failures.max(1),
            state: Mutex::new(GuardState {
                cooldown_until: None,
                consecutive_failures: 0,
            }),
        }
    }

    /// Remaining cooldown, if any.
    pub fn cooling_down(&self) -> Option<Duration> {
        let st = self.lock();
        st.cooldown_until
            .and_then(|until| until.checked_duration_since(Instant::now()))
            .filter(|d| !d.is_zero())
    }

    pub fn trip(&self, reason: &str) {
        let mut st = self.lock();
        st.cooldown_until = Some(Instant::now() + self.cooldown);
        st.consecutive_failures = 0;
        tracing::warn!(
            target: "monitor",
            cooldown_secs = self.cooldown.as_secs(),
            reason,
            "platform session cooling down"
        );
    }

    pub fn record_success(&self) {
        self.lock().consecutive_failures = 0;
    }

    pub fn record_failure(&self) {
        let tripped = {
            let mut st = self.lock();
            st.consecutive_failures += 1;
            st.consecutive_failures >= self.max_failures
        };
        if tripped {
            self.trip("consecutive failures");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GuardState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}
