// src/monitor/mod.rs
//! State-diffing poller.
//!
//! Each [`Poller::tick`] computes the set of currently active items for the
//! whole registry, diffs it against the previous tick and emits
//! `ItemAppeared` / `ItemEnded`. A tick that cannot produce a full set (total
//! fetch failure, rate limit, cooldown) changes nothing and emits no diff.

pub mod freshness;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::error::PlatformError;
use crate::events::{EventBus, PipelineEvent};
use crate::item::{EphemeralItem, ItemKind, MediaType};
use crate::platform::{PlatformClient, RawItem, SessionGuard};
use crate::target::{Target, TargetRegistry};
use freshness::FreshnessCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStrategy {
    /// Bulk feed first, detail only for matched targets; per-target on failure.
    Aggregate,
    /// Always query every target.
    PerTarget,
}

impl PollStrategy {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "per_target" | "per-target" | "v1" => PollStrategy::PerTarget,
            _ => PollStrategy::Aggregate,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub kinds: Vec<ItemKind>,
    pub strategy: PollStrategy,
    pub batch_size: usize,
    pub batch_delay: Duration,
    pub download_videos: bool,
    pub download_images: bool,
    pub story_expire_hours: i64,
    pub use_freshness_cache: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            kinds: vec![ItemKind::Broadcast, ItemKind::Story],
            strategy: PollStrategy::Aggregate,
            batch_size: 20,
            batch_delay: Duration::from_secs(5),
            download_videos: true,
            download_images: true,
            story_expire_hours: 24,
            use_freshness_cache: true,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct PollState {
    pub last_poll_at: Option<DateTime<Utc>>,
    /// Always the result of the most recent successful tick.
    pub active_items: HashMap<String, EphemeralItem>,
    pub total_polls: u64,
    pub total_items_seen: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Diff applied.
    Polled {
        appeared: usize,
        ended: usize,
        target_errors: usize,
    },
    /// Session cooling down, or a rate limit hit mid-tick.
    Skipped,
    /// No usable result at all; state untouched.
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct PollerStats {
    pub targets: usize,
    pub active_items: usize,
    pub total_polls: u64,
    pub total_items_seen: u64,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub cooldown_remaining_secs: Option<u64>,
}

enum Abort {
    RateLimited(PlatformError),
    Total(String),
}

#[derive(Default)]
struct KindResult {
    items: Vec<EphemeralItem>,
    errors: usize,
}

pub struct Poller {
    cfg: MonitorConfig,
    client: Arc<dyn PlatformClient>,
    registry: Arc<TargetRegistry>,
    guard: Arc<SessionGuard>,
    bus: Arc<EventBus>,
    state: Mutex<PollState>,
    freshness: Mutex<FreshnessCache>,
}

impl Poller {
    pub fn new(
        cfg: MonitorConfig,
        client: Arc<dyn PlatformClient>,
        registry: Arc<TargetRegistry>,
        guard: Arc<SessionGuard>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            cfg,
            client,
            registry,
            guard,
            bus,
            state: Mutex::new(PollState::default()),
            freshness: Mutex::new(FreshnessCache::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PollState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn fresh(&self) -> MutexGuard<'_, FreshnessCache> {
        self.freshness.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn state(&self) -> PollState {
        self.lock().clone()
    }

    pub fn active_items(&self) -> Vec<EphemeralItem> {
        let mut v: Vec<EphemeralItem> = self.lock().active_items.values().cloned().collect();
        v.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        v
    }

    pub fn stats(&self) -> PollerStats {
        let st = self.lock();
        PollerStats {
            targets: self.registry.len(),
            active_items: st.active_items.len(),
            total_polls: st.total_polls,
            total_items_seen: st.total_items_seen,
            last_poll_at: st.last_poll_at,
            cooldown_remaining_secs: self.guard.cooling_down().map(|d| d.as_secs()),
        }
    }

    /// One poll cycle.
    pub async fn tick(&self) -> TickOutcome {
        if let Some(remaining) = self.guard.cooling_down() {
            tracing::debug!(target: "monitor", remaining_secs = remaining.as_secs(), "cooling down, tick skipped");
            metrics::counter!("monitor_tick_skipped_total").increment(1);
            return TickOutcome::Skipped;
        }
        metrics::counter!("monitor_ticks_total").increment(1);

        let targets: Vec<Target> = self
            .registry
            .enabled_by_priority()
            .into_iter()
            .filter(Target::is_resolved)
            .collect();
        let previous = self.lock().active_items.clone();

        let mut current = Vec::new();
        let mut target_errors = 0;
        for &kind in &self.cfg.kinds {
            match self.fetch_kind(kind, &targets, &previous).await {
                Ok(res) => {
                    target_errors += res.errors;
                    current.extend(res.items);
                }
                Err(Abort::RateLimited(e)) => {
                    self.guard.trip(&e.to_string());
                    metrics::counter!("monitor_tick_skipped_total").increment(1);
                    return TickOutcome::Skipped;
                }
                Err(Abort::Total(reason)) => {
                    tracing::warn!(target: "monitor", kind = kind.as_str(), reason = %reason, "poll failed, keeping previous state");
                    self.guard.record_failure();
                    return TickOutcome::Failed;
                }
            }
        }
        self.guard.record_success();

        let now = Utc::now();
        let current: Vec<EphemeralItem> = current
            .into_iter()
            .filter(|it| self.wanted(it, now))
            .collect();
        let (appeared, ended) = self.apply(current, now);
        let outcome = TickOutcome::Polled {
            appeared: appeared.len(),
            ended: ended.len(),
            target_errors,
        };

        for item in appeared {
            tracing::info!(
                target: "monitor",
                item_id = %item.item_id,
                target_id = %item.target_id,
                kind = item.kind.as_str(),
                "item appeared"
            );
            metrics::counter!("monitor_items_appeared_total").increment(1);
            self.bus.emit(PipelineEvent::ItemAppeared(item));
        }
        for item in ended {
            tracing::info!(
                target: "monitor",
                item_id = %item.item_id,
                target_id = %item.target_id,
                "item ended"
            );
            metrics::counter!("monitor_items_ended_total").increment(1);
            self.bus.emit(PipelineEvent::ItemEnded(item));
        }
        outcome
    }

    fn wanted(&self, item: &EphemeralItem, now: DateTime<Utc>) -> bool {
        if item.is_expired(now) {
            return false;
        }
        match (item.kind, item.media_type) {
            (ItemKind::Story, MediaType::Video) => self.cfg.download_videos,
            (ItemKind::Story, MediaType::Image) => self.cfg.download_images,
            (ItemKind::Broadcast, _) => true,
        }
    }

    /// Diff `current` against state and replace it. Known items only get
    /// their volatile fields refreshed.
    fn apply(
        &self,
        current: Vec<EphemeralItem>,
        now: DateTime<Utc>,
    ) -> (Vec<EphemeralItem>, Vec<EphemeralItem>) {
        let mut st = self.lock();
        let mut seen = HashSet::with_capacity(current.len());
        let mut appeared = Vec::new();
        for item in current {
            if !seen.insert(item.item_id.clone()) {
                continue;
            }
            match st.active_items.get_mut(&item.item_id) {
                Some(known) => {
                    known.viewer_count = item.viewer_count;
                    if !item.media.is_empty() {
                        known.media = item.media;
                    }
                }
                None => {
                    st.total_items_seen += 1;
                    st.active_items.insert(item.item_id.clone(), item.clone());
                    appeared.push(item);
                }
            }
        }
        let gone: Vec<String> = st
            .active_items
            .keys()
            .filter(|id| !seen.contains(*id))
            .cloned()
            .collect();
        let ended = gone
            .into_iter()
            .filter_map(|id| st.active_items.remove(&id))
            .collect();
        st.total_polls += 1;
        st.last_poll_at = Some(now);
        (appeared, ended)
    }

    async fn fetch_kind(
        &self,
        kind: ItemKind,
        targets: &[Target],
        previous: &HashMap<String, EphemeralItem>,
    ) -> Result<KindResult, Abort> {
        if targets.is_empty() {
            return Ok(KindResult::default());
        }
        if self.cfg.strategy == PollStrategy::Aggregate {
            match self.client.fetch_active_feed(kind).await {
                Ok(feed) => return self.from_feed(kind, targets, &feed, previous).await,
                Err(e) if e.is_rate_limited() => return Err(Abort::RateLimited(e)),
                Err(e) => {
                    tracing::warn!(target: "monitor", kind = kind.as_str(), error = %e, "aggregate feed failed, falling back to per-target");
                }
            }
        }
        self.per_target(kind, targets, previous).await
    }

    async fn from_feed(
        &self,
        kind: ItemKind,
        targets: &[Target],
        feed: &[crate::platform::FeedEntry],
        previous: &HashMap<String, EphemeralItem>,
    ) -> Result<KindResult, Abort> {
        let use_markers = self.cfg.use_freshness_cache && kind == ItemKind::Story;
        let mut out = KindResult::default();
        let matched: Vec<(&Target, Option<i64>)> = targets
            .iter()
            .filter_map(|t| {
                feed.iter()
                    .find(|e| t.matches_username(&e.username))
                    .map(|e| (t, e.freshness))
            })
            .collect();
        tracing::debug!(target: "monitor", kind = kind.as_str(), feed = feed.len(), matched = matched.len(), "aggregate feed");

        if use_markers {
            let present: Vec<String> = matched.iter().map(|(t, _)| t.id.clone()).collect();
            self.fresh().retain_targets(kind, &present);
        }

        for (target, marker) in matched {
            if use_markers && self.fresh().is_unchanged(&target.id, kind, marker) {
                out.items.extend(carry_over(previous, target, kind));
                continue;
            }
            match self.client.fetch_item_detail(target, kind).await {
                Ok(raw) => {
                    if use_markers {
                        self.fresh().record(&target.id, kind, marker);
                    }
                    out.items.extend(raw.iter().map(|r| self.bind(r, target)));
                }
                Err(e) if e.is_rate_limited() => return Err(Abort::RateLimited(e)),
                Err(e) => {
                    out.errors += 1;
                    self.target_failed(target, kind, &e);
                    out.items.extend(carry_over(previous, target, kind));
                }
            }
        }
        Ok(out)
    }

    async fn per_target(
        &self,
        kind: ItemKind,
        targets: &[Target],
        previous: &HashMap<String, EphemeralItem>,
    ) -> Result<KindResult, Abort> {
        let mut out = KindResult::default();
        let batch_size = self.cfg.batch_size.max(1);
        let batches = targets.len().div_ceil(batch_size);
        for (i, batch) in targets.chunks(batch_size).enumerate() {
            for target in batch {
                match self.client.fetch_item_detail(target, kind).await {
                    Ok(raw) => out.items.extend(raw.iter().map(|r| self.bind(r, target))),
                    Err(e) if e.is_rate_limited() => return Err(Abort::RateLimited(e)),
                    Err(e) => {
                        out.errors += 1;
                        self.target_failed(target, kind, &e);
                        out.items.extend(carry_over(previous, target, kind));
                    }
                }
            }
            if i + 1 < batches && !self.cfg.batch_delay.is_zero() {
                tokio::time::sleep(self.cfg.batch_delay).await;
            }
        }
        if out.errors == targets.len() {
            return Err(Abort::Total(format!(
                "all {} {} checks failed",
                targets.len(),
                kind.as_str()
            )));
        }
        Ok(out)
    }

    fn target_failed(&self, target: &Target, kind: ItemKind, err: &PlatformError) {
        tracing::warn!(target: "monitor", target_id = %target.id, kind = kind.as_str(), error = %err, "target check failed");
        metrics::counter!("monitor_target_errors_total").increment(1);
        self.fresh().forget(&target.id, kind);
        self.bus.emit(PipelineEvent::PollError {
            target_id: target.id.clone(),
            message: crate::error::truncate_message(&err.to_string()),
        });
    }

    fn bind(&self, raw: &RawItem, target: &Target) -> EphemeralItem {
        let started_at = raw.started_at_utc();
        let expires_at = match raw.kind {
            ItemKind::Story => Some(started_at + ChronoDuration::hours(self.cfg.story_expire_hours)),
            ItemKind::Broadcast => None,
        };
        EphemeralItem {
            item_id: raw.item_id.clone(),
            target_id: target.id.clone(),
            display_name: target.display_name.clone(),
            kind: raw.kind,
            media_type: raw.media_type,
            started_at,
            expires_at,
            viewer_count: raw.viewer_count,
            title: raw.title.clone(),
            media: raw.media.clone(),
        }
    }
}

/// Previous items of one target and kind, kept when its check failed.
fn carry_over(
    previous: &HashMap<String, EphemeralItem>,
    target: &Target,
    kind: ItemKind,
) -> Vec<EphemeralItem> {
    previous
        .values()
        .filter(|it| it.kind == kind && it.target_id == target.id)
        .cloned()
        .collect()
}
