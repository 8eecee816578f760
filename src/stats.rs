// src/stats.rs
//! Per-day counters, persisted as JSON keyed by `YYYY-MM-DD`.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::events::PipelineEvent;
use crate::item::ItemKind;
use crate::persist::write_json_atomic;
use crate::sinks::EventSink;

/// Days kept on disk.
const RETAIN_DAYS: usize = 30;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayStats {
    #[serde(default)]
    pub checks: u64,
    #[serde(default)]
    pub broadcasts_detected: u64,
    #[serde(default)]
    pub stories_detected: u64,
    #[serde(default)]
    pub captures_completed: u64,
    #[serde(default)]
    pub captures_failed: u64,
    #[serde(default)]
    pub retries: u64,
    #[serde(default)]
    pub poll_errors: u64,
    #[serde(default)]
    pub bytes: u64,
}

#[derive(Debug)]
pub struct DailyStats {
    path: Option<PathBuf>,
    days: Mutex<BTreeMap<NaiveDate, DayStats>>,
    write_lock: tokio::sync::Mutex<()>,
}

impl DailyStats {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            days: Mutex::new(BTreeMap::new()),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Missing or unreadable file starts from zero.
    pub async fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let days = match tokio::fs::read_to_string(&path).await {
            Ok(s) => serde_json::from_str(&s).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "stats file unreadable, starting fresh");
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        };
        Self {
            path: Some(path),
            days: Mutex::new(days),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<NaiveDate, DayStats>> {
        self.days.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn with_day(&self, at: DateTime<Utc>, f: impl FnOnce(&mut DayStats)) {
        let mut days = self.lock();
        f(days.entry(at.date_naive()).or_default());
        while days.len() > RETAIN_DAYS {
            let Some(oldest) = days.keys().next().copied() else { break };
            days.remove(&oldest);
        }
    }

    pub fn record_check(&self, at: DateTime<Utc>) {
        self.with_day(at, |d| d.checks += 1);
    }

    /// Returns whether the event changed any counter.
    pub fn record(&self, ev: &PipelineEvent, at: DateTime<Utc>) -> bool {
        let mut changed = true;
        self.with_day(at, |d| match ev {
            PipelineEvent::ItemAppeared(item) => match item.kind {
                ItemKind::Broadcast => d.broadcasts_detected += 1,
                ItemKind::Story => d.stories_detected += 1,
            },
            PipelineEvent::CaptureCompleted(t) => {
                d.captures_completed += 1;
                d.bytes += t.bytes_written;
            }
            PipelineEvent::CaptureFailed(_) => d.captures_failed += 1,
            PipelineEvent::CaptureRetry(_) => d.retries += 1,
            PipelineEvent::PollError { .. } => d.poll_errors += 1,
            PipelineEvent::ItemEnded(_) | PipelineEvent::CaptureStarted(_) => changed = false,
        });
        changed
    }

    pub fn day(&self, date: NaiveDate) -> DayStats {
        self.lock().get(&date).cloned().unwrap_or_default()
    }

    pub fn today(&self) -> DayStats {
        self.day(Utc::now().date_naive())
    }

    pub async fn flush(&self) {
        let Some(path) = &self.path else { return };
        let _guard = self.write_lock.lock().await;
        let snapshot = self.lock().clone();
        if let Err(e) = write_json_atomic(path, &snapshot).await {
            tracing::warn!(path = %path.display(), error = %format!("{e:#}"), "writing stats failed");
        }
    }
}

#[async_trait::async_trait]
impl EventSink for DailyStats {
    fn name(&self) -> &'static str {
        "daily_stats"
    }

    async fn handle(&self, ev: &PipelineEvent) {
        if self.record(ev, Utc::now()) {
            self.flush().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::task::CaptureTask;
    use crate::capture::tests_support::item;
    use chrono::TimeZone;

    #[tokio::test]
    async fn counts_per_day_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.json");
        let stats = DailyStats::load(&path).await;
        let day1 = Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap();
        let day2 = Utc.with_ymd_and_hms(2025, 3, 2, 10, 0, 0).unwrap();

        stats.record(&PipelineEvent::ItemAppeared(item("b1", "a")), day1);
        let mut done = CaptureTask::new(item("b1", "a"), PathBuf::from("x"), 1, 3);
        done.bytes_written = 2048;
        stats.record(&PipelineEvent::CaptureCompleted(done), day1);
        assert!(!stats.record(&PipelineEvent::ItemEnded(item("b1", "a")), day1));
        stats.record_check(day2);
        stats.flush().await;

        let d1 = stats.day(day1.date_naive());
        assert_eq!(d1.broadcasts_detected, 1);
        assert_eq!(d1.captures_completed, 1);
        assert_eq!(d1.bytes, 2048);
        assert_eq!(stats.day(day2.date_naive()).checks, 1);

        let reloaded = DailyStats::load(&path).await;
        assert_eq!(reloaded.day(day1.date_naive()), d1);
    }

    #[test]
    fn old_days_are_dropped() {
        let stats = DailyStats::in_memory();
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        for i in 0..40 {
            stats.record_check(start + chrono::Duration::days(i));
        }
        assert_eq!(stats.lock().len(), RETAIN_DAYS);
        assert_eq!(stats.day(start.date_naive()).checks, 0);
    }
}
