// src/monitor/freshness.rs
//! Per-target freshness markers from the aggregate feed.
//!
//! Best-effort only: a marker equal to the cached one lets the poller reuse
//! the target's previous items instead of fetching detail. Nothing here is
//! trusted for correctness; the per-target path stays authoritative.

use std::collections::HashMap;

use crate::item::ItemKind;

#[derive(Debug, Default)]
pub struct FreshnessCache {
    markers: HashMap<(String, ItemKind), i64>,
}

impl FreshnessCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(target_id: &str, kind: ItemKind) -> (String, ItemKind) {
        (target_id.to_ascii_lowercase(), kind)
    }

    /// True only when both markers are known and equal.
    pub fn is_unchanged(&self, target_id: &str, kind: ItemKind, marker: Option<i64>) -> bool {
        match marker {
            Some(m) => self.markers.get(&Self::key(target_id, kind)) == Some(&m),
            None => false,
        }
    }

    pub fn record(&mut self, target_id: &str, kind: ItemKind, marker: Option<i64>) {
        match marker {
            Some(m) => {
                self.markers.insert(Self::key(target_id, kind), m);
            }
            None => self.forget(target_id, kind),
        }
    }

    pub fn forget(&mut self, target_id: &str, kind: ItemKind) {
        self.markers.remove(&Self::key(target_id, kind));
    }

    /// Drop markers of targets absent from the feed this tick.
    pub fn retain_targets(&mut self, kind: ItemKind, present: &[String]) {
        self.markers.retain(|(t, k), _| {
            *k != kind || present.iter().any(|p| p.eq_ignore_ascii_case(t))
        });
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }
}
