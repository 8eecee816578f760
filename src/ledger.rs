//! # Dedup Ledger
//! TTL-bounded set of item ids that were already captured, persisted so a
//! restart does not capture recently finished items again.
//!
//! On disk: `{"downloads": {"<item_id>": "<RFC 3339>"}, "last_updated": ..}`.
//! Malformed or expired entries are dropped silently on load.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::persist::write_json_atomic;

pub const DEFAULT_HORIZON_HOURS: i64 = 24;

#[derive(Debug, Serialize, Deserialize, Default)]
struct LedgerFile {
    #[serde(default)]
    downloads: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_updated: Option<String>,
}

#[derive(Debug)]
pub struct DedupLedger {
    path: Option<PathBuf>,
    horizon: ChronoDuration,
    entries: Mutex<HashMap<String, DateTime<Utc>>>,
    // Serializes snapshot+write so an older snapshot never lands last.
    write_lock: tokio::sync::Mutex<()>,
}

impl DedupLedger {
    /// Ledger without a backing file.
    pub fn in_memory(horizon: ChronoDuration) -> Self {
        Self {
            path: None,
            horizon,
            entries: Mutex::new(HashMap::new()),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Load from `path` (missing file = empty ledger).
    pub async fn load(path: impl AsRef<Path>, horizon: ChronoDuration) -> Self {
        let path = path.as_ref().to_path_buf();
        let entries = match tokio::fs::read_to_string(&path).await {
            Ok(s) => parse_entries(&s, Utc::now(), horizon),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                tracing::warn!(target: "ledger", path = %path.display(), error = %e, "ledger load failed");
                HashMap::new()
            }
        };
        tracing::debug!(target: "ledger", entries = entries.len(), "ledger loaded");
        Self {
            path: Some(path),
            horizon,
            entries: Mutex::new(entries),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn horizon(&self) -> ChronoDuration {
        self.horizon
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_recorded(&self, item_id: &str) -> bool {
        self.is_recorded_at(item_id, Utc::now())
    }

    /// Expired entries count as absent and are evicted inline.
    pub fn is_recorded_at(&self, item_id: &str, now: DateTime<Utc>) -> bool {
        let mut map = self.lock();
        match map.get(item_id) {
            None => false,
            Some(ts) if now.signed_duration_since(*ts) > self.horizon => {
                map.remove(item_id);
                false
            }
            Some(_) => true,
        }
    }

    pub async fn mark_recorded(&self, item_id: &str) {
        self.mark_recorded_at(item_id, Utc::now()).await
    }

    pub async fn mark_recorded_at(&self, item_id: &str, now: DateTime<Utc>) {
        self.lock().insert(item_id.to_string(), now);
        self.persist().await;
    }

    /// Purge expired entries; returns how many were removed.
    pub async fn cleanup(&self) -> usize {
        self.cleanup_at(Utc::now()).await
    }

    pub async fn cleanup_at(&self, now: DateTime<Utc>) -> usize {
        let removed = {
            let mut map = self.lock();
            let before = map.len();
            let horizon = self.horizon;
            map.retain(|_, ts| now.signed_duration_since(*ts) <= horizon);
            before - map.len()
        };
        if removed > 0 {
            tracing::debug!(target: "ledger", removed, "expired ledger entries purged");
            self.persist().await;
        }
        removed
    }

    async fn persist(&self) {
        let Some(path) = &self.path else {
            return;
        };
        let _guard = self.write_lock.lock().await;
        let file = {
            let map = self.lock();
            LedgerFile {
                downloads: map
                    .iter()
                    .map(|(k, v)| (k.clone(), serde_json::Value::String(v.to_rfc3339())))
                    .collect(),
                last_updated: Some(Utc::now().to_rfc3339()),
            }
        };
        if let Err(e) = write_json_atomic(path, &file).await {
            tracing::warn!(target: "ledger", error = %format!("{e:#}"), "ledger save failed");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, DateTime<Utc>>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn parse_entries(
    raw: &str,
    now: DateTime<Utc>,
    horizon: ChronoDuration,
) -> HashMap<String, DateTime<Utc>> {
    let file: LedgerFile = match serde_json::from_str(raw) {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!(target: "ledger", error = %e, "ledger file unreadable, starting empty");
            return HashMap::new();
        }
    };
    file.downloads
        .into_iter()
        .filter_map(|(id, v)| {
            let ts = v
                .as_str()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())?
                .with_timezone(&Utc);
            (now.signed_duration_since(ts) <= horizon).then_some((id, ts))
        })
        .collect()
}
