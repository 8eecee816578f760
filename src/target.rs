//! # Target Registry
//! Ordered roster of watched accounts and the lazy id resolver.
//!
//! Targets come from a JSON file (`{"targets": [...]}` or a bare array) whose
//! entries are either a username string or an object
//! `{username, user_id?, alias?, priority?, enabled?, notes?}`.
//! The resolver fills in missing `user_id`s once per process and writes them
//! back so a restart does not look them up again.

use anyhow::{anyhow, Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

use crate::persist::write_json_atomic;
use crate::platform::PlatformClient;

static USERNAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9._]{1,30}$").expect("valid username regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    /// Unknown values fall back to `Normal`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Priority::High,
            "low" => Priority::Low,
            _ => Priority::Normal,
        }
    }

    fn rank(self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Platform username; stable registry identifier.
    pub id: String,
    pub external_account_id: Option<u64>,
    pub display_name: String,
    pub priority: Priority,
    pub enabled: bool,
}

impl Target {
    pub fn new(id: impl Into<String>, priority: Priority) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
            external_account_id: None,
            priority,
            enabled: true,
        }
    }

    pub fn with_account_id(mut self, account_id: u64) -> Self {
        self.external_account_id = Some(account_id);
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.display_name = alias.into();
        self
    }

    pub fn is_resolved(&self) -> bool {
        self.external_account_id.is_some()
    }

    pub fn matches_username(&self, username: &str) -> bool {
        self.id.eq_ignore_ascii_case(username)
    }
}

/// Stable sort high → normal → low; config order kept within a tier.
pub fn sort_by_priority(targets: &mut [Target]) {
    targets.sort_by_key(|t| t.priority.rank());
}

#[derive(Debug, Deserialize)]
struct TargetEntry {
    #[serde(default)]
    username: String,
    #[serde(default)]
    user_id: Option<u64>,
    #[serde(default)]
    alias: Option<String>,
    #[serde(default)]
    priority: Option<String>,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Parse a targets document. Invalid entries are skipped with a warning;
/// disabled entries are kept but flagged.
pub fn parse_targets(raw: &str) -> Result<Vec<Target>> {
    let doc: serde_json::Value = serde_json::from_str(raw).context("targets file is not JSON")?;
    let list = match &doc {
        serde_json::Value::Array(a) => a.clone(),
        serde_json::Value::Object(o) => o
            .get("targets")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default(),
        _ => return Err(anyhow!("targets file must be an object or array")),
    };

    let mut out: Vec<Target> = Vec::with_capacity(list.len());
    for (i, item) in list.into_iter().enumerate() {
        let entry = match item {
            serde_json::Value::String(s) => TargetEntry {
                username: s,
                user_id: None,
                alias: None,
                priority: None,
                enabled: true,
            },
            v @ serde_json::Value::Object(_) => match serde_json::from_value::<TargetEntry>(v) {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!(entry = i + 1, error = %e, "skipping malformed target");
                    continue;
                }
            },
            _ => continue,
        };
        let username = entry.username.trim();
        if username.is_empty() {
            continue;
        }
        if !USERNAME_RE.is_match(username) {
            tracing::warn!(entry = i + 1, username, "skipping invalid username");
            continue;
        }
        if out.iter().any(|t| t.matches_username(username)) {
            continue;
        }
        let alias = entry.alias.filter(|a| !a.trim().is_empty());
        out.push(Target {
            id: username.to_string(),
            external_account_id: entry.user_id,
            display_name: alias.unwrap_or_else(|| username.to_string()),
            priority: entry
                .priority
                .as_deref()
                .map(Priority::parse)
                .unwrap_or(Priority::Normal),
            enabled: entry.enabled,
        });
    }
    Ok(out)
}

pub async fn load_targets(path: &Path) -> Result<Vec<Target>> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading targets from {}", path.display()))?;
    parse_targets(&raw)
}

/// Write resolved ids back. Only `user_id` fields change in an existing file.
pub async fn save_targets(targets: &[Target], path: &Path) -> Result<()> {
    let mut doc = match tokio::fs::read_to_string(path).await {
        Ok(s) => serde_json::from_str::<serde_json::Value>(&s)
            .with_context(|| format!("parsing {}", path.display()))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => serde_json::json!({ "targets": [] }),
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };

    // Bare arrays are promoted to the object form on first save.
    if doc.is_array() {
        doc = serde_json::json!({ "targets": doc });
    }
    let Some(obj) = doc.as_object_mut() else {
        return Err(anyhow!("targets file must be an object or array"));
    };

    let entries = obj
        .entry("targets")
        .or_insert_with(|| serde_json::Value::Array(Vec::new()));
    if let Some(list) = entries.as_array_mut() {
        for item in list.iter_mut() {
            if let serde_json::Value::String(name) = item {
                *item = serde_json::json!({ "username": name.clone() });
            }
            let Some(entry) = item.as_object_mut() else {
                continue;
            };
            let Some(name) = entry.get("username").and_then(|v| v.as_str()) else {
                continue;
            };
            if let Some(t) = targets.iter().find(|t| t.matches_username(name)) {
                if let Some(id) = t.external_account_id {
                    entry.insert("user_id".into(), serde_json::json!(id));
                }
            }
        }
        if list.is_empty() {
            for t in targets {
                list.push(serde_json::json!({
                    "username": t.id,
                    "user_id": t.external_account_id,
                    "alias": t.display_name,
                    "priority": t.priority,
                    "enabled": t.enabled,
                }));
            }
        }
    }
    obj.insert(
        "last_updated".into(),
        serde_json::json!(chrono::Utc::now().to_rfc3339()),
    );
    write_json_atomic(path, &doc).await
}

/// Throttle for id lookups: pause `delay` after every `batch` lookups.
#[derive(Debug, Clone, Copy)]
pub struct ResolveThrottle {
    pub batch: usize,
    pub delay: Duration,
}

impl Default for ResolveThrottle {
    fn default() -> Self {
        Self {
            batch: 10,
            delay: Duration::from_secs(2),
        }
    }
}

/// Shared, ordered target list.
#[derive(Debug)]
pub struct TargetRegistry {
    targets: RwLock<Vec<Target>>,
    path: Option<PathBuf>,
}

impl TargetRegistry {
    pub fn new(targets: Vec<Target>) -> Self {
        Self {
            targets: RwLock::new(targets),
            path: None,
        }
    }

    pub fn with_path(targets: Vec<Target>, path: impl Into<PathBuf>) -> Self {
        Self {
            targets: RwLock::new(targets),
            path: Some(path.into()),
        }
    }

    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let targets = load_targets(&path).await?;
        Ok(Self::with_path(targets, path))
    }

    pub fn snapshot(&self) -> Vec<Target> {
        self.targets
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Enabled targets in priority order.
    pub fn enabled_by_priority(&self) -> Vec<Target> {
        let mut v: Vec<Target> = self.snapshot().into_iter().filter(|t| t.enabled).collect();
        sort_by_priority(&mut v);
        v
    }

    pub fn len(&self) -> usize {
        self.targets.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up missing account ids one at a time. A failed lookup leaves the
    /// target unresolved until the next process start. Returns the number of
    /// newly resolved targets.
    pub async fn resolve_missing(
        &self,
        client: &dyn PlatformClient,
        throttle: ResolveThrottle,
    ) -> usize {
        let mut targets = self.snapshot();
        let (resolved, _) = resolve(client, &mut targets, throttle).await;
        if resolved == 0 {
            return 0;
        }
        {
            let mut guard = self.targets.write().unwrap_or_else(|p| p.into_inner());
            for t in guard.iter_mut() {
                if t.external_account_id.is_none() {
                    if let Some(r) = targets.iter().find(|r| r.id == t.id) {
                        t.external_account_id = r.external_account_id;
                    }
                }
            }
        }
        if let Some(path) = &self.path {
            let snapshot = self.snapshot();
            if let Err(e) = save_targets(&snapshot, path).await {
                tracing::warn!(error = %format!("{e:#}"), "saving resolved targets failed");
            }
        }
        resolved
    }
}

/// Resolve in place. Returns `(resolved_count, targets_with_id)`.
pub async fn resolve(
    client: &dyn PlatformClient,
    targets: &mut [Target],
    throttle: ResolveThrottle,
) -> (usize, usize) {
    let pending: Vec<usize> = targets
        .iter()
        .enumerate()
        .filter(|(_, t)| t.external_account_id.is_none())
        .map(|(i, _)| i)
        .collect();

    if !pending.is_empty() {
        tracing::info!(count = pending.len(), "resolving account ids");
    }

    let mut resolved = 0usize;
    for (n, idx) in pending.iter().enumerate() {
        let target = &mut targets[*idx];
        match client.resolve_identifier(&target.id).await {
            Ok(id) => {
                target.external_account_id = Some(id);
                resolved += 1;
                tracing::debug!(target_id = %target.id, account_id = id, "resolved");
            }
            Err(e) => {
                tracing::warn!(target_id = %target.id, error = %e, "account id lookup failed");
            }
        }
        let done = n + 1;
        if throttle.batch > 0 && done % throttle.batch == 0 && done < pending.len() {
            tokio::time::sleep(throttle.delay).await;
        }
    }

    if !pending.is_empty() {
        tracing::info!(resolved, requested = pending.len(), "account id resolution finished");
    }
    let with_id = targets.iter().filter(|t| t.is_resolved()).count();
    (resolved, with_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mixed_entries_and_skips_invalid() {
        let raw = r#"{"targets": [
            "plain_user",
            {"username": "alice", "user_id": 42, "alias": "Alice A", "priority": "high"},
            {"username": "bad name!"},
            {"username": "zed", "priority": "urgent", "enabled": false},
            {"username": "ALICE"},
            42
        ]}"#;
        let t = parse_targets(raw).unwrap();
        assert_eq!(t.len(), 3);
        assert_eq!(t[0].id, "plain_user");
        assert_eq!(t[0].priority, Priority::Normal);
        assert_eq!(t[1].display_name, "Alice A");
        assert_eq!(t[1].external_account_id, Some(42));
        assert_eq!(t[2].priority, Priority::Normal);
        assert!(!t[2].enabled);
    }

    #[test]
    fn priority_sort_is_stable() {
        let mut v = vec![
            Target::new("c", Priority::Low),
            Target::new("b1", Priority::Normal),
            Target::new("a", Priority::High),
            Target::new("b2", Priority::Normal),
        ];
        sort_by_priority(&mut v);
        let ids: Vec<&str> = v.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b1", "b2", "c"]);
    }

    #[tokio::test]
    async fn save_updates_only_user_ids() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("targets.json");
        std::fs::write(
            &p,
            r#"{"targets": [{"username": "alice", "notes": "keep me"}, "bob"]}"#,
        )
        .unwrap();
        let targets = vec![
            Target::new("alice", Priority::High).with_account_id(7),
            Target::new("bob", Priority::Normal),
        ];
        save_targets(&targets, &p).await.unwrap();

        let v: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&p).unwrap()).unwrap();
        assert_eq!(v["targets"][0]["user_id"], 7);
        assert_eq!(v["targets"][0]["notes"], "keep me");
        assert_eq!(v["targets"][1]["username"], "bob");
        assert!(v["targets"][1].get("user_id").is_none());
        assert!(v.get("last_updated").is_some());

        let reparsed = parse_targets(&std::fs::read_to_string(&p).unwrap()).unwrap();
        assert_eq!(reparsed[0].external_account_id, Some(7));
    }

    use crate::error::PlatformError;
    use crate::item::ItemKind;
    use crate::platform::{FeedEntry, RawItem};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use tokio::time::Instant;

    /// Answers id lookups from a table; unknown names fail. Records when each
    /// lookup happened.
    struct Lookups {
        ids: HashMap<&'static str, u64>,
        calls: Mutex<Vec<(String, Instant)>>,
    }

    impl Lookups {
        fn new(ids: &[(&'static str, u64)]) -> Self {
            Self {
                ids: ids.iter().copied().collect(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn called(&self) -> Vec<String> {
            self.calls.lock().iter().map(|(n, _)| n.clone()).collect()
        }
    }

    #[async_trait]
    impl PlatformClient for Lookups {
        async fn fetch_active_feed(&self, _: ItemKind) -> Result<Vec<FeedEntry>, PlatformError> {
            Ok(Vec::new())
        }

        async fn fetch_item_detail(
            &self,
            _: &Target,
            _: ItemKind,
        ) -> Result<Vec<RawItem>, PlatformError> {
            Ok(Vec::new())
        }

        async fn resolve_identifier(&self, username: &str) -> Result<u64, PlatformError> {
            self.calls.lock().push((username.to_string(), Instant::now()));
            self.ids
                .get(username)
                .copied()
                .ok_or_else(|| PlatformError::Network("user lookup failed".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn resolve_pauses_between_batches_and_skips_known_ids() {
        let client = Lookups::new(&[("b", 2), ("d", 4), ("e", 5), ("f", 6)]);
        let mut targets = vec![
            Target::new("a", Priority::High).with_account_id(1),
            Target::new("b", Priority::Normal),
            Target::new("c", Priority::Normal),
            Target::new("d", Priority::Normal),
            Target::new("e", Priority::Low),
            Target::new("f", Priority::Low),
        ];
        let throttle = ResolveThrottle {
            batch: 2,
            delay: Duration::from_secs(10),
        };
        let start = Instant::now();
        let (resolved, with_id) = resolve(&client, &mut targets, throttle).await;

        assert_eq!((resolved, with_id), (4, 5));
        // "a" already had an id; "c" failed once and is not retried.
        assert_eq!(client.called(), vec!["b", "c", "d", "e", "f"]);
        assert_eq!(targets[2].external_account_id, None);
        assert_eq!(targets[5].external_account_id, Some(6));

        let offsets: Vec<u64> = client
            .calls
            .lock()
            .iter()
            .map(|(_, at)| at.duration_since(start).as_secs())
            .collect();
        assert_eq!(offsets, vec![0, 0, 10, 10, 20]);
        // No pause after the last batch.
        assert_eq!(start.elapsed(), Duration::from_secs(20));
    }

    #[tokio::test]
    async fn registry_saves_only_after_a_successful_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("targets.json");
        let original = r#"{"targets": ["alice", {"username": "bob", "user_id": 9}]}"#;
        std::fs::write(&p, original).unwrap();
        let registry = TargetRegistry::load(&p).await.unwrap();
        let throttle = ResolveThrottle {
            batch: 10,
            delay: Duration::ZERO,
        };

        let failing = Lookups::new(&[]);
        assert_eq!(registry.resolve_missing(&failing, throttle).await, 0);
        assert_eq!(failing.called(), vec!["alice"]);
        assert_eq!(std::fs::read_to_string(&p).unwrap(), original);

        let working = Lookups::new(&[("alice", 77)]);
        assert_eq!(registry.resolve_missing(&working, throttle).await, 1);
        assert_eq!(working.called(), vec!["alice"]);
        assert_eq!(registry.snapshot()[0].external_account_id, Some(77));
        let v: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&p).unwrap()).unwrap();
        assert_eq!(v["targets"][0]["user_id"], 77);
        assert_eq!(v["targets"][1]["user_id"], 9);

        // Everyone resolved now: nothing to look up.
        let idle = Lookups::new(&[]);
        assert_eq!(registry.resolve_missing(&idle, throttle).await, 0);
        assert!(idle.called().is_empty());
    }
}
