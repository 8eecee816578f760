// src/config/mod.rs
//! Settings file (`config/settings.toml`, or `$RECORDER_CONFIG_PATH`).
//!
//! Every field has a default, so a missing file still gives a runnable setup.
//! `${VAR}` placeholders are substituted from the environment before parsing.

use anyhow::{anyhow, Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::capture::preflight::{OutputNaming, MIB};
use crate::capture::CaptureConfig;
use crate::item::{ItemKind, Quality};
use crate::monitor::{MonitorConfig, PollStrategy};
use crate::platform::http::HttpPlatformConfig;
use crate::target::ResolveThrottle;

pub const ENV_PATH: &str = "RECORDER_CONFIG_PATH";
pub const DEFAULT_PATH: &str = "config/settings.toml";

static ENV_PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid placeholder regex"));

/// Replace `${VAR}` with the variable's value; unset variables become empty.
pub fn substitute_env(raw: &str) -> String {
    ENV_PLACEHOLDER
        .replace_all(raw, |caps: &regex::Captures<'_>| {
            std::env::var(&caps[1]).unwrap_or_else(|_| {
                tracing::warn!(var = &caps[1], "config references unset environment variable");
                String::new()
            })
        })
        .into_owned()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformSettings {
    pub base_url: String,
    /// Usually `"${PLATFORM_SESSION}"`.
    pub session_cookie: String,
    pub user_agent: String,
    pub timeout_secs: u64,
    pub cooldown_secs: u64,
    pub max_failures: u32,
}

impl Default for PlatformSettings {
    fn default() -> Self {
        Self {
            base_url: "https://i.instagram.com/api/v1/".into(),
            session_cookie: String::new(),
            user_agent: String::new(),
            timeout_secs: 30,
            cooldown_secs: 300,
            max_failures: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub targets_file: PathBuf,
    pub check_interval_min_secs: u64,
    pub check_interval_max_secs: u64,
    /// `aggregate` or `per_target`.
    pub strategy: String,
    pub batch_size: usize,
    pub batch_delay_secs: u64,
    pub resolve_batch: usize,
    pub resolve_delay_secs: u64,
    pub poll_broadcasts: bool,
    pub poll_stories: bool,
    pub download_videos: bool,
    pub download_images: bool,
    pub story_expire_hours: i64,
    pub use_freshness_cache: bool,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            targets_file: PathBuf::from("config/targets.json"),
            check_interval_min_secs: 60,
            check_interval_max_secs: 120,
            strategy: "aggregate".into(),
            batch_size: 20,
            batch_delay_secs: 5,
            resolve_batch: 10,
            resolve_delay_secs: 2,
            poll_broadcasts: true,
            poll_stories: true,
            download_videos: true,
            download_images: true,
            story_expire_hours: 24,
            use_freshness_cache: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    pub output_dir: PathBuf,
    pub filename_format: String,
    pub broadcast_format: String,
    pub video_quality: String,
    pub image_quality: String,
    pub max_concurrent: usize,
    pub max_attempts: u32,
    pub retry_delay_secs: u64,
    pub liveness_interval_secs: u64,
    pub queue_check_interval_ms: u64,
    pub min_free_mb: u64,
    pub inflight_min_free_mb: u64,
    pub terminate_grace_secs: u64,
    pub shutdown_timeout_secs: u64,
    pub history_size: usize,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("downloads"),
            filename_format: "{target}_%Y%m%d_%H%M%S_{item_id}".into(),
            broadcast_format: "mp4".into(),
            video_quality: "highest".into(),
            image_quality: "highest".into(),
            max_concurrent: 3,
            max_attempts: 3,
            retry_delay_secs: 30,
            liveness_interval_secs: 5,
            queue_check_interval_ms: 1000,
            min_free_mb: 500,
            inflight_min_free_mb: 100,
            terminate_grace_secs: 10,
            shutdown_timeout_secs: 30,
            history_size: 1000,
            connect_timeout_secs: 10,
            read_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerSettings {
    pub path: PathBuf,
    pub horizon_hours: i64,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/downloads.json"),
            horizon_hours: crate::ledger::DEFAULT_HORIZON_HOURS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifySettings {
    #[serde(default)]
    pub discord_webhook_url: String,
    #[serde(default)]
    pub telegram_bot_token: String,
    #[serde(default)]
    pub telegram_chat_id: String,
    #[serde(default = "default_true")]
    pub on_detected: bool,
    #[serde(default = "default_true")]
    pub on_complete: bool,
    #[serde(default = "default_true")]
    pub on_failed: bool,
    #[serde(default)]
    pub on_retry: bool,
    #[serde(default)]
    pub on_error: bool,
    #[serde(default = "default_true")]
    pub lifecycle: bool,
}

impl Default for NotifySettings {
    fn default() -> Self {
        Self {
            discord_webhook_url: String::new(),
            telegram_bot_token: String::new(),
            telegram_chat_id: String::new(),
            on_detected: true,
            on_complete: true,
            on_failed: true,
            on_retry: false,
            on_error: false,
            lifecycle: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub enabled: bool,
    pub bind: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "0.0.0.0:8080".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsSettings {
    pub enabled: bool,
    pub path: PathBuf,
}

impl Default for StatsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from("data/stats.json"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub platform: PlatformSettings,
    pub monitor: MonitorSettings,
    pub capture: CaptureSettings,
    pub ledger: LedgerSettings,
    pub notify: NotifySettings,
    pub server: ServerSettings,
    pub stats: StatsSettings,
}

impl Settings {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading settings from {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let mut s: Settings = toml::from_str(&substitute_env(raw))?;
        s.normalize();
        Ok(s)
    }

    /// 1) `$RECORDER_CONFIG_PATH` (must exist)
    /// 2) `config/settings.toml`
    /// 3) built-in defaults
    pub fn load_default() -> Result<Self> {
        if let Ok(p) = std::env::var(ENV_PATH) {
            let pb = PathBuf::from(p);
            if !pb.exists() {
                return Err(anyhow!("{ENV_PATH} points to non-existent path"));
            }
            return Self::load_from_file(&pb);
        }
        let default = PathBuf::from(DEFAULT_PATH);
        if default.exists() {
            return Self::load_from_file(&default);
        }
        tracing::info!("no settings file found, using defaults");
        let mut s = Settings::default();
        s.normalize();
        Ok(s)
    }

    fn normalize(&mut self) {
        let m = &mut self.monitor;
        if m.check_interval_min_secs == 0 {
            m.check_interval_min_secs = 1;
        }
        if m.check_interval_max_secs < m.check_interval_min_secs {
            std::mem::swap(&mut m.check_interval_min_secs, &mut m.check_interval_max_secs);
        }
        m.batch_size = m.batch_size.max(1);
        let c = &mut self.capture;
        c.max_concurrent = c.max_concurrent.max(1);
        c.max_attempts = c.max_attempts.max(1);
        c.history_size = c.history_size.max(1);
        if c.inflight_min_free_mb > c.min_free_mb {
            c.inflight_min_free_mb = c.min_free_mb;
        }
        if self.ledger.horizon_hours <= 0 {
            self.ledger.horizon_hours = crate::ledger::DEFAULT_HORIZON_HOURS;
        }
    }

    pub fn check_interval(&self) -> (Duration, Duration) {
        (
            Duration::from_secs(self.monitor.check_interval_min_secs),
            Duration::from_secs(self.monitor.check_interval_max_secs),
        )
    }

    pub fn capture_config(&self) -> CaptureConfig {
        let c = &self.capture;
        CaptureConfig {
            max_concurrent: c.max_concurrent,
            max_attempts: c.max_attempts,
            retry_delay: Duration::from_secs(c.retry_delay_secs),
            liveness_interval: Duration::from_secs(c.liveness_interval_secs.max(1)),
            queue_check_interval: Duration::from_millis(c.queue_check_interval_ms.max(10)),
            min_free_bytes: c.min_free_mb * MIB,
            inflight_min_free_bytes: c.inflight_min_free_mb * MIB,
            terminate_grace: Duration::from_secs(c.terminate_grace_secs),
            history_capacity: c.history_size,
            video_quality: Quality::parse(&c.video_quality),
            image_quality: Quality::parse(&c.image_quality),
            naming: OutputNaming {
                output_dir: c.output_dir.clone(),
                filename_format: c.filename_format.clone(),
                broadcast_format: c.broadcast_format.clone(),
            },
        }
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        let m = &self.monitor;
        let mut kinds = Vec::new();
        if m.poll_broadcasts {
            kinds.push(ItemKind::Broadcast);
        }
        if m.poll_stories {
            kinds.push(ItemKind::Story);
        }
        MonitorConfig {
            kinds,
            strategy: PollStrategy::parse(&m.strategy),
            batch_size: m.batch_size,
            batch_delay: Duration::from_secs(m.batch_delay_secs),
            download_videos: m.download_videos,
            download_images: m.download_images,
            story_expire_hours: m.story_expire_hours,
            use_freshness_cache: m.use_freshness_cache,
        }
    }

    pub fn resolve_throttle(&self) -> ResolveThrottle {
        ResolveThrottle {
            batch: self.monitor.resolve_batch,
            delay: Duration::from_secs(self.monitor.resolve_delay_secs),
        }
    }

    pub fn platform_config(&self) -> HttpPlatformConfig {
        let p = &self.platform;
        HttpPlatformConfig {
            base_url: p.base_url.clone(),
            session_cookie: Some(p.session_cookie.clone()).filter(|s| !s.trim().is_empty()),
            user_agent: if p.user_agent.trim().is_empty() {
                crate::capture::transfer::DEFAULT_USER_AGENT.to_string()
            } else {
                p.user_agent.clone()
            },
            timeout: Duration::from_secs(p.timeout_secs.max(1)),
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.capture.shutdown_timeout_secs)
    }

    pub fn ledger_horizon(&self) -> chrono::Duration {
        chrono::Duration::hours(self.ledger.horizon_hours)
    }
}
