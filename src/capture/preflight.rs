// src/capture/preflight.rs
//! Checks performed before (and during) a capture: free disk space, media URL
//! sanity, and collision-free output naming.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::CaptureError;
use crate::item::EphemeralItem;

pub const MIB: u64 = 1024 * 1024;

/// Platform and CDN hosts media is expected to come from.
pub const ALLOWED_MEDIA_DOMAINS: &[&str] = &[
    "instagram.com",
    "cdninstagram.com",
    "fbcdn.net",
    "akamaized.net",
    "akamaihd.net",
];

const MAX_NAME_CHARS: usize = 50;
/// Cap on a rendered file stem, before the suffix and extension.
const MAX_STEM_CHARS: usize = 150;
/// Numbered suffixes tried before allocation gives up.
const MAX_NAME_SUFFIX: u32 = 10_000;

/// Source of free-space readings; swapped out in tests.
pub trait DiskProbe: Send + Sync {
    fn free_bytes(&self, path: &Path) -> io::Result<u64>;
}

/// Real filesystem probe. Walks up to the nearest existing ancestor when the
/// directory has not been created yet.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsDiskProbe;

impl DiskProbe for FsDiskProbe {
    fn free_bytes(&self, path: &Path) -> io::Result<u64> {
        let probe_at = nearest_existing_ancestor(path);
        fs2::available_space(&probe_at)
    }
}

pub fn nearest_existing_ancestor(path: &Path) -> PathBuf {
    let mut cur = path;
    loop {
        if cur.exists() {
            return cur.to_path_buf();
        }
        match cur.parent() {
            Some(p) if !p.as_os_str().is_empty() => cur = p,
            _ => return PathBuf::from("."),
        }
    }
}

/// `Ok(())` when at least `min_bytes` are free. A failing probe is logged and
/// treated as "enough": a broken probe must not block every capture.
pub fn ensure_free_space(
    probe: &dyn DiskProbe,
    path: &Path,
    min_bytes: u64,
) -> Result<(), CaptureError> {
    match probe.free_bytes(path) {
        Ok(free) if free < min_bytes => {
            tracing::warn!(
                target: "capture",
                free_mb = free / MIB,
                required_mb = min_bytes / MIB,
                "low disk space"
            );
            Err(CaptureError::DiskExhausted(format!(
                "{} MB free, {} MB required",
                free / MIB,
                min_bytes / MIB
            )))
        }
        Ok(_) => Ok(()),
        Err(e) => {
            tracing::warn!(target: "capture", path = %path.display(), error = %e, "disk space check failed");
            Ok(())
        }
    }
}

/// Defense-in-depth URL check: scheme, host allow-list, and no shell
/// metacharacters or control characters.
pub fn validate_media_url(raw: &str) -> Result<(), CaptureError> {
    if raw.trim().is_empty() {
        return Err(CaptureError::Validation("empty media URL".into()));
    }
    if let Some(c) = raw
        .chars()
        .find(|c| c.is_control() || matches!(c, ';' | '|' | '&' | '$' | '`'))
    {
        return Err(CaptureError::Validation(format!(
            "disallowed character {c:?} in media URL"
        )));
    }
    let parsed =
        url::Url::parse(raw).map_err(|e| CaptureError::Validation(format!("unparseable URL: {e}")))?;
    if !matches!(parsed.scheme(), "https" | "http") {
        return Err(CaptureError::Validation(format!(
            "unsupported scheme {}",
            parsed.scheme()
        )));
    }
    let host = parsed.host_str().unwrap_or_default().to_ascii_lowercase();
    let allowed = ALLOWED_MEDIA_DOMAINS
        .iter()
        .any(|d| host == *d || host.ends_with(&format!(".{d}")));
    if !allowed {
        return Err(CaptureError::Validation(format!("host {host} not allowed")));
    }
    Ok(())
}

/// Host part for logs; media URLs carry signed tokens.
pub fn url_host(raw: &str) -> String {
    url::Url::parse(raw)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| "<invalid>".to_string())
}

static UNSAFE_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[<>:"/\\|?*\x00-\x1f]"#).expect("valid sanitize regex"));

pub fn sanitize_filename(name: &str) -> String {
    let cleaned = UNSAFE_CHARS.replace_all(name, "").replace(' ', "_");
    let capped: String = cleaned.chars().take(MAX_NAME_CHARS).collect();
    if capped.is_empty() || capped.chars().all(|c| c == '.') {
        "unknown".to_string()
    } else {
        capped
    }
}

/// Output naming: `<dir>/<target>/<format>.<ext>` where `format` accepts
/// `{target}`, `{display_name}`, `{item_id}` and chrono `%` specifiers.
#[derive(Debug, Clone)]
pub struct OutputNaming {
    pub output_dir: PathBuf,
    pub filename_format: String,
    pub broadcast_format: String,
}

impl OutputNaming {
    pub fn file_name(&self, item: &EphemeralItem, at: DateTime<Utc>) -> String {
        let templ = self
            .filename_format
            .replace("{target}", &sanitize_filename(&item.target_id))
            .replace("{username}", &sanitize_filename(&item.target_id))
            .replace("{display_name}", &sanitize_filename(&item.display_name))
            .replace("{item_id}", &sanitize_filename(&item.item_id));
        let mut stamped = String::new();
        {
            use std::fmt::Write as _;
            // Invalid specifiers make chrono's formatter error; fall back to the raw template.
            if write!(stamped, "{}", at.format(&templ)).is_err() {
                stamped = templ;
            }
        }
        let stem = sanitize_stem(&stamped);
        format!("{stem}.{}", item.file_extension(&self.broadcast_format))
    }

    /// Create the target directory and return a path nothing exists at yet.
    pub fn allocate(&self, item: &EphemeralItem, at: DateTime<Utc>) -> io::Result<PathBuf> {
        self.allocate_excluding(item, at, |_| false)
    }

    /// Like [`allocate`](Self::allocate), also skipping paths `held` reports
    /// as claimed by a capture that may not have written anything yet.
    pub fn allocate_excluding(
        &self,
        item: &EphemeralItem,
        at: DateTime<Utc>,
        held: impl Fn(&Path) -> bool,
    ) -> io::Result<PathBuf> {
        let dir = self.output_dir.join(sanitize_filename(&item.target_id));
        std::fs::create_dir_all(&dir)?;
        let free = |p: &Path| !p.exists() && !held(p);
        let name = self.file_name(item, at);
        let first = dir.join(&name);
        if free(&first) {
            return Ok(first);
        }
        let (stem, ext) = match name.rsplit_once('.') {
            Some((s, e)) => (s.to_string(), e.to_string()),
            None => (name.clone(), String::new()),
        };
        for n in 1..MAX_NAME_SUFFIX {
            let candidate = if ext.is_empty() {
                dir.join(format!("{stem}_{n}"))
            } else {
                dir.join(format!("{stem}_{n}.{ext}"))
            };
            if free(&candidate) {
                return Ok(candidate);
            }
        }
        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("no free output name for {name}"),
        ))
    }
}

fn sanitize_stem(s: &str) -> String {
    let cleaned = UNSAFE_CHARS.replace_all(s, "").replace(' ', "_");
    let capped: String = cleaned.chars().take(MAX_STEM_CHARS).collect();
    if capped.is_empty() {
        "unknown".to_string()
    } else {
        capped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::tests_support::item;
    use chrono::TimeZone;

    struct Fixed(io::Result<u64>);
    impl DiskProbe for Fixed {
        fn free_bytes(&self, _: &Path) -> io::Result<u64> {
            match &self.0 {
                Ok(v) => Ok(*v),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            }
        }
    }

    #[test]
    fn disk_floor_enforced_and_probe_errors_tolerated() {
        let p = Path::new("/nope");
        assert!(ensure_free_space(&Fixed(Ok(600 * MIB)), p, 500 * MIB).is_ok());
        assert!(matches!(
            ensure_free_space(&Fixed(Ok(10 * MIB)), p, 500 * MIB),
            Err(CaptureError::DiskExhausted(_))
        ));
        let broken = Fixed(Err(io::Error::other("statvfs")));
        assert!(ensure_free_space(&broken, p, 500 * MIB).is_ok());
    }

    #[test]
    fn ancestor_walk_finds_existing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let deep = dir.path().join("a").join("b").join("c");
        assert_eq!(nearest_existing_ancestor(&deep), dir.path());
    }

    #[test]
    fn url_validation() {
        assert!(validate_media_url("https://scontent.cdninstagram.com/v/x.mp4?sig=1").is_ok());
        assert!(validate_media_url("https://instagram.com/live.mpd").is_ok());
        assert!(validate_media_url("https://evil.example.com/x").is_err());
        assert!(validate_media_url("https://notfbcdn.net/x").is_err());
        assert!(validate_media_url("ftp://fbcdn.net/x").is_err());
        assert!(validate_media_url("https://fbcdn.net/x;rm -rf").is_err());
        assert!(validate_media_url("https://fbcdn.net/x\n").is_err());
        assert!(validate_media_url("").is_err());
    }

    #[test]
    fn sanitize_strips_and_caps() {
        assert_eq!(sanitize_filename("a<b>c:d e"), "abcd_e");
        assert_eq!(sanitize_filename("../"), "unknown");
        assert_eq!(sanitize_filename(""), "unknown");
        assert_eq!(sanitize_filename(&"x".repeat(80)).len(), 50);
    }

    #[test]
    fn allocate_never_collides() {
        let dir = tempfile::tempdir().unwrap();
        let naming = OutputNaming {
            output_dir: dir.path().to_path_buf(),
            filename_format: "{target}_%Y%m%d_%H%M%S".into(),
            broadcast_format: "mp4".into(),
        };
        let it = item("b1", "alice");
        let at = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();
        let p1 = naming.allocate(&it, at).unwrap();
        assert!(p1.ends_with("alice/alice_20250102_030405.mp4"));
        std::fs::write(&p1, b"x").unwrap();
        let p2 = naming.allocate(&it, at).unwrap();
        assert!(p2.ends_with("alice/alice_20250102_030405_1.mp4"));

        // Claimed but still empty on disk counts as taken.
        let p3 = naming.allocate_excluding(&it, at, |p| p == p2.as_path()).unwrap();
        assert!(p3.ends_with("alice/alice_20250102_030405_2.mp4"));
    }

    #[test]
    fn stem_is_capped_before_extension() {
        let naming = OutputNaming {
            output_dir: PathBuf::from("out"),
            filename_format: "x".repeat(400),
            broadcast_format: "mp4".into(),
        };
        let name = naming.file_name(&item("b1", "alice"), Utc::now());
        assert_eq!(name.chars().count(), MAX_STEM_CHARS + ".mp4".len());
        assert!(name.ends_with(".mp4"));
    }

    #[test]
    fn default_template_separates_same_second_items() {
        let naming = OutputNaming {
            output_dir: PathBuf::from("out"),
            ..crate::capture::CaptureConfig::default().naming
        };
        let at = Utc.with_ymd_and_hms(2026, 10, 16, 9, 31, 19).unwrap();
        let a = naming.file_name(&item("S1", "alice"), at);
        let b = naming.file_name(&item("S2", "alice"), at);
        assert_ne!(a, b);
        assert_eq!(a, "alice_20261016_093119_S1.mp4");
    }
}
