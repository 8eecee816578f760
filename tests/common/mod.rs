// tests/common/mod.rs
//
// Shared fakes for the integration tests: a scripted platform, a capture tool
// whose transfers finish on demand, and a settable disk probe.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

use ephemeral_recorder::capture::preflight::{DiskProbe, OutputNaming};
use ephemeral_recorder::capture::transfer::{CaptureTool, TransferHandle};
use ephemeral_recorder::item::MediaCandidate;
use ephemeral_recorder::monitor::PollStrategy;
use ephemeral_recorder::platform::{FeedEntry, PlatformClient, RawItem, SessionGuard};
use ephemeral_recorder::{
    CaptureConfig, CaptureError, DedupLedger, EphemeralItem, ItemKind, MediaType, MonitorConfig,
    Pipeline, PipelineEvent, PipelineParts, PlatformError, Priority, Target, TargetRegistry,
};

// ---------------------------------------------------------------------------
// Platform
// ---------------------------------------------------------------------------

/// Active items per target id. The aggregate feed lists every target that
/// currently has items of the requested kind.
#[derive(Default)]
pub struct ScriptedPlatform {
    items: Mutex<HashMap<String, Vec<RawItem>>>,
    down: AtomicBool,
    pub detail_calls: AtomicUsize,
}

impl ScriptedPlatform {
    pub fn set_items(&self, target: &str, items: Vec<RawItem>) {
        self.items.lock().insert(target.to_string(), items);
    }

    pub fn clear(&self) {
        self.items.lock().clear();
    }

    /// Every request fails while down.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }
}

#[async_trait]
impl PlatformClient for ScriptedPlatform {
    async fn fetch_active_feed(&self, kind: ItemKind) -> Result<Vec<FeedEntry>, PlatformError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(PlatformError::Network("connection reset".into()));
        }
        Ok(self
            .items
            .lock()
            .iter()
            .filter(|(_, v)| v.iter().any(|r| r.kind == kind))
            .map(|(user, _)| FeedEntry {
                username: user.clone(),
                account_id: None,
                freshness: None,
            })
            .collect())
    }

    async fn fetch_item_detail(
        &self,
        target: &Target,
        kind: ItemKind,
    ) -> Result<Vec<RawItem>, PlatformError> {
        self.detail_calls.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            return Err(PlatformError::Api {
                status: 502,
                message: "bad gateway".into(),
            });
        }
        Ok(self
            .items
            .lock()
            .get(&target.id)
            .map(|v| v.iter().filter(|r| r.kind == kind).cloned().collect())
            .unwrap_or_default())
    }

    async fn resolve_identifier(&self, _username: &str) -> Result<u64, PlatformError> {
        Ok(42)
    }
}

pub fn broadcast(item_id: &str, user: &str) -> RawItem {
    RawItem {
        item_id: item_id.into(),
        account_username: user.into(),
        account_id: None,
        kind: ItemKind::Broadcast,
        media_type: MediaType::Video,
        started_at: Some(Utc::now().timestamp()),
        viewer_count: Some(12),
        title: String::new(),
        media: vec![MediaCandidate::new(format!(
            "https://scontent.cdninstagram.com/{item_id}.mpd"
        ))],
    }
}

pub fn item(item_id: &str, target: &str) -> EphemeralItem {
    EphemeralItem {
        item_id: item_id.into(),
        target_id: target.into(),
        display_name: target.into(),
        kind: ItemKind::Broadcast,
        media_type: MediaType::Video,
        started_at: Utc::now(),
        expires_at: None,
        viewer_count: None,
        title: String::new(),
        media: vec![MediaCandidate::new(format!(
            "https://scontent.cdninstagram.com/{item_id}.mpd"
        ))],
    }
}

// ---------------------------------------------------------------------------
// Capture tool
// ---------------------------------------------------------------------------

/// Transfers write a few bytes on start and finish once `release` is set.
pub struct HeldTool {
    pub release: Arc<AtomicBool>,
    pub started: Mutex<Vec<String>>,
}

impl HeldTool {
    pub fn new(released: bool) -> Self {
        Self {
            release: Arc::new(AtomicBool::new(released)),
            started: Mutex::new(Vec::new()),
        }
    }

    pub fn release(&self) {
        self.release.store(true, Ordering::SeqCst);
    }

    pub fn started(&self) -> Vec<String> {
        self.started.lock().clone()
    }
}

struct HeldHandle {
    release: Arc<AtomicBool>,
    stopped: bool,
}

#[async_trait]
impl TransferHandle for HeldHandle {
    async fn poll(&mut self) -> Option<Result<(), CaptureError>> {
        (!self.stopped && self.release.load(Ordering::SeqCst)).then_some(Ok(()))
    }

    async fn terminate(&mut self, _grace: Duration) {
        self.stopped = true;
    }
}

#[async_trait]
impl CaptureTool for HeldTool {
    fn name(&self) -> &'static str {
        "held"
    }

    fn is_available(&self, _kind: ItemKind) -> bool {
        true
    }

    async fn start(
        &self,
        item: &EphemeralItem,
        _url: &str,
        output: &Path,
    ) -> Result<Box<dyn TransferHandle>, CaptureError> {
        self.started.lock().push(item.item_id.clone());
        tokio::fs::write(output, b"fake media").await?;
        Ok(Box::new(HeldHandle {
            release: self.release.clone(),
            stopped: false,
        }))
    }
}

// ---------------------------------------------------------------------------
// Disk
// ---------------------------------------------------------------------------

pub struct FakeDisk(pub AtomicU64);

impl FakeDisk {
    pub fn with_free(bytes: u64) -> Self {
        Self(AtomicU64::new(bytes))
    }
}

impl DiskProbe for FakeDisk {
    fn free_bytes(&self, _path: &Path) -> std::io::Result<u64> {
        Ok(self.0.load(Ordering::SeqCst))
    }
}

// ---------------------------------------------------------------------------
// Pipeline harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub pipeline: Pipeline,
    pub platform: Arc<ScriptedPlatform>,
    pub tool: Arc<HeldTool>,
    pub events: UnboundedReceiver<PipelineEvent>,
    pub dir: tempfile::TempDir,
}

pub struct HarnessOpts {
    pub max_concurrent: usize,
    pub free_bytes: u64,
    pub released: bool,
    pub ledger: Option<Arc<DedupLedger>>,
}

impl Default for HarnessOpts {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            free_bytes: u64::MAX,
            released: true,
            ledger: None,
        }
    }
}

/// Registry `[A(high), B(normal), C(low)]`, broadcasts only.
pub fn harness(opts: HarnessOpts) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let platform = Arc::new(ScriptedPlatform::default());
    let tool = Arc::new(HeldTool::new(opts.released));
    let registry = Arc::new(TargetRegistry::new(vec![
        Target::new("a", Priority::High).with_account_id(1),
        Target::new("b", Priority::Normal).with_account_id(2),
        Target::new("c", Priority::Low).with_account_id(3),
    ]));
    let ledger = opts
        .ledger
        .unwrap_or_else(|| Arc::new(DedupLedger::in_memory(chrono::Duration::hours(24))));

    let parts = PipelineParts {
        client: platform.clone(),
        registry,
        guard: Arc::new(SessionGuard::new(Duration::from_secs(300), 3)),
        monitor: MonitorConfig {
            kinds: vec![ItemKind::Broadcast],
            strategy: PollStrategy::Aggregate,
            batch_delay: Duration::ZERO,
            ..MonitorConfig::default()
        },
        capture: CaptureConfig {
            max_concurrent: opts.max_concurrent,
            retry_delay: Duration::from_millis(20),
            liveness_interval: Duration::from_millis(5),
            queue_check_interval: Duration::from_millis(5),
            naming: OutputNaming {
                output_dir: dir.path().to_path_buf(),
                filename_format: "{target}_{item_id}".into(),
                broadcast_format: "mp4".into(),
            },
            ..CaptureConfig::default()
        },
        tool: tool.clone(),
        disk: Arc::new(FakeDisk::with_free(opts.free_bytes)),
        ledger,
        sinks: Vec::new(),
    };
    let pipeline = Pipeline::start(parts, &tokio_util::sync::CancellationToken::new());
    let events = pipeline.bus.subscribe();
    Harness {
        pipeline,
        platform,
        tool,
        events,
        dir,
    }
}

/// Next event matching `pred`, or panic after two seconds.
pub async fn next_matching(
    rx: &mut UnboundedReceiver<PipelineEvent>,
    mut pred: impl FnMut(&PipelineEvent) -> bool,
) -> PipelineEvent {
    let fut = async {
        loop {
            match rx.recv().await {
                Some(ev) if pred(&ev) => return ev,
                Some(_) => continue,
                None => panic!("event bus closed"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(2), fut)
        .await
        .expect("timed out waiting for event")
}

/// Everything that arrives within `window`.
pub async fn collect_for(
    rx: &mut UnboundedReceiver<PipelineEvent>,
    window: Duration,
) -> Vec<PipelineEvent> {
    let mut out = Vec::new();
    let deadline = tokio::time::Instant::now() + window;
    while let Ok(Some(ev)) = tokio::time::timeout_at(deadline, rx.recv()).await {
        out.push(ev);
    }
    out
}

pub fn is_capture_event(ev: &PipelineEvent) -> bool {
    matches!(
        ev,
        PipelineEvent::CaptureStarted(_)
            | PipelineEvent::CaptureCompleted(_)
            | PipelineEvent::CaptureRetry(_)
            | PipelineEvent::CaptureFailed(_)
    )
}
