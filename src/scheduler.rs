// src/scheduler.rs
//! Wires the poller, the capture pool and the sinks into one pipeline.
//!
//! ```text
//! poll loop -> EventBus -> router (ledger check, admit) -> CaptureManager
//!                      \-> sinks (notify, daily stats)
//! ```

use metrics::{counter, gauge};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::capture::preflight::DiskProbe;
use crate::capture::transfer::CaptureTool;
use crate::capture::{Admission, CaptureConfig, CaptureManager};
use crate::events::{EventBus, PipelineEvent};
use crate::ledger::DedupLedger;
use crate::monitor::{MonitorConfig, Poller, TickOutcome};
use crate::platform::{PlatformClient, SessionGuard};
use crate::sinks::{spawn_sink, EventSink};
use crate::stats::DailyStats;
use crate::target::TargetRegistry;

/// Random duration in `[min, max]`.
pub fn jittered(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let ms = rand::rng().random_range(min.as_millis() as u64..=max.as_millis() as u64);
    Duration::from_millis(ms)
}

/// Everything needed to build a [`Pipeline`].
pub struct PipelineParts {
    pub client: Arc<dyn PlatformClient>,
    pub registry: Arc<TargetRegistry>,
    pub guard: Arc<SessionGuard>,
    pub monitor: MonitorConfig,
    pub capture: CaptureConfig,
    pub tool: Arc<dyn CaptureTool>,
    pub disk: Arc<dyn DiskProbe>,
    pub ledger: Arc<DedupLedger>,
    pub sinks: Vec<Arc<dyn EventSink>>,
}

pub struct Pipeline {
    pub bus: Arc<EventBus>,
    pub poller: Arc<Poller>,
    pub captures: CaptureManager,
    pub ledger: Arc<DedupLedger>,
    loop_cancel: CancellationToken,
    sink_cancel: CancellationToken,
    router: JoinHandle<()>,
    sinks: Vec<JoinHandle<()>>,
    poll_loop: Option<JoinHandle<()>>,
}

impl Pipeline {
    /// Start the capture pool, the router and the sinks. Polling starts with
    /// [`Pipeline::spawn_poll_loop`] (or manual [`Poller::tick`] calls).
    pub fn start(parts: PipelineParts, shutdown: &CancellationToken) -> Self {
        let bus = Arc::new(EventBus::new());
        // Sinks subscribe first so they see everything.
        let sink_cancel = CancellationToken::new();
        let sinks = parts
            .sinks
            .into_iter()
            .map(|s| spawn_sink(&bus, s, sink_cancel.clone()))
            .collect();

        let captures = CaptureManager::start(
            parts.capture,
            parts.tool,
            parts.disk,
            parts.ledger.clone(),
            bus.clone(),
            shutdown,
        );
        let poller = Arc::new(Poller::new(
            parts.monitor,
            parts.client,
            parts.registry,
            parts.guard,
            bus.clone(),
        ));
        let loop_cancel = shutdown.child_token();
        let router = spawn_router(&bus, captures.clone(), loop_cancel.clone());

        Self {
            bus,
            poller,
            captures,
            ledger: parts.ledger,
            loop_cancel,
            sink_cancel,
            router,
            sinks,
            poll_loop: None,
        }
    }

    pub fn spawn_poll_loop(&mut self, interval: (Duration, Duration), daily: Option<Arc<DailyStats>>) {
        let poller = self.poller.clone();
        let ledger = self.ledger.clone();
        let cancel = self.loop_cancel.clone();
        self.poll_loop = Some(tokio::spawn(run_poll_loop(
            poller, ledger, daily, interval, cancel,
        )));
    }

    /// Stop polling, drain the capture pool (bounded by `timeout`), then let
    /// the sinks deliver what is left.
    pub async fn shutdown(self, timeout: Duration) {
        self.loop_cancel.cancel();
        if let Some(h) = self.poll_loop {
            let _ = h.await;
        }
        let _ = self.router.await;
        self.captures.shutdown(timeout).await;
        self.sink_cancel.cancel();
        for h in self.sinks {
            let _ = h.await;
        }
    }
}

/// `ItemAppeared` -> ledger check -> admit.
pub fn spawn_router(bus: &EventBus, captures: CaptureManager, cancel: CancellationToken) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            let ev = tokio::select! {
                _ = cancel.cancelled() => break,
                ev = rx.recv() => match ev {
                    Some(ev) => ev,
                    None => break,
                },
            };
            let PipelineEvent::ItemAppeared(item) = ev else { continue };
            if captures.ledger().is_recorded(&item.item_id) {
                tracing::debug!(target: "capture", item_id = %item.item_id, "already captured, skipping");
                continue;
            }
            let item_id = item.item_id.clone();
            match captures.admit(item).await {
                Admission::Started(_) | Admission::AlreadyActive(_) => {}
                Admission::Queued { position } => {
                    tracing::debug!(target: "capture", item_id = %item_id, position, "queued");
                }
                Admission::Rejected(e) => {
                    counter!("capture_rejected_total").increment(1);
                    tracing::warn!(target: "capture", item_id = %item_id, error = %e, "capture not admitted");
                }
            }
        }
        tracing::debug!(target: "capture", "router stopped");
    })
}

/// Tick, purge the ledger, sleep a jittered interval; until cancelled.
pub async fn run_poll_loop(
    poller: Arc<Poller>,
    ledger: Arc<DedupLedger>,
    daily: Option<Arc<DailyStats>>,
    interval: (Duration, Duration),
    cancel: CancellationToken,
) {
    tracing::info!(
        target: "monitor",
        min_secs = interval.0.as_secs(),
        max_secs = interval.1.as_secs(),
        "poll loop started"
    );
    loop {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => break,
            out = poller.tick() => out,
        };
        if !matches!(outcome, TickOutcome::Skipped) {
            if let Some(d) = &daily {
                d.record_check(chrono::Utc::now());
            }
        }
        let purged = ledger.cleanup().await;
        if purged > 0 {
            tracing::debug!(target: "ledger", purged, "expired ledger entries removed");
        }
        gauge!("ledger_entries").set(ledger.len() as f64);

        let wait = jittered(interval.0, interval.1);
        tracing::debug!(target: "monitor", ?outcome, next_in_secs = wait.as_secs(), "tick done");
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
    }
    tracing::info!(target: "monitor", "poll loop stopped");
}
