// src/capture/mod.rs
//! Bounded capture pool.
//!
//! [`CaptureManager::admit`] maps an item onto a worker slot, a FIFO backlog
//! entry, or a rejection. All mutable state lives in one mutex-guarded
//! [`State`]; the lock only ever covers map mutation. Preflight, path
//! allocation and every transfer run outside it.
//!
//! A single dispatcher task owns the backlog drain (fixed interval) and the
//! delayed retry queue, so a retry waiting out its backoff never holds a slot.

pub mod preflight;
pub mod task;
pub mod transfer;
mod worker;

use chrono::Utc;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tokio_util::time::DelayQueue;

use crate::error::CaptureError;
use crate::events::{EventBus, PipelineEvent};
use crate::item::{EphemeralItem, Quality};
use crate::ledger::DedupLedger;
use preflight::{ensure_free_space, DiskProbe, OutputNaming, MIB};
use task::{CaptureHistory, CaptureStats, CaptureTask, TaskStatus};
use transfer::CaptureTool;

const MAX_CLAIM_ROUNDS: usize = 8;

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Ceiling on simultaneous transfers.
    pub max_concurrent: usize,
    pub max_attempts: u32,
    pub retry_delay: Duration,
    /// How often a worker checks on its transfer.
    pub liveness_interval: Duration,
    /// How often the dispatcher tries to drain the backlog.
    pub queue_check_interval: Duration,
    /// Admission floor.
    pub min_free_bytes: u64,
    /// Floor re-checked while a transfer is running.
    pub inflight_min_free_bytes: u64,
    pub terminate_grace: Duration,
    pub history_capacity: usize,
    pub video_quality: Quality,
    pub image_quality: Quality,
    pub naming: OutputNaming,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            max_attempts: 3,
            retry_delay: Duration::from_secs(30),
            liveness_interval: Duration::from_secs(5),
            queue_check_interval: Duration::from_secs(1),
            min_free_bytes: 500 * MIB,
            inflight_min_free_bytes: 100 * MIB,
            terminate_grace: Duration::from_secs(10),
            history_capacity: 1000,
            video_quality: Quality::Highest,
            image_quality: Quality::Highest,
            naming: OutputNaming {
                output_dir: PathBuf::from("downloads"),
                filename_format: "{target}_%Y%m%d_%H%M%S_{item_id}".into(),
                broadcast_format: "mp4".into(),
            },
        }
    }
}

/// Result of [`CaptureManager::admit`].
#[derive(Debug)]
pub enum Admission {
    /// A worker was spawned for a fresh task.
    Started(CaptureTask),
    /// The item already owns a slot; nothing was spawned.
    AlreadyActive(CaptureTask),
    /// Pool saturated; 1-based backlog position.
    Queued { position: usize },
    /// Preflight failed or the manager is shutting down.
    Rejected(CaptureError),
}

impl Admission {
    pub fn task(&self) -> Option<&CaptureTask> {
        match self {
            Admission::Started(t) | Admission::AlreadyActive(t) => Some(t),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct BacklogEntry {
    item: EphemeralItem,
    attempt: u32,
}

struct ActiveEntry {
    task: CaptureTask,
    stop: CancellationToken,
}

struct State {
    active: HashMap<String, ActiveEntry>,
    backlog: VecDeque<BacklogEntry>,
    history: CaptureHistory,
    shutting_down: bool,
}

struct Inner {
    cfg: CaptureConfig,
    tool: Arc<dyn CaptureTool>,
    disk: Arc<dyn DiskProbe>,
    ledger: Arc<DedupLedger>,
    bus: Arc<EventBus>,
    state: Mutex<State>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    retry_tx: mpsc::UnboundedSender<BacklogEntry>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn publish_gauges(st: &State) {
        metrics::gauge!("capture_active").set(st.active.len() as f64);
        metrics::gauge!("capture_backlog").set(st.backlog.len() as f64);
    }

    /// Mirror a worker's copy of its task into the active map.
    fn update_active(&self, task: &CaptureTask) {
        if let Some(entry) = self.lock().active.get_mut(task.item_id()) {
            entry.task = task.clone();
        }
    }

    /// Free the slot. Terminal tasks go to history; retry attempts don't.
    fn release(&self, task: &CaptureTask, record: bool) {
        let mut st = self.lock();
        st.active.remove(task.item_id());
        if record {
            st.history.push(task.clone());
        }
        Self::publish_gauges(&st);
    }

    fn schedule_retry(&self, item: EphemeralItem, attempt: u32) {
        if self.retry_tx.send(BacklogEntry { item, attempt }).is_err() {
            tracing::debug!(target: "capture", "retry queue closed; retry dropped");
        }
    }
}

/// Cheap to clone; all clones share one pool.
#[derive(Clone)]
pub struct CaptureManager {
    inner: Arc<Inner>,
}

impl CaptureManager {
    /// Build the manager and spawn its backlog/retry dispatcher.
    pub fn start(
        cfg: CaptureConfig,
        tool: Arc<dyn CaptureTool>,
        disk: Arc<dyn DiskProbe>,
        ledger: Arc<DedupLedger>,
        bus: Arc<EventBus>,
        shutdown: &CancellationToken,
    ) -> Self {
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        let history = CaptureHistory::with_capacity(cfg.history_capacity);
        let inner = Arc::new(Inner {
            cfg,
            tool,
            disk,
            ledger,
            bus,
            state: Mutex::new(State {
                active: HashMap::new(),
                backlog: VecDeque::new(),
                history,
                shutting_down: false,
            }),
            tracker: TaskTracker::new(),
            cancel: shutdown.child_token(),
            retry_tx,
        });
        let mgr = Self { inner };
        let dispatcher = mgr.clone();
        mgr.inner
            .tracker
            .spawn(async move { dispatcher.dispatch_loop(retry_rx).await });
        tracing::info!(
            target: "capture",
            max_concurrent = mgr.inner.cfg.max_concurrent,
            max_attempts = mgr.inner.cfg.max_attempts,
            tool = mgr.inner.tool.name(),
            "capture manager started"
        );
        mgr
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.inner.cfg
    }

    pub fn ledger(&self) -> &Arc<DedupLedger> {
        &self.inner.ledger
    }

    /// Admit a freshly appeared item.
    pub async fn admit(&self, item: EphemeralItem) -> Admission {
        self.admit_attempt(item, 1, false).await
    }

    async fn admit_attempt(&self, item: EphemeralItem, attempt: u32, from_backlog: bool) -> Admission {
        let id = item.item_id.clone();
        let cfg = &self.inner.cfg;

        // Decide under the lock; reserve the slot before leaving it.
        {
            let mut st = self.inner.lock();
            if st.shutting_down || self.inner.cancel.is_cancelled() {
                return Admission::Rejected(CaptureError::Interrupted);
            }
            if let Some(entry) = st.active.get(&id) {
                tracing::debug!(target: "capture", item_id = %id, "already capturing");
                return Admission::AlreadyActive(entry.task.clone());
            }
            if st.active.len() >= cfg.max_concurrent.max(1) {
                if let Some(pos) = st.backlog.iter().position(|e| e.item.item_id == id) {
                    return Admission::Queued { position: pos + 1 };
                }
                let entry = BacklogEntry { item, attempt };
                if from_backlog {
                    st.backlog.push_front(entry);
                } else {
                    st.backlog.push_back(entry);
                }
                let position = if from_backlog { 1 } else { st.backlog.len() };
                Inner::publish_gauges(&st);
                tracing::info!(
                    target: "capture",
                    item_id = %id,
                    position,
                    active = st.active.len(),
                    "pool saturated, queued"
                );
                return Admission::Queued { position };
            }
            // A backlog entry for this id is superseded by the live slot.
            st.backlog.retain(|e| e.item.item_id != id);
            let task = CaptureTask::new(item.clone(), PathBuf::new(), attempt, cfg.max_attempts);
            st.active.insert(
                id.clone(),
                ActiveEntry {
                    task,
                    stop: self.inner.cancel.child_token(),
                },
            );
            Inner::publish_gauges(&st);
        }

        let output_path = match self.preflight(&item) {
            Ok(p) => p,
            Err(e) => {
                {
                    let mut st = self.inner.lock();
                    st.active.remove(&id);
                    Inner::publish_gauges(&st);
                }
                tracing::warn!(target: "capture", item_id = %id, error = %e, "admission rejected");
                return Admission::Rejected(e);
            }
        };

        let (task, stop) = {
            let st = self.inner.lock();
            match st.active.get(&id) {
                Some(entry) if entry.task.output_path == output_path => {
                    (entry.task.clone(), entry.stop.clone())
                }
                // Stopped while preflight was running.
                _ => return Admission::Rejected(CaptureError::Interrupted),
            }
        };

        tracing::info!(
            target: "capture",
            item_id = %id,
            target_id = %task.item.target_id,
            kind = task.item.kind.as_str(),
            attempt = task.attempt_count,
            path = %task.output_path.display(),
            "capture admitted"
        );
        let mgr = self.clone();
        let spawned = task.clone();
        self.inner
            .tracker
            .spawn(async move { worker::run(mgr.inner, spawned, stop).await });
        Admission::Started(task)
    }

    fn preflight(&self, item: &EphemeralItem) -> Result<PathBuf, CaptureError> {
        let cfg = &self.inner.cfg;
        if !self.inner.tool.is_available(item.kind) {
            return Err(CaptureError::MissingTooling(format!(
                "no tool for {} items",
                item.kind.as_str()
            )));
        }
        ensure_free_space(
            self.inner.disk.as_ref(),
            &cfg.naming.output_dir,
            cfg.min_free_bytes,
        )?;
        self.claim_output_path(item)
    }

    /// Pick an output path and record it on the reserved slot. Another worker
    /// may hold a path it has not created yet, so the pick is re-checked
    /// against the active map under the lock before it sticks.
    fn claim_output_path(&self, item: &EphemeralItem) -> Result<PathBuf, CaptureError> {
        let naming = &self.inner.cfg.naming;
        let at = Utc::now();
        for _ in 0..MAX_CLAIM_ROUNDS {
            let held: HashSet<PathBuf> = self
                .inner
                .lock()
                .active
                .values()
                .filter(|e| !e.task.output_path.as_os_str().is_empty())
                .map(|e| e.task.output_path.clone())
                .collect();
            let path = naming.allocate_excluding(item, at, |p| held.contains(p))?;

            let mut st = self.inner.lock();
            let clash = st
                .active
                .iter()
                .any(|(id, e)| *id != item.item_id && e.task.output_path == path);
            if clash {
                continue;
            }
            return match st.active.get_mut(&item.item_id) {
                Some(entry) => {
                    entry.task.output_path = path.clone();
                    Ok(path)
                }
                None => Err(CaptureError::Interrupted),
            };
        }
        Err(CaptureError::Io(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            "output path kept colliding with running captures",
        )))
    }

    /// Gracefully stop one capture, or drop it from the backlog.
    pub fn stop_capture(&self, item_id: &str) -> bool {
        let mut st = self.inner.lock();
        if let Some(entry) = st.active.get(item_id) {
            entry.stop.cancel();
            tracing::info!(target: "capture", item_id, "stop requested");
            return true;
        }
        let before = st.backlog.len();
        st.backlog.retain(|e| e.item.item_id != item_id);
        let removed = st.backlog.len() != before;
        Inner::publish_gauges(&st);
        removed
    }

    pub fn is_active(&self, item_id: &str) -> bool {
        self.inner.lock().active.contains_key(item_id)
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().active.len()
    }

    pub fn active_tasks(&self) -> Vec<CaptureTask> {
        let mut tasks: Vec<CaptureTask> =
            self.inner.lock().active.values().map(|e| e.task.clone()).collect();
        tasks.sort_by(|a, b| a.item.item_id.cmp(&b.item.item_id));
        tasks
    }

    pub fn backlog_len(&self) -> usize {
        self.inner.lock().backlog.len()
    }

    pub fn recent(&self, n: usize) -> Vec<CaptureTask> {
        self.inner.lock().history.last_n(n)
    }

    pub fn stats(&self) -> CaptureStats {
        let st = self.inner.lock();
        CaptureStats::from_history(&st.history, st.active.len(), st.backlog.len())
    }

    /// Move backlog entries into free slots, oldest first.
    pub async fn drain_backlog(&self) {
        loop {
            let entry = {
                let mut st = self.inner.lock();
                if st.shutting_down || st.active.len() >= self.inner.cfg.max_concurrent.max(1) {
                    return;
                }
                match st.backlog.pop_front() {
                    Some(e) => {
                        Inner::publish_gauges(&st);
                        e
                    }
                    None => return,
                }
            };
            let item = entry.item.clone();
            match self.admit_attempt(entry.item, entry.attempt, true).await {
                Admission::Queued { .. } => return,
                Admission::Rejected(e) => self.report_rejected(item, entry.attempt, e),
                _ => {}
            }
        }
    }

    /// Rejections of items that were accepted earlier still get one failure event.
    fn report_rejected(&self, item: EphemeralItem, attempt: u32, err: CaptureError) {
        if matches!(err, CaptureError::Interrupted) && self.inner.cancel.is_cancelled() {
            return;
        }
        let mut task = CaptureTask::new(item, PathBuf::new(), attempt, self.inner.cfg.max_attempts);
        task.status = TaskStatus::Failed;
        task.ended_at = Some(Utc::now());
        task.error_class = Some(err.class());
        task.error_message = err.bounded_message();
        self.inner.lock().history.push(task.clone());
        metrics::counter!("capture_failed_total").increment(1);
        self.inner.bus.emit(PipelineEvent::CaptureFailed(task));
    }

    async fn dispatch_loop(self, mut retry_rx: mpsc::UnboundedReceiver<BacklogEntry>) {
        let cfg = &self.inner.cfg;
        let mut delayed: DelayQueue<u64> = DelayQueue::new();
        let mut waiting: HashMap<u64, BacklogEntry> = HashMap::new();
        let mut next_id = 0u64;
        let mut ticker = tokio::time::interval(cfg.queue_check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                Some(entry) = retry_rx.recv() => {
                    tracing::info!(
                        target: "capture",
                        item_id = %entry.item.item_id,
                        attempt = entry.attempt,
                        delay_secs = cfg.retry_delay.as_secs(),
                        "retry scheduled"
                    );
                    next_id += 1;
                    waiting.insert(next_id, entry);
                    delayed.insert(next_id, cfg.retry_delay);
                }
                Some(expired) = futures::StreamExt::next(&mut delayed), if !delayed.is_empty() => {
                    let Some(entry) = waiting.remove(expired.get_ref()) else { continue };
                    let item = entry.item.clone();
                    if let Admission::Rejected(e) = self.admit_attempt(entry.item, entry.attempt, false).await {
                        self.report_rejected(item, entry.attempt, e);
                    }
                }
                _ = ticker.tick() => self.drain_backlog().await,
            }
        }
        // Retries still waiting out their delay end here, with one failure each.
        while let Ok(entry) = retry_rx.try_recv() {
            next_id += 1;
            waiting.insert(next_id, entry);
        }
        for (_, entry) in waiting.drain() {
            let mut task =
                CaptureTask::new(entry.item, PathBuf::new(), entry.attempt, cfg.max_attempts);
            task.status = TaskStatus::Failed;
            task.ended_at = Some(Utc::now());
            task.error_class = Some(CaptureError::Interrupted.class());
            task.error_message = CaptureError::Interrupted.bounded_message();
            metrics::counter!("capture_failed_total").increment(1);
            self.inner.bus.emit(PipelineEvent::CaptureFailed(task));
        }
        tracing::debug!(target: "capture", "dispatcher stopped");
    }

    /// Stop admissions, discard the backlog, signal workers and wait for them
    /// (bounded by `timeout`).
    pub async fn shutdown(&self, timeout: Duration) {
        let discarded = {
            let mut st = self.inner.lock();
            st.shutting_down = true;
            let n = st.backlog.len();
            st.backlog.clear();
            Inner::publish_gauges(&st);
            n
        };
        if discarded > 0 {
            tracing::info!(target: "capture", discarded, "backlog discarded");
        }
        self.inner.cancel.cancel();
        self.inner.tracker.close();
        if tokio::time::timeout(timeout, self.inner.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                target: "capture",
                remaining = self.active_count(),
                "shutdown timed out waiting for captures"
            );
        } else {
            tracing::info!(target: "capture", "capture manager stopped");
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::transfer::TransferHandle;
    use crate::item::ItemKind;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
    use tests_support::item;

    /// Transfers finish only once `release` is set.
    struct GateTool {
        release: Arc<AtomicBool>,
        started: AtomicUsize,
        terminations: Arc<AtomicUsize>,
        fail_with_transfer: bool,
    }

    struct GateHandle {
        release: Arc<AtomicBool>,
        terminations: Arc<AtomicUsize>,
        fail: bool,
        terminated: bool,
    }

    #[async_trait]
    impl TransferHandle for GateHandle {
        async fn poll(&mut self) -> Option<Result<(), CaptureError>> {
            if self.terminated || !self.release.load(Ordering::SeqCst) {
                return None;
            }
            Some(if self.fail {
                Err(CaptureError::Transfer("exit 1".into()))
            } else {
                Ok(())
            })
        }
        async fn terminate(&mut self, _grace: Duration) {
            self.terminated = true;
            self.terminations.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl CaptureTool for GateTool {
        fn name(&self) -> &'static str {
            "gate"
        }
        fn is_available(&self, _kind: ItemKind) -> bool {
            true
        }
        async fn start(
            &self,
            _item: &EphemeralItem,
            _url: &str,
            output: &Path,
        ) -> Result<Box<dyn TransferHandle>, CaptureError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            std::fs::write(output, b"")?;
            Ok(Box::new(GateHandle {
                release: self.release.clone(),
                terminations: self.terminations.clone(),
                fail: self.fail_with_transfer,
                terminated: false,
            }))
        }
    }

    /// Panics inside the worker, after the slot is taken.
    struct PanicTool;

    #[async_trait]
    impl CaptureTool for PanicTool {
        fn name(&self) -> &'static str {
            "panic"
        }
        fn is_available(&self, _kind: ItemKind) -> bool {
            true
        }
        async fn start(
            &self,
            _item: &EphemeralItem,
            _url: &str,
            _output: &Path,
        ) -> Result<Box<dyn TransferHandle>, CaptureError> {
            panic!("tool blew up")
        }
    }

    struct Disk(AtomicU64);
    impl DiskProbe for Disk {
        fn free_bytes(&self, _: &Path) -> std::io::Result<u64> {
            Ok(self.0.load(Ordering::SeqCst))
        }
    }

    struct Harness {
        mgr: CaptureManager,
        release: Arc<AtomicBool>,
        tool: Arc<GateTool>,
        disk: Arc<Disk>,
        bus: Arc<EventBus>,
        _dir: tempfile::TempDir,
    }

    fn test_config(dir: &Path, max_concurrent: usize, max_attempts: u32) -> CaptureConfig {
        CaptureConfig {
            max_concurrent,
            max_attempts,
            retry_delay: Duration::from_millis(20),
            liveness_interval: Duration::from_millis(5),
            queue_check_interval: Duration::from_millis(5),
            naming: OutputNaming {
                output_dir: dir.to_path_buf(),
                filename_format: "{target}_{item_id}".into(),
                broadcast_format: "mp4".into(),
            },
            ..CaptureConfig::default()
        }
    }

    fn start_manager(
        cfg: CaptureConfig,
        tool: Arc<dyn CaptureTool>,
        disk: Arc<Disk>,
    ) -> (CaptureManager, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new());
        let mgr = CaptureManager::start(
            cfg,
            tool,
            disk,
            Arc::new(DedupLedger::in_memory(chrono::Duration::hours(24))),
            bus.clone(),
            &CancellationToken::new(),
        );
        (mgr, bus)
    }

    fn harness(max_concurrent: usize, max_attempts: u32, fail: bool, free: u64) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path(), max_concurrent, max_attempts);
        harness_with(dir, cfg, fail, free)
    }

    fn harness_with(dir: tempfile::TempDir, cfg: CaptureConfig, fail: bool, free: u64) -> Harness {
        let release = Arc::new(AtomicBool::new(false));
        let tool = Arc::new(GateTool {
            release: release.clone(),
            started: AtomicUsize::new(0),
            terminations: Arc::new(AtomicUsize::new(0)),
            fail_with_transfer: fail,
        });
        let disk = Arc::new(Disk(AtomicU64::new(free)));
        let (mgr, bus) = start_manager(cfg, tool.clone(), disk.clone());
        Harness {
            mgr,
            release,
            tool,
            disk,
            bus,
            _dir: dir,
        }
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..400 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn readmission_is_idempotent() {
        let h = harness(3, 3, false, u64::MAX);
        let first = h.mgr.admit(item("b1", "alice")).await;
        let second = h.mgr.admit(item("b1", "alice")).await;
        let Admission::Started(t1) = first else { panic!("expected start") };
        let Admission::AlreadyActive(t2) = second else { panic!("expected existing") };
        assert_eq!(t1.output_path, t2.output_path);
        assert_eq!(h.mgr.active_count(), 1);
        wait_for(|| h.tool.started.load(Ordering::SeqCst) == 1).await;
        h.mgr.shutdown(Duration::from_secs(1)).await;
        assert_eq!(h.tool.started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ceiling_holds_and_backlog_drains() {
        let h = harness(1, 3, false, u64::MAX);
        let mut rx = h.bus.subscribe();
        assert!(matches!(h.mgr.admit(item("b1", "a")).await, Admission::Started(_)));
        assert!(matches!(
            h.mgr.admit(item("b2", "b")).await,
            Admission::Queued { position: 1 }
        ));
        // Duplicate of a queued item keeps its place.
        assert!(matches!(
            h.mgr.admit(item("b2", "b")).await,
            Admission::Queued { position: 1 }
        ));
        assert_eq!(h.mgr.active_count(), 1);
        assert_eq!(h.mgr.backlog_len(), 1);

        h.release.store(true, Ordering::SeqCst);
        let mut completed = Vec::new();
        while completed.len() < 2 {
            if let Some(PipelineEvent::CaptureCompleted(t)) = rx.recv().await {
                assert!(h.mgr.active_count() <= 1);
                completed.push(t.item.item_id);
            }
        }
        assert_eq!(completed, vec!["b1", "b2"]);
        assert_eq!(h.mgr.backlog_len(), 0);
        assert!(h.mgr.ledger().is_recorded("b1"));
        assert_eq!(h.mgr.stats().completed, 2);
        h.mgr.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn low_disk_rejects_before_any_worker() {
        let h = harness(3, 3, false, 10 * MIB);
        let mut rx = h.bus.subscribe();
        let res = h.mgr.admit(item("b1", "a")).await;
        assert!(matches!(res, Admission::Rejected(CaptureError::DiskExhausted(_))));
        assert_eq!(h.mgr.active_count(), 0);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(h.tool.started.load(Ordering::SeqCst), 0);
        h.mgr.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let h = harness(2, 3, true, u64::MAX);
        h.release.store(true, Ordering::SeqCst);
        let mut rx = h.bus.subscribe();
        h.mgr.admit(item("b1", "a")).await;
        let mut retries = 0;
        let mut paths = std::collections::HashSet::new();
        let failed = loop {
            match rx.recv().await {
                Some(PipelineEvent::CaptureStarted(t)) => {
                    assert!(paths.insert(t.output_path.clone()), "path reused");
                }
                Some(PipelineEvent::CaptureRetry(_)) => retries += 1,
                Some(PipelineEvent::CaptureFailed(t)) => break t,
                Some(_) => {}
                None => panic!("bus closed"),
            }
        };
        assert_eq!(retries, 2);
        assert_eq!(failed.attempt_count, 3);
        assert_eq!(failed.status, TaskStatus::Failed);
        assert!(failed.error_message.contains("exit 1"));
        assert_eq!(h.tool.started.load(Ordering::SeqCst), 3);
        wait_for(|| h.mgr.stats().failed == 1).await;
        assert_eq!(h.mgr.stats().total_retries, 2);
        h.mgr.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn shutdown_interrupts_running_capture_once() {
        let h = harness(1, 3, false, u64::MAX);
        let mut rx = h.bus.subscribe();
        h.mgr.admit(item("b1", "a")).await;
        h.mgr.admit(item("b2", "a")).await;
        wait_for(|| h.tool.started.load(Ordering::SeqCst) == 1).await;
        h.mgr.shutdown(Duration::from_secs(1)).await;
        assert_eq!(h.mgr.active_count(), 0);
        assert_eq!(h.mgr.backlog_len(), 0);
        let mut failed = 0;
        while let Ok(ev) = rx.try_recv() {
            if let PipelineEvent::CaptureFailed(t) = ev {
                assert_eq!(t.item.item_id, "b1");
                failed += 1;
            }
        }
        assert_eq!(failed, 1);
        assert!(matches!(
            h.mgr.admit(item("b3", "a")).await,
            Admission::Rejected(CaptureError::Interrupted)
        ));
    }

    #[tokio::test]
    async fn stop_capture_ends_single_transfer() {
        let h = harness(2, 3, false, u64::MAX);
        let mut rx = h.bus.subscribe();
        h.mgr.admit(item("b1", "a")).await;
        wait_for(|| h.tool.started.load(Ordering::SeqCst) == 1).await;
        assert!(h.mgr.stop_capture("b1"));
        assert!(!h.mgr.stop_capture("nope"));
        loop {
            match rx.recv().await {
                Some(PipelineEvent::CaptureFailed(t)) => {
                    assert_eq!(t.error_class, Some(crate::error::ErrorClass::Unknown));
                    break;
                }
                Some(PipelineEvent::CaptureRetry(_)) => panic!("manual stop must not retry"),
                Some(_) => {}
                None => panic!("bus closed"),
            }
        }
        wait_for(|| h.mgr.active_count() == 0).await;
        h.mgr.shutdown(Duration::from_secs(1)).await;
    }

    fn story(item_id: &str, target: &str) -> EphemeralItem {
        let mut it = item(item_id, target);
        it.kind = ItemKind::Story;
        it.media_type = crate::item::MediaType::Image;
        it.media = vec![crate::item::MediaCandidate::new(format!(
            "https://scontent.cdninstagram.com/{item_id}.jpg"
        ))];
        it
    }

    #[tokio::test]
    async fn same_second_stories_get_distinct_paths() {
        // The shipped template, and one without the item id that can only be
        // kept apart by the claim on running captures.
        for template in [
            CaptureConfig::default().naming.filename_format,
            "{target}_%Y%m%d_%H%M%S".to_string(),
        ] {
            let dir = tempfile::tempdir().unwrap();
            let mut cfg = test_config(dir.path(), 3, 1);
            cfg.naming.filename_format = template.clone();
            let h = harness_with(dir, cfg, false, u64::MAX);

            let Admission::Started(s1) = h.mgr.admit(story("S1", "alice")).await else {
                panic!("S1 not started")
            };
            let Admission::Started(s2) = h.mgr.admit(story("S2", "alice")).await else {
                panic!("S2 not started")
            };
            assert_ne!(s1.output_path, s2.output_path, "template {template}");
            assert!(s1.output_path.starts_with(h._dir.path().join("alice")));
            assert_eq!(s1.output_path.extension().unwrap(), "jpg");

            h.release.store(true, Ordering::SeqCst);
            wait_for(|| h.mgr.stats().completed == 2).await;
            h.mgr.shutdown(Duration::from_secs(1)).await;
        }
    }

    #[tokio::test]
    async fn panicking_worker_still_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (mgr, bus) = start_manager(
            test_config(dir.path(), 2, 3),
            Arc::new(PanicTool),
            Arc::new(Disk(AtomicU64::new(u64::MAX))),
        );
        let mut rx = bus.subscribe();
        assert!(matches!(mgr.admit(item("b1", "a")).await, Admission::Started(_)));

        let failed = loop {
            match rx.recv().await {
                Some(PipelineEvent::CaptureFailed(t)) => break t,
                Some(PipelineEvent::CaptureRetry(_)) => panic!("aborted worker must not retry"),
                Some(_) => {}
                None => panic!("bus closed"),
            }
        };
        assert_eq!(failed.item.item_id, "b1");
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error_message, "worker aborted");
        wait_for(|| mgr.active_count() == 0).await;
        assert_eq!(mgr.stats().failed, 1);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(rx.try_recv().is_err(), "more than one event after the abort");
        mgr.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn disk_floor_mid_transfer_terminates_without_retry() {
        let h = harness(2, 3, false, u64::MAX);
        let mut rx = h.bus.subscribe();
        h.mgr.admit(item("b1", "a")).await;
        wait_for(|| h.tool.started.load(Ordering::SeqCst) == 1).await;

        h.disk.0.store(10 * MIB, Ordering::SeqCst);
        let failed = loop {
            match rx.recv().await {
                Some(PipelineEvent::CaptureFailed(t)) => break t,
                Some(PipelineEvent::CaptureRetry(_)) => panic!("disk exhaustion must not retry"),
                Some(_) => {}
                None => panic!("bus closed"),
            }
        };
        assert_eq!(
            failed.error_class,
            Some(crate::error::ErrorClass::DiskExhausted)
        );
        assert_eq!(h.tool.terminations.load(Ordering::SeqCst), 1);
        wait_for(|| h.mgr.active_count() == 0).await;
        assert_eq!(h.tool.started.load(Ordering::SeqCst), 1);
        assert_eq!(h.mgr.stats().total_retries, 0);
        h.mgr.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn missing_media_url_retries_then_fails() {
        let h = harness(2, 3, false, u64::MAX);
        let mut rx = h.bus.subscribe();
        let mut it = item("b1", "a");
        it.media.clear();
        h.mgr.admit(it).await;

        let mut retries = 0;
        let failed = loop {
            match rx.recv().await {
                Some(PipelineEvent::CaptureRetry(t)) => {
                    retries += 1;
                    assert_eq!(t.attempt_count, retries);
                }
                Some(PipelineEvent::CaptureFailed(t)) => break t,
                Some(_) => {}
                None => panic!("bus closed"),
            }
        };
        assert_eq!(retries, 2);
        assert_eq!(failed.attempt_count, 3);
        assert_eq!(failed.error_message, CaptureError::UrlUnavailable.to_string());
        assert_eq!(failed.error_class, Some(CaptureError::UrlUnavailable.class()));
        assert_eq!(h.tool.started.load(Ordering::SeqCst), 0);
        h.mgr.shutdown(Duration::from_secs(1)).await;
    }
}
