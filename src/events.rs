//! Typed pipeline events and a non-blocking fan-out bus.
//!
//! Every subscriber gets its own unbounded channel, so `emit` never waits on a
//! slow consumer and per-subscriber ordering matches emission order.

use std::sync::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::capture::task::CaptureTask;
use crate::item::EphemeralItem;

#[derive(Debug, Clone)]
pub enum PipelineEvent {
    ItemAppeared(EphemeralItem),
    ItemEnded(EphemeralItem),
    CaptureStarted(CaptureTask),
    CaptureCompleted(CaptureTask),
    CaptureRetry(CaptureTask),
    CaptureFailed(CaptureTask),
    /// A single target's check failed; the rest of the tick continued.
    PollError { target_id: String, message: String },
}

impl PipelineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PipelineEvent::ItemAppeared(_) => "item_appeared",
            PipelineEvent::ItemEnded(_) => "item_ended",
            PipelineEvent::CaptureStarted(_) => "capture_start",
            PipelineEvent::CaptureCompleted(_) => "capture_complete",
            PipelineEvent::CaptureRetry(_) => "capture_retry",
            PipelineEvent::CaptureFailed(_) => "capture_failed",
            PipelineEvent::PollError { .. } => "poll_error",
        }
    }
}

#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<UnboundedSender<PipelineEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> UnboundedReceiver<PipelineEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(tx);
        rx
    }

    /// Deliver to every live subscriber; dropped receivers are pruned.
    pub fn emit(&self, event: PipelineEvent) {
        let mut subs = self.lock();
        subs.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<UnboundedSender<PipelineEvent>>> {
        self.subscribers.lock().unwrap_or_else(|p| p.into_inner())
    }
}
