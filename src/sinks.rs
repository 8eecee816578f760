// src/sinks.rs
//! Event consumers that sit outside the capture path (notifications, daily
//! stats). Each sink gets its own subscription and task, so a slow webhook
//! never delays another sink or the pipeline.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::events::{EventBus, PipelineEvent};
use crate::notify::NotifierMux;

#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    fn name(&self) -> &'static str;
    async fn handle(&self, ev: &PipelineEvent);
}

#[async_trait::async_trait]
impl EventSink for NotifierMux {
    fn name(&self) -> &'static str {
        "notify"
    }

    async fn handle(&self, ev: &PipelineEvent) {
        self.on_event(ev).await;
    }
}

/// Feed every bus event to `sink` until `cancel` fires; events already queued
/// at that point are still delivered.
pub fn spawn_sink(
    bus: &EventBus,
    sink: Arc<dyn EventSink>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                ev = rx.recv() => match ev {
                    Some(ev) => sink.handle(&ev).await,
                    None => break,
                },
                _ = cancel.cancelled() => {
                    while let Ok(ev) = rx.try_recv() {
                        sink.handle(&ev).await;
                    }
                    break;
                }
            }
        }
        tracing::debug!(sink = sink.name(), "sink stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<&'static str>>);

    #[async_trait::async_trait]
    impl EventSink for Collect {
        fn name(&self) -> &'static str {
            "collect"
        }
        async fn handle(&self, ev: &PipelineEvent) {
            self.0.lock().unwrap().push(ev.name());
        }
    }

    #[tokio::test]
    async fn delivers_queued_events_after_cancel() {
        let bus = EventBus::new();
        let sink = Arc::new(Collect::default());
        let cancel = CancellationToken::new();
        let handle = spawn_sink(&bus, sink.clone(), cancel.clone());
        for _ in 0..3 {
            bus.emit(PipelineEvent::PollError {
                target_id: "a".into(),
                message: "x".into(),
            });
        }
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(sink.0.lock().unwrap().len(), 3);
    }
}
