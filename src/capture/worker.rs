// src/capture/worker.rs
//! One worker drives one task to a terminal state (or to a scheduled retry).

use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::preflight::{ensure_free_space, url_host, validate_media_url};
use super::task::{CaptureTask, TaskStatus};
use super::Inner;
use crate::error::{CaptureError, ErrorClass};
use crate::events::PipelineEvent;
use crate::item::MediaType;

/// Frees the slot even if the worker future is dropped or panics.
struct ActiveSlot {
    inner: Arc<Inner>,
    task: CaptureTask,
    record: bool,
    released: bool,
}

impl ActiveSlot {
    fn finish(mut self, task: &CaptureTask, record: bool) {
        self.task = task.clone();
        self.record = record;
        self.release();
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.inner.release(&self.task, self.record);
        }
    }
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // The worker never reached a terminal branch, so nothing was emitted yet.
        self.task.status = TaskStatus::Failed;
        self.task.ended_at = Some(Utc::now());
        self.task.error_class = Some(ErrorClass::Unknown);
        self.task.error_message = "worker aborted".into();
        self.record = true;
        self.release();
        tracing::error!(
            target: "capture",
            item_id = %self.task.item.item_id,
            attempt = self.task.attempt_count,
            "capture worker aborted"
        );
        metrics::counter!("capture_failed_total").increment(1);
        self.inner
            .bus
            .emit(PipelineEvent::CaptureFailed(self.task.clone()));
    }
}

pub(super) async fn run(inner: Arc<Inner>, mut task: CaptureTask, stop: CancellationToken) {
    let slot = ActiveSlot {
        inner: inner.clone(),
        task: task.clone(),
        record: true,
        released: false,
    };

    task.status = TaskStatus::Running;
    task.started_at = Some(Utc::now());
    inner.update_active(&task);
    metrics::counter!("capture_started_total").increment(1);
    inner.bus.emit(PipelineEvent::CaptureStarted(task.clone()));

    let result = transfer(&inner, &task, &stop).await;
    task.ended_at = Some(Utc::now());

    match result {
        Ok(()) => {
            task.status = TaskStatus::Completed;
            task.bytes_written = tokio::fs::metadata(&task.output_path)
                .await
                .map(|m| m.len())
                .unwrap_or(0);
            inner.ledger.mark_recorded(task.item_id()).await;
            slot.finish(&task, true);
            tracing::info!(
                target: "capture",
                item_id = %task.item.item_id,
                target_id = %task.item.target_id,
                attempt = task.attempt_count,
                bytes = task.bytes_written,
                path = %task.output_path.display(),
                "capture completed"
            );
            metrics::counter!("capture_completed_total").increment(1);
            metrics::counter!("capture_bytes_total").increment(task.bytes_written);
            if let Some(d) = task.duration() {
                metrics::histogram!("capture_duration_seconds")
                    .record(d.num_milliseconds().max(0) as f64 / 1000.0);
            }
            inner.bus.emit(PipelineEvent::CaptureCompleted(task));
        }
        Err(err) => {
            let class = err.class();
            task.status = TaskStatus::Failed;
            task.error_class = Some(class);
            task.error_message = err.bounded_message();
            let interrupted = matches!(err, CaptureError::Interrupted);
            if !interrupted && class.is_retryable() && task.has_attempts_left() {
                slot.finish(&task, false);
                tracing::warn!(
                    target: "capture",
                    item_id = %task.item.item_id,
                    attempt = task.attempt_count,
                    max_attempts = task.max_attempts,
                    error = %err,
                    "capture attempt failed, will retry"
                );
                metrics::counter!("capture_retry_total").increment(1);
                inner.schedule_retry(task.item.clone(), task.attempt_count + 1);
                inner.bus.emit(PipelineEvent::CaptureRetry(task));
            } else {
                slot.finish(&task, true);
                tracing::error!(
                    target: "capture",
                    item_id = %task.item.item_id,
                    attempt = task.attempt_count,
                    class = %class,
                    error = %err,
                    "capture failed"
                );
                metrics::counter!("capture_failed_total").increment(1);
                inner.bus.emit(PipelineEvent::CaptureFailed(task));
            }
        }
    }
}

async fn transfer(
    inner: &Inner,
    task: &CaptureTask,
    stop: &CancellationToken,
) -> Result<(), CaptureError> {
    let cfg = &inner.cfg;
    let quality = match task.item.media_type {
        MediaType::Video => cfg.video_quality,
        MediaType::Image => cfg.image_quality,
    };
    let url = quality
        .select(&task.item.media)
        .ok_or(CaptureError::UrlUnavailable)?
        .to_string();
    if let Err(e) = validate_media_url(&url) {
        // The URL came from an authenticated response; log and carry on.
        tracing::warn!(target: "capture", item_id = %task.item.item_id, host = %url_host(&url), error = %e, "media URL failed validation");
    }

    let mut handle = inner.tool.start(&task.item, &url, &task.output_path).await?;
    tracing::debug!(target: "capture", item_id = %task.item.item_id, host = %url_host(&url), "transfer started");

    let mut ticker = tokio::time::interval(cfg.liveness_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                handle.terminate(cfg.terminate_grace).await;
                return stopped_outcome(inner, task).await;
            }
            _ = ticker.tick() => {}
        }
        if let Some(outcome) = handle.poll().await {
            return outcome;
        }
        if let Err(e) = ensure_free_space(
            inner.disk.as_ref(),
            &task.output_path,
            cfg.inflight_min_free_bytes,
        ) {
            tracing::error!(target: "capture", item_id = %task.item.item_id, "disk floor crossed mid-transfer, terminating");
            handle.terminate(cfg.terminate_grace).await;
            return Err(e);
        }
    }
}

/// Shutdown always fails the task; a manual stop keeps whatever was written.
async fn stopped_outcome(inner: &Inner, task: &CaptureTask) -> Result<(), CaptureError> {
    if inner.cancel.is_cancelled() {
        return Err(CaptureError::Interrupted);
    }
    match tokio::fs::metadata(&task.output_path).await {
        Ok(m) if m.len() > 0 => {
            tracing::info!(target: "capture", item_id = %task.item.item_id, "stopped by request, keeping partial output");
            Ok(())
        }
        _ => Err(CaptureError::Interrupted),
    }
}
