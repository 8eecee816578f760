// src/metrics.rs
use anyhow::{Context, Result};
use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

/// One-time metrics registration (so series show up on /metrics).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("monitor_ticks_total", "Poll ticks that queried the platform.");
        describe_counter!(
            "monitor_tick_skipped_total",
            "Poll ticks skipped by cooldown or rate limiting."
        );
        describe_counter!("monitor_items_appeared_total", "Items seen for the first time.");
        describe_counter!("monitor_items_ended_total", "Items no longer active.");
        describe_counter!(
            "monitor_target_errors_total",
            "Per-target check failures (batch continued)."
        );
        describe_counter!("capture_started_total", "Capture attempts started.");
        describe_counter!("capture_completed_total", "Captures completed.");
        describe_counter!("capture_failed_total", "Captures failed for good.");
        describe_counter!("capture_retry_total", "Capture attempts scheduled for retry.");
        describe_counter!("capture_rejected_total", "Admissions rejected by preflight.");
        describe_counter!("capture_bytes_total", "Bytes written by completed captures.");
        describe_histogram!(
            "capture_duration_seconds",
            "Wall time of completed capture attempts."
        );
        describe_gauge!("capture_active", "Captures currently holding a pool slot.");
        describe_gauge!("capture_backlog", "Items waiting for a free slot.");
        describe_gauge!("ledger_entries", "Live entries in the dedup ledger.");
    });
}

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder. Call once per process.
    pub fn init() -> Result<Self> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("prometheus: install recorder")?;
        ensure_metrics_described();
        Ok(Self { handle })
    }

    /// Returns a router exposing `/metrics` with the Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}
