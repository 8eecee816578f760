// src/api.rs
//! Status HTTP API.
//!
//! - `GET  /health`                   -> `OK`
//! - `GET  /status`                   -> poller + capture snapshot
//! - `GET  /captures/recent?limit=N`  -> last finished captures
//! - `POST /captures/{item_id}/stop`  -> stop one capture (404 if unknown)
//!
//! Media URLs carry signed tokens and are never returned.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::capture::task::{CaptureStats, CaptureTask, TaskStatus};
use crate::capture::CaptureManager;
use crate::error::ErrorClass;
use crate::ledger::DedupLedger;
use crate::monitor::{Poller, PollerStats};
use crate::stats::{DailyStats, DayStats};

#[derive(Clone)]
pub struct AppState {
    pub poller: Arc<Poller>,
    pub captures: CaptureManager,
    pub ledger: Arc<DedupLedger>,
    pub daily: Option<Arc<DailyStats>>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/status", get(status))
        .route("/captures/recent", get(recent))
        .route("/captures/{item_id}/stop", post(stop))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct CaptureSummary {
    pub item_id: String,
    pub target_id: String,
    pub kind: &'static str,
    pub status: TaskStatus,
    pub attempt: u32,
    pub max_attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub file: String,
    pub bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_class: Option<ErrorClass>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl From<&CaptureTask> for CaptureSummary {
    fn from(t: &CaptureTask) -> Self {
        Self {
            item_id: t.item.item_id.clone(),
            target_id: t.item.target_id.clone(),
            kind: t.item.kind.as_str(),
            status: t.status,
            attempt: t.attempt_count,
            max_attempts: t.max_attempts,
            started_at: t.started_at,
            ended_at: t.ended_at,
            file: t
                .output_path
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_default(),
            bytes: t.bytes_written,
            error_class: t.error_class,
            error: t.error_message.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct StatusResp {
    poller: PollerStats,
    captures: CaptureStats,
    active: Vec<CaptureSummary>,
    backlog: usize,
    ledger_entries: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    today: Option<DayStats>,
}

async fn status(State(state): State<AppState>) -> Json<StatusResp> {
    let active = state
        .captures
        .active_tasks()
        .iter()
        .map(CaptureSummary::from)
        .collect();
    Json(StatusResp {
        poller: state.poller.stats(),
        captures: state.captures.stats(),
        active,
        backlog: state.captures.backlog_len(),
        ledger_entries: state.ledger.len(),
        today: state.daily.as_ref().map(|d| d.today()),
    })
}

#[derive(Debug, Deserialize)]
struct RecentQuery {
    limit: Option<usize>,
}

async fn recent(
    State(state): State<AppState>,
    Query(q): Query<RecentQuery>,
) -> Json<Vec<CaptureSummary>> {
    let limit = q.limit.unwrap_or(20).clamp(1, 200);
    Json(
        state
            .captures
            .recent(limit)
            .iter()
            .rev()
            .map(CaptureSummary::from)
            .collect(),
    )
}

async fn stop(
    State(state): State<AppState>,
    Path(item_id): Path<String>,
) -> (StatusCode, Json<serde_json::Value>) {
    if state.captures.stop_capture(&item_id) {
        (
            StatusCode::OK,
            Json(serde_json::json!({ "item_id": item_id, "stopped": true })),
        )
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "item_id": item_id, "stopped": false })),
        )
    }
}
