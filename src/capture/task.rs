// src/capture/task.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;

use crate::error::ErrorClass;
use crate::item::EphemeralItem;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// One attempt at capturing one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureTask {
    pub item: EphemeralItem,
    /// Fresh for every attempt; never reused.
    pub output_path: PathBuf,
    pub status: TaskStatus,
    /// 1-based; `attempt_count <= max_attempts`.
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error_class: Option<ErrorClass>,
    #[serde(default)]
    pub error_message: String,
    pub bytes_written: u64,
}

impl CaptureTask {
    pub fn new(item: EphemeralItem, output_path: PathBuf, attempt: u32, max_attempts: u32) -> Self {
        let max_attempts = max_attempts.max(1);
        Self {
            item,
            output_path,
            status: TaskStatus::Pending,
            attempt_count: attempt.clamp(1, max_attempts),
            max_attempts,
            started_at: None,
            ended_at: None,
            error_class: None,
            error_message: String::new(),
            bytes_written: 0,
        }
    }

    pub fn item_id(&self) -> &str {
        &self.item.item_id
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempt_count < self.max_attempts
    }

    /// Wall-clock duration of the attempt, when both ends are known.
    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.ended_at? - self.started_at?)
    }
}

/// Bounded ring of finished tasks, oldest evicted first. Statistics only.
#[derive(Debug, Clone)]
pub struct CaptureHistory {
    cap: usize,
    items: VecDeque<CaptureTask>,
}

impl CaptureHistory {
    pub fn with_capacity(cap: usize) -> Self {
        let cap = cap.max(1);
        Self {
            cap,
            items: VecDeque::with_capacity(cap.min(1024)),
        }
    }

    pub fn push(&mut self, task: CaptureTask) {
        self.items.push_back(task);
        while self.items.len() > self.cap {
            self.items.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CaptureTask> {
        self.items.iter()
    }

    pub fn last_n(&self, n: usize) -> Vec<CaptureTask> {
        let start = self.items.len().saturating_sub(n);
        self.items.iter().skip(start).cloned().collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CaptureStats {
    pub active: usize,
    pub backlog: usize,
    pub completed: usize,
    pub failed: usize,
    pub total_retries: u64,
    pub total_bytes: u64,
    pub total_size_formatted: String,
}

impl CaptureStats {
    pub(crate) fn from_history(history: &CaptureHistory, active: usize, backlog: usize) -> Self {
        let mut s = CaptureStats {
            active,
            backlog,
            ..Default::default()
        };
        for t in history.iter() {
            match t.status {
                TaskStatus::Completed => {
                    s.completed += 1;
                    s.total_bytes += t.bytes_written;
                }
                TaskStatus::Failed => s.failed += 1,
                _ => {}
            }
            s.total_retries += u64::from(t.attempt_count.saturating_sub(1));
        }
        s.total_size_formatted = format_size(s.total_bytes);
        s
    }
}

/// `1536` → `1.5 KB`.
pub fn format_size(bytes: u64) -> String {
    if bytes == 0 {
        return "0 B".to_string();
    }
    let mut size = bytes as f64;
    for unit in ["B", "KB", "MB", "GB"] {
        if size < 1024.0 {
            return format!("{size:.1} {unit}");
        }
        size /= 1024.0;
    }
    format!("{size:.1} TB")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_are_human_readable() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(512), "512.0 B");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(5 * 1024 * 1024 * 1024 * 1024), "5.0 TB");
    }

    #[test]
    fn history_evicts_oldest() {
        let mut h = CaptureHistory::with_capacity(2);
        for i in 0..3 {
            let mut item = crate::capture::tests_support::item(&format!("i{i}"), "t");
            item.title = format!("{i}");
            h.push(CaptureTask::new(item, PathBuf::from("x"), 1, 3));
        }
        assert_eq!(h.len(), 2);
        let ids: Vec<String> = h.iter().map(|t| t.item.item_id.clone()).collect();
        assert_eq!(ids, vec!["i1", "i2"]);
    }

    #[test]
    fn attempts_are_clamped() {
        let item = crate::capture::tests_support::item("a", "t");
        let t = CaptureTask::new(item, PathBuf::from("x"), 9, 3);
        assert_eq!(t.attempt_count, 3);
        assert!(!t.has_attempts_left());
    }
}
