// src/lib.rs
// Public library surface for the binary and the integration tests.

pub mod api;
pub mod capture;
pub mod config;
pub mod error;
pub mod events;
pub mod item;
pub mod ledger;
pub mod metrics;
pub mod monitor;
pub mod notify;
pub mod persist;
pub mod platform;
pub mod scheduler;
pub mod sinks;
pub mod stats;
pub mod target;

// ---- Re-exports for stable public API ----
pub use crate::api::router;
pub use crate::capture::{Admission, CaptureConfig, CaptureManager};
pub use crate::error::{CaptureError, ErrorClass, PlatformError};
pub use crate::events::{EventBus, PipelineEvent};
pub use crate::item::{EphemeralItem, ItemKind, MediaType};
pub use crate::ledger::DedupLedger;
pub use crate::monitor::{MonitorConfig, Poller, TickOutcome};
pub use crate::notify::NotifierMux;
pub use crate::scheduler::{Pipeline, PipelineParts};
pub use crate::target::{Priority, Target, TargetRegistry};
