//! Error types shared by the poller and the capture pipeline.
//!
//! Platform calls fail with [`PlatformError`]; captures fail with
//! [`CaptureError`]. Both collapse onto the coarse [`ErrorClass`] taxonomy that
//! drives retry and cooldown decisions.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound on the human readable message attached to a failed task.
pub const MAX_ERROR_MESSAGE_CHARS: usize = 500;

/// Coarse failure taxonomy used for propagation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    TransientNetwork,
    RateLimited,
    DiskExhausted,
    MissingTooling,
    ValidationFailure,
    Unknown,
}

impl ErrorClass {
    /// Whether a capture failing with this class may be attempted again.
    pub fn is_retryable(self) -> bool {
        !matches!(self, ErrorClass::DiskExhausted | ErrorClass::MissingTooling)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::TransientNetwork => "transient_network",
            ErrorClass::RateLimited => "rate_limited",
            ErrorClass::DiskExhausted => "disk_exhausted",
            ErrorClass::MissingTooling => "missing_tooling",
            ErrorClass::ValidationFailure => "validation_failure",
            ErrorClass::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by the authenticated platform client.
#[derive(Debug, Error)]
pub enum PlatformError {
    /// The platform asked us to slow down. Distinct from generic API errors so
    /// the poller can enter a cooldown window instead of retrying per call.
    #[error("rate limited by platform: {0}")]
    RateLimited(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("platform API error (status {status}): {message}")]
    Api { status: u16, message: String },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("malformed platform response: {0}")]
    Malformed(String),
}

impl PlatformError {
    pub fn class(&self) -> ErrorClass {
        match self {
            PlatformError::RateLimited(_) => ErrorClass::RateLimited,
            PlatformError::Network(_) => ErrorClass::TransientNetwork,
            PlatformError::Malformed(_) => ErrorClass::ValidationFailure,
            PlatformError::Api { .. } | PlatformError::NotFound(_) => ErrorClass::Unknown,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, PlatformError::RateLimited(_))
    }
}

impl From<reqwest::Error> for PlatformError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            PlatformError::Malformed(e.to_string())
        } else {
            PlatformError::Network(e.to_string())
        }
    }
}

/// Errors raised while capturing a single item.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("insufficient disk space: {0}")]
    DiskExhausted(String),
    #[error("capture tooling unavailable: {0}")]
    MissingTooling(String),
    /// The item had no usable media URL yet. Retryable: a broadcast may
    /// publish its playback URL a few seconds after going live.
    #[error("media URL not available")]
    UrlUnavailable,
    #[error("transfer failed: {0}")]
    Transfer(String),
    #[error("transfer timed out: {0}")]
    Timeout(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("interrupted by shutdown")]
    Interrupted,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CaptureError {
    pub fn class(&self) -> ErrorClass {
        match self {
            CaptureError::DiskExhausted(_) => ErrorClass::DiskExhausted,
            CaptureError::MissingTooling(_) => ErrorClass::MissingTooling,
            CaptureError::UrlUnavailable
            | CaptureError::Timeout(_)
            | CaptureError::Network(_) => ErrorClass::TransientNetwork,
            CaptureError::Validation(_) => ErrorClass::ValidationFailure,
            CaptureError::Transfer(_) | CaptureError::Interrupted | CaptureError::Io(_) => {
                ErrorClass::Unknown
            }
        }
    }

    /// Bounded message for attaching to a task.
    pub fn bounded_message(&self) -> String {
        truncate_message(&self.to_string())
    }
}

impl From<reqwest::Error> for CaptureError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            CaptureError::Timeout(e.to_string())
        } else {
            CaptureError::Network(e.to_string())
        }
    }
}

/// Keep at most [`MAX_ERROR_MESSAGE_CHARS`] characters (not bytes).
pub fn truncate_message(s: &str) -> String {
    s.chars().take(MAX_ERROR_MESSAGE_CHARS).collect()
}
