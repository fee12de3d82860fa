//! Error taxonomy for the detection pipeline.
//!
//! Each pipeline stage has its own error type so the task runner can tell
//! fatal conditions (stream exhausted, model not loadable) from per-frame
//! noise (a single inference fault) without string matching.

use std::time::Duration;

use thiserror::Error;

/// Video ingestion failures.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("failed to connect to {uri}: {reason}")]
    Connect { uri: String, reason: String },

    #[error("read from {uri} failed: {reason}")]
    Read { uri: String, reason: String },

    #[error("connect to {uri} timed out after {timeout:?}")]
    Timeout { uri: String, timeout: Duration },

    /// Terminal: reconnect budget exhausted.
    #[error("stream {uri} failed after {attempts} reconnect attempts")]
    Failed { uri: String, attempts: u32 },

    #[error("stream closed")]
    Closed,

    #[error("unsupported video source: {0}")]
    Unsupported(String),
}

impl StreamError {
    /// True when the stream will never yield frames again.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StreamError::Failed { .. } | StreamError::Closed | StreamError::Unsupported(_)
        )
    }
}

/// Backend load failures. Never retried.
#[derive(Debug, Error)]
pub enum ModelLoadError {
    #[error("model artifact not found: {0}")]
    MissingArtifact(String),

    #[error("model artifact {path} is corrupt: {reason}")]
    Corrupt { path: String, reason: String },

    #[error("no inference backend for hardware kind '{0}'")]
    UnsupportedHardware(String),

    #[error("{what} requires the {feature} feature")]
    FeatureDisabled {
        what: String,
        feature: &'static str,
    },

    #[error("backend worker failed to start: {0}")]
    Worker(String),
}

/// Per-frame inference failures. Skippable unless they repeat.
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("inference runtime fault: {0}")]
    Runtime(String),

    #[error("inference exceeded {0:?}")]
    Timeout(Duration),

    #[error("backend has been unloaded")]
    Unloaded,

    #[error("invalid input frame: {0}")]
    BadInput(String),
}

/// Notification delivery failures. Retried per channel, then dropped.
#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("{channel}: transport error: {reason}")]
    Transport { channel: String, reason: String },

    #[error("{channel}: rejected with status {status}")]
    Rejected { channel: String, status: u16 },

    #[error("{channel}: timed out after {timeout:?}")]
    Timeout { channel: String, timeout: Duration },

    #[error("{channel}: invalid configuration: {reason}")]
    Config { channel: String, reason: String },

    #[error("{channel}: requires the {feature} feature")]
    FeatureDisabled {
        channel: String,
        feature: &'static str,
    },
}

/// Errors surfaced by lifecycle operations on the task manager.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown task '{0}'")]
    UnknownTask(String),

    #[error("task '{0}' is disabled")]
    Disabled(String),

    #[error("task '{0}' is not running")]
    NotRunning(String),

    #[error("task '{0}' is still stopping")]
    Stopping(String),

    #[error("task '{task}' references unknown backend '{backend}'")]
    UnknownBackend { task: String, backend: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to start worker for task '{task}': {reason}")]
    Spawn { task: String, reason: String },
}
