//! Error types for the reconciliation engine.
//!
//! None of these are fatal to the live display: callers log them and fall
//! back to generic geometry.

use thiserror::Error;

/// A single agent record that cannot be applied this frame.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RecordError {
    #[error("fiber agent {instance_id} has {len} point values, not a multiple of 3")]
    FiberPointsNotTriples { instance_id: i32, len: usize },

    #[error("fiber agent {instance_id} has {count} points, at least 2 are required")]
    FiberTooShort { instance_id: i32, count: usize },
}

/// Failure to fetch or decode a named geometry asset.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AssetError {
    #[error("asset '{0}' not found")]
    NotFound(String),

    #[error("failed to read asset '{name}': {reason}")]
    Io { name: String, reason: String },

    #[error("failed to parse asset '{name}': {reason}")]
    Parse { name: String, reason: String },

    #[error("unsupported asset format for '{0}'")]
    UnsupportedFormat(String),

    #[error("asset worker for '{0}' disconnected")]
    WorkerGone(String),
}

/// Violations of pass ordering or buffer lifetime in the render pipeline.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PipelineError {
    #[error("pass '{pass}' reads and writes target {target:?} in the same invocation")]
    ReadWriteHazard { pass: &'static str, target: crate::gpu::pass_plan::Target },

    #[error("pass '{pass}' reads target {target:?} before any pass has written it")]
    ReadBeforeWrite { pass: &'static str, target: crate::gpu::pass_plan::Target },

    #[error("hit test at ({x}, {y}) is outside the {width}x{height} viewport")]
    OutOfBounds { x: u32, y: u32, width: u32, height: u32 },

    #[error("identity read-back failed: {0}")]
    Readback(String),
}

/// Invalid viewer configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
