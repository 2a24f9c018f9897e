use std::time::Duration;

use thiserror::Error;

/// Failures from driving the external image tool.
#[derive(Debug, Error)]
pub enum ToolError {
    /// The tool binary could not be found on PATH. Operator action required.
    #[error("tool binary not found: {0}")]
    Absent(String),

    #[error("tool exited with code {exit_code}: {stderr_tail}")]
    Failure { exit_code: i32, stderr_tail: String },

    /// No progress line and no exit within the stall window.
    #[error("tool produced no progress for {elapsed:?}")]
    Timeout { elapsed: Duration },

    #[error("tool invocation cancelled")]
    Cancelled,

    #[error("failed to drive tool process: {0}")]
    Io(#[from] std::io::Error),
}

/// Rejections surfaced to callers at submission time. Never retried
/// internally.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("slide not found: {0}")]
    NotFound(String),

    #[error("unsupported slide format: {0}")]
    UnsupportedFormat(String),

    #[error("a job for {0} is already queued or active")]
    InProgress(String),

    #[error("artifact set for {0} already exists")]
    ArtifactExists(String),

    #[error("no artifact set exists for {0}")]
    ArtifactMissing(String),

    #[error("pending queue is full ({0} jobs)")]
    QueueFull(usize),

    #[error("scheduler is not running")]
    Unavailable,
}

/// Errors that terminate a single job. They never escape the job boundary:
/// the pipeline maps them to a terminal phase and the scheduler returns the
/// worker slot.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("failed to set up staging directory: {0}")]
    StagingSetup(#[source] anyhow::Error),

    #[error("failed to write metadata sidecars: {0}")]
    Metadata(#[source] anyhow::Error),

    #[error("failed to promote artifact set: {0}")]
    Promotion(#[source] anyhow::Error),

    #[error("job cancelled")]
    Cancelled,
}

impl PipelineError {
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            PipelineError::Cancelled | PipelineError::Tool(ToolError::Cancelled)
        )
    }
}
