use std::process::ExitStatus;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by the scope store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScopeError {
    #[error("invalid network: {input}")]
    InvalidNetwork { input: String },

    #[error("target {network} already exists")]
    AlreadyExists { network: String },

    #[error("scope entry {id} not found")]
    NotFound { id: u64 },
}

/// Rejections raised by the re-scan task queue.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("invalid target: {input}")]
    InvalidNetwork { input: String },

    #[error("{target} is not in scope")]
    OutOfScope { target: String },

    #[error("{target} already has an incomplete rescan task (#{task_id})")]
    AlreadyQueued { target: String, task_id: u64 },

    #[error("rescan task {id} not found")]
    NotFound { id: u64 },

    #[error("rescan task {id} is already complete")]
    AlreadyComplete { id: u64 },

    #[error("rescan task {id} has not been dispatched")]
    NotDispatched { id: u64 },

    #[error("scan id {scan_id} already belongs to task {owner}")]
    DuplicateScanId { scan_id: String, owner: u64 },

    #[error("scan id must not be empty")]
    InvalidScanId,
}

/// Why a capture failed. Only ever logged; callers see a bool.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} did not exit within {}s", .after.as_secs())]
    Timeout { program: String, after: Duration },

    #[error("{program} exited with {status}")]
    NonZeroExit { program: String, status: ExitStatus },

    #[error("no virtual display available")]
    DisplayUnavailable,

    #[error("i/o error while driving {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl CaptureError {
    /// Short tag used in log lines
    pub fn kind(&self) -> &'static str {
        match self {
            CaptureError::Spawn { .. } => "spawn_failure",
            CaptureError::Timeout { .. } => "timeout",
            CaptureError::NonZeroExit { .. } => "non_zero_exit",
            CaptureError::DisplayUnavailable => "display_unavailable",
            CaptureError::Io { .. } => "io",
        }
    }
}

/// Malformed line in a services file.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("line {line}: {reason}: {content:?}")]
pub struct CatalogError {
    pub line: usize,
    pub content: String,
    pub reason: &'static str,
}
