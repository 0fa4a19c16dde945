//! reqmux error types.
//!
//! Two layers, matching the two propagation scopes:
//!
//! - `RequestError` is written into one request's completion slot and only
//!   ever seen by that request's caller.
//! - `MuxError` belongs to the worker loop or the processor itself. A
//!   `MuxError` out of `perform()` is loop-fatal.

use std::fmt;

use crate::context::CancelCause;

/// Failure reported by the native transport for one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    /// Transport-specific code (curl error code, errno, ...).
    pub code: i32,
    pub message: String,
}

impl TransportError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transport error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for TransportError {}

/// Per-request failure delivered through a completion slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// The submission queue is closed; the request was never queued.
    QueueClosed,
    /// The request's execution context was cancelled before completion.
    Cancelled(CancelCause),
    /// The transport failed this transfer.
    Transport(TransportError),
    /// The worker loop died before the request could complete.
    LoopTerminated(String),
}

impl RequestError {
    /// True for the cancellation flavor, false for every real failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, RequestError::Cancelled(_))
    }
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestError::QueueClosed => write!(f, "submission queue closed"),
            RequestError::Cancelled(cause) => write!(f, "request cancelled: {}", cause),
            RequestError::Transport(e) => write!(f, "{}", e),
            RequestError::LoopTerminated(msg) => write!(f, "worker loop terminated: {}", msg),
        }
    }
}

impl std::error::Error for RequestError {}

impl From<TransportError> for RequestError {
    fn from(e: TransportError) -> Self {
        RequestError::Transport(e)
    }
}

/// Worker-loop and processor level errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxError {
    /// The multi-handle factory failed on the worker thread.
    MultiInit(String),
    /// `perform()` failed in a way not attributable to one request.
    Perform(String),
    /// The wakeup signal could not be raised or waited on (errno).
    Wakeup(i32),
    /// The worker thread could not be spawned.
    Spawn(String),
    /// The worker loop panicked.
    WorkerPanicked(String),
    /// Invalid configuration.
    Config(&'static str),
    /// OS error with errno.
    Os(i32),
}

impl fmt::Display for MuxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MuxError::MultiInit(msg) => write!(f, "multi-handle init failed: {}", msg),
            MuxError::Perform(msg) => write!(f, "perform failed: {}", msg),
            MuxError::Wakeup(e) => write!(f, "wakeup signal: errno {}", e),
            MuxError::Spawn(msg) => write!(f, "failed to spawn worker thread: {}", msg),
            MuxError::WorkerPanicked(msg) => write!(f, "worker loop panicked: {}", msg),
            MuxError::Config(msg) => write!(f, "invalid config: {}", msg),
            MuxError::Os(e) => write!(f, "OS error: errno {}", e),
        }
    }
}

impl std::error::Error for MuxError {}

pub type Result<T> = std::result::Result<T, MuxError>;
