//! Error types shared across the propagation core.

use crate::task::types::{SeqId, TaskGroupId};

/// Errors raised by a task log.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// The journal refused the write. The task was not appended and the producer
    /// must treat the change as not propagated.
    #[error("task log '{log}' rejected append: {message}")]
    AppendFailed { log: String, message: String },

    /// `ack`/`fail`/`mark_dead` was called for a task that is not at the
    /// destination's cursor. Signals a programming error in the caller.
    #[error(
        "out-of-order status update on log '{log}' for destination '{destination}': cursor is at {expected}, got {got}"
    )]
    OutOfOrder {
        log: String,
        destination: String,
        expected: SeqId,
        got: SeqId,
    },

    #[error("destination '{destination}' is not subscribed to log '{log}'")]
    UnknownDestination { log: String, destination: String },

    #[error("no task with seq {seq} in log '{log}'")]
    TaskNotFound { log: String, seq: SeqId },

    #[error("journal error on log '{log}': {message}")]
    Journal { log: String, message: String },
}

/// Errors surfaced by the sync service to producers and administrators.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Log(#[from] LogError),

    #[error("unknown task log '{0}'")]
    UnknownLog(String),

    #[error("unknown task group {0}")]
    UnknownGroup(TaskGroupId),

    #[error("unknown destination '{0}'")]
    UnknownDestination(String),

    #[error("destination '{0}' already exists")]
    DuplicateDestination(String),
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;
