//! Errors - タスクに記録されるエラー分類とドメインエラー
//!
//! `ErrorKind` is what clients see on a failed task. It is deliberately
//! coarse: "too expensive" and "broken" must be distinguishable, the rest is
//! in the message.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::TaskId;
use super::state::TaskStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Payload rejected before anything was queued.
    Validation,
    /// Transient provider errors exhausted the retry budget.
    ProviderUnavailable,
    /// The provider rejected the request permanently.
    InvalidRequest,
    /// The task would have spent more than its ceiling.
    CostLimitExceeded,
    /// The work queue refused the entry at enqueue time.
    QueueUnavailable,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::ProviderUnavailable => "provider-unavailable",
            ErrorKind::InvalidRequest => "invalid-request",
            ErrorKind::CostLimitExceeded => "cost-limit-exceeded",
            ErrorKind::QueueUnavailable => "queue-unavailable",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal failure recorded on a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
}

impl TaskError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Payload validation failures, surfaced synchronously at enqueue time.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("payload does not match kind {kind}: {reason}")]
    Malformed { kind: String, reason: String },

    #[error("field `{0}` must not be empty")]
    EmptyField(&'static str),

    #[error("content is {size} bytes, limit is {limit}")]
    ContentTooLarge { size: usize, limit: usize },

    #[error("unsupported document type `{0}`")]
    UnsupportedDocumentType(String),
}

/// Rejected state-machine transition on a task record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("task {task_id} is already {status}")]
    AlreadyTerminal { task_id: TaskId, status: TaskStatus },

    #[error("task {task_id} cannot move from {from} to {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("task {task_id} is {status}, progress only applies while processing")]
    NotProcessing { task_id: TaskId, status: TaskStatus },

    #[error("task {task_id} is already processed by another queue entry")]
    DuplicateDelivery { task_id: TaskId },

    #[error("task {task_id} cost {attempted} would exceed ceiling {ceiling}")]
    CostCeiling {
        task_id: TaskId,
        attempted: Decimal,
        ceiling: Decimal,
    },

    #[error("task {task_id} accrued cost cannot decrease ({current} -> {attempted})")]
    CostDecrease {
        task_id: TaskId,
        current: Decimal,
        attempted: Decimal,
    },
}
