//! Error types for the orchestration core.

use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{EntryId, OwnerId, TaskId, TaskKind, TransitionError, ValidationError};

/// Append-only journal failures (file-backed store and queue).
#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("journal encode error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("journal {path} is corrupt at line {line}: {source}")]
    Corrupt {
        path: String,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("journal {path} could not roll back a failed append; reopen it")]
    Poisoned { path: String },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error("task {0} already exists")]
    AlreadyExists(TaskId),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("task store unavailable: {0}")]
    Journal(#[from] JournalError),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("{consumer} no longer holds the claim on {entry_id} in {stream}")]
    ClaimLost {
        stream: String,
        entry_id: EntryId,
        consumer: String,
    },

    #[error("work queue unavailable: {0}")]
    Journal(#[from] JournalError),

    #[error("work queue unavailable: {0}")]
    Unavailable(String),
}

/// Why a worker stopped a provider call at a progress boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Halt {
    #[error("cancellation requested")]
    Cancelled,

    #[error("cost {attempted} would exceed ceiling {ceiling}")]
    CostLimitExceeded { attempted: Decimal, ceiling: Decimal },

    #[error("claim lost to another consumer")]
    ClaimLost,

    #[error("task store write failed: {0}")]
    Store(String),
}

/// Coarse classes of provider failure; `RetryPolicy` decides on these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorClass {
    Transient,
    Timeout,
    Permanent,
    CostLimit,
    Halted,
    Unavailable,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("transient provider error: {0}")]
    Transient(String),

    #[error("provider rejected the request: {0}")]
    Permanent(String),

    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),

    #[error("task attempt exceeded {0:?}")]
    TaskTimeout(Duration),

    #[error("input of {size} units exceeds provider limit {limit}")]
    InputTooLarge { size: u64, limit: u64 },

    #[error("cost {attempted} would exceed ceiling {ceiling}")]
    CostLimitExceeded { attempted: Decimal, ceiling: Decimal },

    #[error("execution halted: {0}")]
    Halted(Halt),

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

impl From<Halt> for ProviderError {
    fn from(halt: Halt) -> Self {
        match halt {
            Halt::CostLimitExceeded { attempted, ceiling } => {
                ProviderError::CostLimitExceeded { attempted, ceiling }
            }
            other => ProviderError::Halted(other),
        }
    }
}

impl ProviderError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ProviderError::Transient(_) => ErrorClass::Transient,
            ProviderError::Timeout(_) | ProviderError::TaskTimeout(_) => ErrorClass::Timeout,
            ProviderError::Permanent(_) | ProviderError::InputTooLarge { .. } => {
                ErrorClass::Permanent
            }
            ProviderError::CostLimitExceeded { .. } => ErrorClass::CostLimit,
            ProviderError::Halted(_) => ErrorClass::Halted,
            ProviderError::Gateway(_) => ErrorClass::Unavailable,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("provider `{0}` is already registered")]
    DuplicateProvider(String),

    #[error("provider `{0}` is not registered")]
    UnknownProvider(String),

    #[error("no provider enabled for {0}")]
    NoProviderEnabled(TaskKind),

    #[error("provider `{provider}` does not support {kind}")]
    KindNotSupported { provider: String, kind: TaskKind },
}

#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("invalid payload: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("task {task_id} recorded but could not be queued: {source}")]
    Queue {
        task_id: TaskId,
        #[source]
        source: QueueError,
    },
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error("{caller} does not own task {task_id}")]
    Forbidden { task_id: TaskId, caller: OwnerId },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration error: {0}")]
    Figment(#[from] figment::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("missing component: {0}")]
    MissingComponent(&'static str),

    #[error("no usable provider for task kinds: {0:?}")]
    MissingProviders(Vec<TaskKind>),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("relay task aborted: {0}")]
    Aborted(String),
}

/// The client side of a relay went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("client connection closed")]
pub struct ConnectionClosed;
