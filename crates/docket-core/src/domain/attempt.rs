//! Attempt history: one entry per provider invocation.
//!
//! Records which consumer ran it, when, what it cost and how it ended, so
//! "why did this task fail / cost that much" can be answered later.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::errors::TaskError;
use super::ids::AttemptId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    /// Failed with a retryable error; another attempt follows.
    Retrying { message: String },
    /// Failed and ended the task.
    Failed { error: TaskError },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt_id: AttemptId,

    /// 1-indexed attempt number within the task.
    pub number: u32,

    /// Queue consumer that ran the attempt.
    pub consumer: String,

    pub provider: String,

    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,

    /// Cost charged during this attempt only.
    pub cost: Decimal,

    #[serde(flatten)]
    pub outcome: AttemptOutcome,
}
