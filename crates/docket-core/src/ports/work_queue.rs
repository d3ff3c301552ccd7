//! WorkQueue port - 追記専用ログ + consumer group
//!
//! # 配送契約
//! - 追記されたエントリは group 内のちょうど 1 consumer に配送される
//! - 配送済み・未 ack のエントリは claim した consumer の pending list に残る
//! - claim timeout を過ぎても ack/touch されなければ、別 consumer が reclaim できる
//! - ack は pending list からエントリを永久に取り除く（冪等）
//!
//! Group は最初の claim で自動作成され、ストリームの先頭から読み始めます。

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{EntryId, QueueRef, TaskId, TaskKind, TaskPayload};
use crate::error::QueueError;

/// One appended entry: the task id plus the payload the worker needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub entry_id: EntryId,
    pub task_id: TaskId,
    pub kind: TaskKind,
    pub payload: TaskPayload,
    pub appended_at: DateTime<Utc>,
}

/// The exclusive, time-bounded right to process one entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Claim {
    pub stream: String,
    pub group: String,
    pub consumer: String,
    pub entry: QueueEntry,
    /// 1 on first delivery, incremented on every reclaim.
    pub delivery_count: u32,
}

impl Claim {
    pub fn task_id(&self) -> TaskId {
        self.entry.task_id
    }

    pub fn queue_ref(&self) -> QueueRef {
        QueueRef {
            stream: self.stream.clone(),
            entry_id: self.entry.entry_id,
        }
    }

    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }
}

/// A delivered but unacknowledged entry, as seen by operators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub entry_id: EntryId,
    pub task_id: TaskId,
    pub consumer: String,
    pub delivery_count: u32,
    pub idle: Duration,
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn append(
        &self,
        stream: &str,
        task_id: TaskId,
        payload: &TaskPayload,
    ) -> Result<EntryId, QueueError>;

    /// Claim the next entry for `consumer` from any of `streams`.
    ///
    /// Expired pending entries are reclaimed before new entries are handed
    /// out. Waits up to `block` and returns `None` if nothing arrived.
    async fn claim(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        block: Duration,
    ) -> Result<Option<Claim>, QueueError>;

    /// Refresh the claim so it does not expire. `ClaimLost` if another
    /// consumer has taken the entry over (or it was acknowledged).
    async fn touch(&self, claim: &Claim) -> Result<(), QueueError>;

    async fn ack(&self, claim: &Claim) -> Result<(), QueueError>;

    async fn pending(&self, stream: &str, group: &str) -> Result<Vec<PendingEntry>, QueueError>;

    /// Entries still retained in the stream (not yet acknowledged by every group).
    async fn len(&self, stream: &str) -> Result<usize, QueueError>;
}
