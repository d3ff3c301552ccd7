//! Status - タスク照会
//!
//! Task Store のスナップショットに「詰まっているか」を添えて返す。
//! stuck は表示用のフラグで、タスクを失敗させることはない。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::{OwnerId, TaskId, TaskRecord, TaskStatus};
use crate::error::{ControlError, StoreError};
use crate::observability::TaskCounts;
use crate::ports::{Clock, TaskStore};

/// A task snapshot as returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskView {
    #[serde(flatten)]
    pub record: TaskRecord,
    /// Processing with no progress for longer than the stuck threshold.
    pub stuck: bool,
}

/// Processing, and silent for longer than `threshold`.
pub fn is_stuck(record: &TaskRecord, now: DateTime<Utc>, threshold: Duration) -> bool {
    if record.status != TaskStatus::Processing {
        return false;
    }
    let last_sign_of_life = record
        .last_progress_at
        .or(record.started_at)
        .unwrap_or(record.created_at);
    let threshold = chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::MAX);
    now.signed_duration_since(last_sign_of_life) > threshold
}

pub struct StatusQuery {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    stuck_threshold: Duration,
}

impl StatusQuery {
    pub fn new(store: Arc<dyn TaskStore>, clock: Arc<dyn Clock>, stuck_threshold: Duration) -> Self {
        Self {
            store,
            clock,
            stuck_threshold,
        }
    }

    pub async fn status(&self, task_id: TaskId) -> Result<TaskView, ControlError> {
        let record = self
            .store
            .get(task_id)
            .await?
            .ok_or(ControlError::NotFound(task_id))?;
        Ok(self.view(record))
    }

    pub async fn list_by_owner(&self, owner: &OwnerId) -> Result<Vec<TaskView>, StoreError> {
        let records = self.store.list_by_owner(owner).await?;
        Ok(records.into_iter().map(|r| self.view(r)).collect())
    }

    /// Processing tasks that look stuck, oldest first.
    pub async fn stuck(&self) -> Result<Vec<TaskView>, StoreError> {
        let now = self.clock.now();
        let records = self.store.list_by_status(TaskStatus::Processing).await?;
        Ok(records
            .into_iter()
            .filter(|r| is_stuck(r, now, self.stuck_threshold))
            .map(|record| TaskView {
                record,
                stuck: true,
            })
            .collect())
    }

    pub async fn counts(&self) -> Result<TaskCounts, StoreError> {
        self.store.counts().await
    }

    fn view(&self, record: TaskRecord) -> TaskView {
        let stuck = is_stuck(&record, self.clock.now(), self.stuck_threshold);
        TaskView { record, stuck }
    }
}
