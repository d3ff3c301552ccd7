//! Cancel - 協調的キャンセルの受付
//!
//! フラグを立てるだけで、ワーカーが気付くのを待たない。
//! ワーカーは claim 直後と各 progress 境界でこのフラグを見る。

use std::sync::Arc;

use tracing::info;

use crate::domain::{OwnerId, TaskId, TaskMutation, TaskRecord, TransitionError};
use crate::error::{ControlError, StoreError};
use crate::ports::TaskStore;

pub struct TaskCanceller {
    store: Arc<dyn TaskStore>,
}

impl TaskCanceller {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    /// Request cancellation of `task_id` on behalf of `caller`.
    ///
    /// Only the owner may cancel. A task that already finished is returned
    /// as is.
    pub async fn cancel(
        &self,
        task_id: TaskId,
        caller: &OwnerId,
    ) -> Result<TaskRecord, ControlError> {
        let record = self
            .store
            .get(task_id)
            .await?
            .ok_or(ControlError::NotFound(task_id))?;
        if &record.owner != caller {
            return Err(ControlError::Forbidden {
                task_id,
                caller: caller.clone(),
            });
        }
        if record.status.is_terminal() || record.cancel_requested {
            return Ok(record);
        }

        match self.store.apply(task_id, TaskMutation::RequestCancel).await {
            Ok(record) => {
                info!(task_id = %task_id, status = %record.status, "cancel requested");
                Ok(record)
            }
            // get と apply の間に終わった
            Err(StoreError::Transition(TransitionError::AlreadyTerminal { .. })) => self
                .store
                .get(task_id)
                .await?
                .ok_or(ControlError::NotFound(task_id)),
            Err(e) => Err(e.into()),
        }
    }
}
