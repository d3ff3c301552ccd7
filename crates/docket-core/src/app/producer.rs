//! TaskProducer - 受付（validate → store → queue）
//!
//! # 順序
//! 1. ペイロードを decode + validate（失敗したら何も書かない）
//! 2. Task Store に pending で記録
//! 3. Work Queue に追記して、エントリ参照をレコードに残す
//!
//! 3 が失敗したらタスクを queue-unavailable で failed にする。
//! その書き込みも失敗した場合は pending のまま残り、reaper が再投入する。

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::config::{CostConfig, QueueTopology};
use crate::domain::{
    ErrorKind, OwnerId, PayloadLimits, QueueRef, TaskError, TaskKind, TaskMutation, TaskPayload,
    TaskRecord,
};
use crate::error::EnqueueError;
use crate::ports::{Clock, IdGenerator, TaskStore, WorkQueue};

pub struct TaskProducer {
    store: Arc<dyn TaskStore>,
    queue: Arc<dyn WorkQueue>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    topology: QueueTopology,
    limits: PayloadLimits,
    cost: CostConfig,
}

impl TaskProducer {
    pub fn new(
        store: Arc<dyn TaskStore>,
        queue: Arc<dyn WorkQueue>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        topology: QueueTopology,
        limits: PayloadLimits,
        cost: CostConfig,
    ) -> Self {
        Self {
            store,
            queue,
            ids,
            clock,
            topology,
            limits,
            cost,
        }
    }

    /// Accept a raw JSON payload for `kind` on behalf of `owner`.
    pub async fn enqueue(
        &self,
        kind: TaskKind,
        owner: OwnerId,
        raw: serde_json::Value,
    ) -> Result<TaskRecord, EnqueueError> {
        let payload = TaskPayload::decode(kind, raw)?;
        self.submit(owner, payload).await
    }

    /// Accept an already typed payload.
    pub async fn submit(
        &self,
        owner: OwnerId,
        payload: TaskPayload,
    ) -> Result<TaskRecord, EnqueueError> {
        payload.validate(&self.limits)?;

        let kind = payload.kind();
        let task_id = self.ids.generate_task_id();
        let record = TaskRecord::new(
            task_id,
            owner,
            payload,
            self.cost.ceiling_for(kind),
            self.clock.now(),
        );
        self.store.insert(record.clone()).await?;

        let stream = self.topology.stream_for(kind);
        let entry_id = match self.queue.append(&stream, task_id, &record.payload).await {
            Ok(entry_id) => entry_id,
            Err(source) => {
                warn!(task_id = %task_id, stream = %stream, error = %source, "queue append failed");
                let failure = TaskError::new(ErrorKind::QueueUnavailable, source.to_string());
                if let Err(e) = self.store.apply(task_id, TaskMutation::Fail(failure)).await {
                    error!(task_id = %task_id, error = %e, "could not mark task failed, leaving it to the reaper");
                }
                return Err(EnqueueError::Queue { task_id, source });
            }
        };

        let attach = TaskMutation::AttachEntry(QueueRef {
            stream: stream.clone(),
            entry_id,
        });
        let record = match self.store.apply(task_id, attach).await {
            Ok(record) => record,
            Err(e) => {
                // エントリは載っているのでワーカーは処理できる
                warn!(task_id = %task_id, error = %e, "could not attach queue entry");
                record
            }
        };

        info!(task_id = %task_id, kind = %kind, stream = %stream, entry_id = %entry_id, "task enqueued");
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EntryId, TaskId, TaskStatus};
    use crate::error::QueueError;
    use crate::impls::{InMemoryTaskStore, InMemoryWorkQueue};
    use crate::ports::{Claim, PendingEntry, SystemClock, UlidGenerator};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use std::time::Duration;

    struct DownQueue;

    #[async_trait]
    impl WorkQueue for DownQueue {
        async fn append(&self, _: &str, _: TaskId, _: &TaskPayload) -> Result<EntryId, QueueError> {
            Err(QueueError::Unavailable("connection refused".into()))
        }
        async fn claim(
            &self,
            _: &str,
            _: &str,
            _: &[String],
            _: Duration,
        ) -> Result<Option<Claim>, QueueError> {
            Ok(None)
        }
        async fn touch(&self, _: &Claim) -> Result<(), QueueError> {
            Ok(())
        }
        async fn ack(&self, _: &Claim) -> Result<(), QueueError> {
            Ok(())
        }
        async fn pending(&self, _: &str, _: &str) -> Result<Vec<PendingEntry>, QueueError> {
            Ok(Vec::new())
        }
        async fn len(&self, _: &str) -> Result<usize, QueueError> {
            Ok(0)
        }
    }

    fn producer(queue: Arc<dyn WorkQueue>) -> (TaskProducer, Arc<InMemoryTaskStore>) {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = Arc::new(InMemoryTaskStore::new(clock.clone()));
        let mut cost = CostConfig::default();
        cost.per_kind.insert(TaskKind::DocumentGenerate, dec!(2.50));
        let producer = TaskProducer::new(
            store.clone(),
            queue,
            Arc::new(UlidGenerator::new(SystemClock)),
            clock,
            QueueTopology::PerKind,
            PayloadLimits::default(),
            cost,
        );
        (producer, store)
    }

    fn generate() -> serde_json::Value {
        json!({"template_id": "iso-9001-manual", "customer_id": "cust-7"})
    }

    #[tokio::test]
    async fn enqueue_records_pending_task_and_appends_entry() {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let queue = Arc::new(InMemoryWorkQueue::new(Duration::from_secs(60), clock));
        let (producer, store) = producer(queue.clone());

        let record = producer
            .enqueue(TaskKind::DocumentGenerate, OwnerId::new("u1"), generate())
            .await
            .unwrap();

        assert_eq!(record.status, TaskStatus::Pending);
        assert_eq!(record.cost_ceiling, dec!(2.50));
        let queue_ref = record.queue_ref.clone().unwrap();
        assert_eq!(queue_ref.stream, "tasks:document-generate");
        assert_eq!(queue.len("tasks:document-generate").await.unwrap(), 1);
        assert_eq!(store.get(record.task_id).await.unwrap().unwrap(), record);
    }

    #[tokio::test]
    async fn invalid_payload_writes_nothing() {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let queue = Arc::new(InMemoryWorkQueue::new(Duration::from_secs(60), clock));
        let (producer, store) = producer(queue.clone());

        let err = producer
            .enqueue(
                TaskKind::DocumentGenerate,
                OwnerId::new("u1"),
                json!({"template_id": ""}),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, EnqueueError::Validation(_)));
        assert!(store.is_empty().await);
        assert_eq!(queue.len("tasks:document-generate").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn queue_failure_marks_task_failed() {
        let (producer, store) = producer(Arc::new(DownQueue));

        let err = producer
            .enqueue(TaskKind::DocumentGenerate, OwnerId::new("u1"), generate())
            .await
            .unwrap_err();

        let EnqueueError::Queue { task_id, .. } = err else {
            panic!("expected queue error, got {err:?}");
        };
        let record = store.get(task_id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.error.unwrap().kind, ErrorKind::QueueUnavailable);
    }
}
