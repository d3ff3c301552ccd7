//! File-backed TaskStore.
//!
//! Every accepted insert (the full record) or mutation (just the change)
//! goes to a JSON-lines journal before it becomes visible. `open` replays the
//! journal and rewrites it down to one record per task.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::domain::{OwnerId, TaskId, TaskMutation, TaskRecord, TaskStatus};
use crate::error::{JournalError, StoreError};
use crate::impls::inmem_store::{InMemoryTaskStore, StoreRecord};
use crate::impls::journal::Journal;
use crate::observability::TaskCounts;
use crate::ports::{Clock, TaskStore};

pub struct FileTaskStore {
    inner: InMemoryTaskStore,
}

impl FileTaskStore {
    pub async fn open(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self, JournalError> {
        let (journal, entries) = Journal::<StoreRecord>::open(path).await?;
        info!(
            path = %journal.path().display(),
            entries = entries.len(),
            "task store journal replayed"
        );
        let inner = InMemoryTaskStore::restore(clock, entries, Some(journal));
        inner.compact_journal().await?;
        Ok(Self { inner })
    }
}

#[async_trait]
impl TaskStore for FileTaskStore {
    async fn insert(&self, record: TaskRecord) -> Result<(), StoreError> {
        self.inner.insert(record).await
    }

    async fn get(&self, task_id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        self.inner.get(task_id).await
    }

    async fn apply(
        &self,
        task_id: TaskId,
        mutation: TaskMutation,
    ) -> Result<TaskRecord, StoreError> {
        self.inner.apply(task_id, mutation).await
    }

    async fn list_by_owner(&self, owner: &OwnerId) -> Result<Vec<TaskRecord>, StoreError> {
        self.inner.list_by_owner(owner).await
    }

    async fn list_by_status(&self, status: TaskStatus) -> Result<Vec<TaskRecord>, StoreError> {
        self.inner.list_by_status(status).await
    }

    async fn counts(&self) -> Result<TaskCounts, StoreError> {
        self.inner.counts().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::payload::DocumentParse;
    use crate::domain::{ErrorKind, TaskError, TaskPayload};
    use crate::ports::SystemClock;
    use rust_decimal_macros::dec;
    use ulid::Ulid;

    fn record() -> TaskRecord {
        TaskRecord::new(
            TaskId::from_ulid(Ulid::new()),
            OwnerId::new("u1"),
            TaskPayload::DocumentParse(DocumentParse {
                document_id: "doc-1".into(),
                file_name: "manual.pdf".into(),
                content: "quality manual".into(),
            }),
            dec!(5),
            chrono::Utc::now(),
        )
    }

    #[tokio::test]
    async fn mutations_replay_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.jsonl");
        let r = record();
        let id = r.task_id;

        {
            let store = FileTaskStore::open(&path, Arc::new(SystemClock)).await.unwrap();
            store.insert(r).await.unwrap();
            store
                .apply(
                    id,
                    TaskMutation::Fail(TaskError::new(ErrorKind::QueueUnavailable, "down")),
                )
                .await
                .unwrap();
        }

        let store = FileTaskStore::open(&path, Arc::new(SystemClock)).await.unwrap();
        let back = store.get(id).await.unwrap().unwrap();
        assert_eq!(back.status, TaskStatus::Failed);
        assert_eq!(back.error.unwrap().kind, ErrorKind::QueueUnavailable);
        assert_eq!(store.counts().await.unwrap().total(), 1);
    }

    #[tokio::test]
    async fn reopen_compacts_to_one_record_per_task() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.jsonl");
        let kept = record();
        let kept_id = kept.task_id;
        let other = record();

        {
            let store = FileTaskStore::open(&path, Arc::new(SystemClock)).await.unwrap();
            store.insert(kept).await.unwrap();
            store.insert(other).await.unwrap();
            for _ in 0..6 {
                store
                    .apply(kept_id, TaskMutation::RequestCancel)
                    .await
                    .unwrap();
            }
        }
        let lines = |p: &Path| std::fs::read_to_string(p).unwrap().lines().count();
        assert_eq!(lines(path.as_path()), 8);

        let store = FileTaskStore::open(&path, Arc::new(SystemClock)).await.unwrap();
        assert_eq!(lines(path.as_path()), 2);
        assert!(store.get(kept_id).await.unwrap().unwrap().cancel_requested);

        // 圧縮後も追記は同じファイルに入る
        store
            .apply(kept_id, TaskMutation::Fail(TaskError::new(ErrorKind::QueueUnavailable, "down")))
            .await
            .unwrap();
        drop(store);
        let store = FileTaskStore::open(&path, Arc::new(SystemClock)).await.unwrap();
        assert_eq!(
            store.get(kept_id).await.unwrap().unwrap().status,
            TaskStatus::Failed
        );
        assert_eq!(lines(path.as_path()), 2);
    }

    #[tokio::test]
    async fn payload_is_journaled_once_per_task() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.jsonl");
        let content = "x".repeat(256 * 1024);
        let mut r = record();
        r.payload = TaskPayload::DocumentParse(DocumentParse {
            document_id: "doc-big".into(),
            file_name: "big.pdf".into(),
            content: content.clone(),
        });
        let id = r.task_id;

        let store = FileTaskStore::open(&path, Arc::new(SystemClock)).await.unwrap();
        store.insert(r).await.unwrap();
        for _ in 0..5 {
            store.apply(id, TaskMutation::RequestCancel).await.unwrap();
        }
        store
            .apply(
                id,
                TaskMutation::Fail(TaskError::new(ErrorKind::QueueUnavailable, "down")),
            )
            .await
            .unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.matches(content.as_str()).count(), 1);
        assert!(text.len() < content.len() * 2);
    }
}
