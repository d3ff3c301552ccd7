//! File-backed WorkQueue.
//!
//! Appends and acknowledgments go to a JSON-lines journal before they take
//! effect. After a restart every unacknowledged entry is delivered again
//! (claims do not survive the process), and workers rely on the Task Store
//! status check to skip the ones that already finished.
//!
//! An acknowledgment from any group retires the entry on replay, so a
//! journal is meant to serve a single consumer group. `open` rewrites the
//! journal without the retired entries.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::domain::{EntryId, TaskId, TaskPayload};
use crate::error::{JournalError, QueueError};
use crate::impls::inmem_queue::{InMemoryWorkQueue, QueueRecord};
use crate::impls::journal::Journal;
use crate::ports::{Claim, Clock, PendingEntry, WorkQueue};

pub struct FileWorkQueue {
    inner: InMemoryWorkQueue,
}

impl FileWorkQueue {
    pub async fn open(
        path: impl AsRef<Path>,
        claim_timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, JournalError> {
        let (journal, records) = Journal::<QueueRecord>::open(path).await?;
        info!(
            path = %journal.path().display(),
            records = records.len(),
            "work queue journal replayed"
        );
        let inner = InMemoryWorkQueue::restore(claim_timeout, clock, records, Some(journal));
        inner.compact_journal().await?;
        Ok(Self { inner })
    }
}

#[async_trait]
impl WorkQueue for FileWorkQueue {
    async fn append(
        &self,
        stream: &str,
        task_id: TaskId,
        payload: &TaskPayload,
    ) -> Result<EntryId, QueueError> {
        self.inner.append(stream, task_id, payload).await
    }

    async fn claim(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        block: Duration,
    ) -> Result<Option<Claim>, QueueError> {
        self.inner.claim(group, consumer, streams, block).await
    }

    async fn touch(&self, claim: &Claim) -> Result<(), QueueError> {
        self.inner.touch(claim).await
    }

    async fn ack(&self, claim: &Claim) -> Result<(), QueueError> {
        self.inner.ack(claim).await
    }

    async fn pending(&self, stream: &str, group: &str) -> Result<Vec<PendingEntry>, QueueError> {
        self.inner.pending(stream, group).await
    }

    async fn len(&self, stream: &str) -> Result<usize, QueueError> {
        self.inner.len(stream).await
    }
}
