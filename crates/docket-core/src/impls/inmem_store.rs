//! In-memory TaskStore.
//!
//! `apply` runs the mutation against a copy of the record and only swaps it
//! in when the state machine accepts it (and, for the file-backed store, the
//! mutation reached the journal). A rejected or unjournaled mutation leaves
//! the stored record untouched.
//!
//! The journal holds one full record per insert and then only the mutations,
//! each with the time it was applied, so replay reproduces the same record.
//! Once it grows well past the live record count it is rewritten to one
//! record per task.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::domain::{OwnerId, TaskId, TaskMutation, TaskRecord, TaskStatus};
use crate::error::{JournalError, StoreError};
use crate::impls::journal::Journal;
use crate::observability::TaskCounts;
use crate::ports::{Clock, TaskStore};

/// What the file-backed store journals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub(crate) enum StoreRecord {
    Insert {
        record: TaskRecord,
    },
    Apply {
        task_id: TaskId,
        at: DateTime<Utc>,
        mutation: TaskMutation,
    },
}

struct StoreState {
    records: HashMap<TaskId, TaskRecord>,
    journal: Option<Journal<StoreRecord>>,
}

impl StoreState {
    async fn persist(&mut self, entry: &StoreRecord) -> Result<(), StoreError> {
        if let Some(journal) = self.journal.as_mut() {
            journal.append(entry).await?;
        }
        Ok(())
    }

    /// Rewrite the journal to one record per task. Returns whether the
    /// journal was rewritten.
    async fn compact(&mut self) -> Result<bool, JournalError> {
        let Some(journal) = self.journal.as_mut() else {
            return Ok(false);
        };
        let before = journal.lines();
        if before <= self.records.len() {
            return Ok(false);
        }
        let mut snapshots: Vec<&TaskRecord> = self.records.values().collect();
        snapshots.sort_by_key(|r| (r.created_at, r.task_id));
        let entries: Vec<StoreRecord> = snapshots
            .into_iter()
            .map(|r| StoreRecord::Insert { record: r.clone() })
            .collect();
        journal.rewrite(&entries).await?;
        info!(before, after = self.records.len(), "task journal compacted");
        Ok(true)
    }

    async fn compact_if_grown(&mut self) {
        let live = self.records.len();
        if !self.journal.as_ref().is_some_and(|j| j.wants_compaction(live)) {
            return;
        }
        // 書き込み自体は journal に載っているので失敗しても次回に回す
        if let Err(e) = self.compact().await {
            warn!(error = %e, "task journal compaction failed");
        }
    }

    fn sorted(&self, mut keep: impl FnMut(&TaskRecord) -> bool) -> Vec<TaskRecord> {
        let mut out: Vec<TaskRecord> = self
            .records
            .values()
            .filter(|r| keep(r))
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.task_id.cmp(&b.task_id))
        });
        out
    }
}

pub struct InMemoryTaskStore {
    state: Mutex<StoreState>,
    clock: Arc<dyn Clock>,
}

impl InMemoryTaskStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::restore(clock, Vec::new(), None)
    }

    /// Build a store by replaying journal entries in order.
    pub(crate) fn restore(
        clock: Arc<dyn Clock>,
        entries: Vec<StoreRecord>,
        journal: Option<Journal<StoreRecord>>,
    ) -> Self {
        let mut records: HashMap<TaskId, TaskRecord> = HashMap::new();
        for entry in entries {
            match entry {
                StoreRecord::Insert { record } => {
                    records.insert(record.task_id, record);
                }
                StoreRecord::Apply {
                    task_id,
                    at,
                    mutation,
                } => {
                    let Some(record) = records.get_mut(&task_id) else {
                        warn!(task_id = %task_id, "journaled mutation for an unknown task");
                        continue;
                    };
                    let mut next = record.clone();
                    match next.apply(mutation, at) {
                        Ok(()) => *record = next,
                        Err(e) => {
                            warn!(task_id = %task_id, error = %e, "journaled mutation no longer applies")
                        }
                    }
                }
            }
        }
        Self {
            state: Mutex::new(StoreState { records, journal }),
            clock,
        }
    }

    /// Fold journaled mutations into one record per task.
    pub(crate) async fn compact_journal(&self) -> Result<bool, JournalError> {
        self.state.lock().await.compact().await
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, record: TaskRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.records.contains_key(&record.task_id) {
            return Err(StoreError::AlreadyExists(record.task_id));
        }
        if state.journal.is_some() {
            state
                .persist(&StoreRecord::Insert {
                    record: record.clone(),
                })
                .await?;
        }
        state.records.insert(record.task_id, record);
        state.compact_if_grown().await;
        Ok(())
    }

    async fn get(&self, task_id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.records.get(&task_id).cloned())
    }

    async fn apply(
        &self,
        task_id: TaskId,
        mutation: TaskMutation,
    ) -> Result<TaskRecord, StoreError> {
        let mut state = self.state.lock().await;
        let Some(current) = state.records.get(&task_id) else {
            return Err(StoreError::NotFound(task_id));
        };

        let name = mutation.name();
        let now = self.clock.now();
        let mut next = current.clone();
        let entry = state.journal.is_some().then(|| StoreRecord::Apply {
            task_id,
            at: now,
            mutation: mutation.clone(),
        });
        next.apply(mutation, now)?;

        if let Some(entry) = &entry {
            state.persist(entry).await?;
        }
        state.records.insert(task_id, next.clone());
        state.compact_if_grown().await;
        debug!(task_id = %task_id, mutation = name, status = %next.status, "task updated");
        Ok(next)
    }

    async fn list_by_owner(&self, owner: &OwnerId) -> Result<Vec<TaskRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.sorted(|r| &r.owner == owner))
    }

    async fn list_by_status(&self, status: TaskStatus) -> Result<Vec<TaskRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.sorted(|r| r.status == status))
    }

    async fn counts(&self) -> Result<TaskCounts, StoreError> {
        let state = self.state.lock().await;
        Ok(state.records.values().map(|r| r.status).collect())
    }
}
