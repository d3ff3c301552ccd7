//! ReaperLoop - 定期的な見回り
//!
//! # 見るもの
//! 1. 孤児: pending のまま queue エントリを持たないタスク（producer の追記が
//!    失敗し、failed への書き込みも失敗した場合など）。猶予を過ぎたら再投入する。
//!    追記できたのに AttachEntry が失敗したエントリは覚えておき、次回は
//!    追記し直さず attach だけやり直す
//! 2. stuck: processing のまま進捗が止まっているタスク。warn を出すだけで、
//!    状態には触らない（持ち主のワーカーがまだ生きているかもしれない）
//!
//! claim timeout による再配送は Work Queue 側の仕事なので、ここではやらない。

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::app::status::is_stuck;
use crate::config::{QueueTopology, ReaperConfig};
use crate::domain::{QueueRef, TaskId, TaskMutation, TaskStatus};
use crate::error::StoreError;
use crate::ports::{Clock, TaskStore, WorkQueue};

/// What one sweep found.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub requeued: usize,
    pub stuck: usize,
}

pub struct ReaperLoop {
    store: Arc<dyn TaskStore>,
    queue: Arc<dyn WorkQueue>,
    clock: Arc<dyn Clock>,
    topology: QueueTopology,
    config: ReaperConfig,
    /// Entries appended for an orphan whose AttachEntry failed.
    unattached: Mutex<HashMap<TaskId, QueueRef>>,
}

/// Handle on a spawned reaper.
pub struct ReaperHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ReaperHandle {
    pub async fn shutdown_and_join(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.join.await {
            warn!(error = %e, "reaper task panicked");
        }
    }
}

impl ReaperLoop {
    pub fn new(
        store: Arc<dyn TaskStore>,
        queue: Arc<dyn WorkQueue>,
        clock: Arc<dyn Clock>,
        topology: QueueTopology,
        config: ReaperConfig,
    ) -> Self {
        Self {
            store,
            queue,
            clock,
            topology,
            config,
            unattached: Mutex::new(HashMap::new()),
        }
    }

    fn unattached(&self) -> std::sync::MutexGuard<'_, HashMap<TaskId, QueueRef>> {
        self.unattached.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn spawn(self) -> ReaperHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep().await {
                            warn!(error = %e, "reaper sweep failed");
                        }
                    }
                }
            }
            debug!("reaper stopped");
        });
        ReaperHandle { shutdown_tx, join }
    }

    /// Run one pass over pending and processing tasks.
    pub async fn sweep(&self) -> Result<SweepReport, StoreError> {
        let now = self.clock.now();
        let grace = chrono::Duration::from_std(self.config.orphan_grace)
            .unwrap_or(chrono::Duration::MAX);
        let mut report = SweepReport::default();
        let mut orphans = HashSet::new();

        for record in self.store.list_by_status(TaskStatus::Pending).await? {
            if record.queue_ref.is_some() || now.signed_duration_since(record.created_at) <= grace
            {
                continue;
            }
            orphans.insert(record.task_id);
            let remembered = self.unattached().get(&record.task_id).cloned();
            let queue_ref = match remembered {
                Some(queue_ref) => queue_ref,
                None => {
                    let stream = self.topology.stream_for(record.kind);
                    match self
                        .queue
                        .append(&stream, record.task_id, &record.payload)
                        .await
                    {
                        Ok(entry_id) => QueueRef { stream, entry_id },
                        Err(e) => {
                            warn!(task_id = %record.task_id, error = %e, "orphan requeue failed");
                            continue;
                        }
                    }
                }
            };
            match self
                .store
                .apply(record.task_id, TaskMutation::AttachEntry(queue_ref.clone()))
                .await
            {
                Ok(_) => {
                    info!(task_id = %record.task_id, stream = %queue_ref.stream, entry_id = %queue_ref.entry_id, "orphaned task requeued");
                    self.unattached().remove(&record.task_id);
                    report.requeued += 1;
                }
                // エントリは既にあるのでワーカーは拾える。次回は attach だけやり直す
                Err(e) => {
                    warn!(task_id = %record.task_id, error = %e, "could not attach requeued entry");
                    self.unattached().insert(record.task_id, queue_ref);
                }
            }
        }
        // 孤児でなくなったタスクの分は忘れる
        self.unattached().retain(|task_id, _| orphans.contains(task_id));

        for record in self.store.list_by_status(TaskStatus::Processing).await? {
            if is_stuck(&record, now, self.config.stuck_threshold) {
                warn!(
                    task_id = %record.task_id,
                    progress = record.progress,
                    last_progress_at = ?record.last_progress_at,
                    "task looks stuck"
                );
                report.stuck += 1;
            }
        }

        if report != SweepReport::default() {
            info!(requeued = report.requeued, stuck = report.stuck, "reaper sweep");
        }
        Ok(report)
    }
}
