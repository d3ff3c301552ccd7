//! Progress channel backed by one tokio broadcast sender per task.
//!
//! Senders are created on first subscribe and dropped after the terminal
//! message or once the last subscription has been dropped, so idle tasks
//! cost nothing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::trace;

use crate::domain::{ProgressMessage, TaskId};
use crate::ports::{ProgressChannel, ProgressSubscription, SubscriptionRelease};

/// Default broadcast channel capacity per task.
const DEFAULT_CAPACITY: usize = 256;

#[derive(Default)]
struct SenderTable {
    senders: Mutex<HashMap<TaskId, broadcast::Sender<ProgressMessage>>>,
}

impl SenderTable {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<TaskId, broadcast::Sender<ProgressMessage>>> {
        self.senders.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SubscriptionRelease for SenderTable {
    fn release(&self, task_id: TaskId) {
        let mut senders = self.lock();
        if senders.get(&task_id).is_some_and(|tx| tx.receiver_count() == 0) {
            senders.remove(&task_id);
            trace!(task_id = %task_id, "last subscriber gone, sender dropped");
        }
    }
}

pub struct BroadcastProgressChannel {
    table: Arc<SenderTable>,
    capacity: usize,
}

impl BroadcastProgressChannel {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            table: Arc::new(SenderTable::default()),
            capacity: capacity.max(1),
        }
    }

    /// Tasks that currently have at least one live sender.
    pub fn active_tasks(&self) -> usize {
        self.table.lock().len()
    }
}

impl Default for BroadcastProgressChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressChannel for BroadcastProgressChannel {
    fn publish(&self, message: ProgressMessage) {
        let task_id = message.task_id();
        let terminal = message.is_terminal();
        let mut senders = self.table.lock();

        let Some(tx) = senders.get(&task_id) else {
            // 購読者なし: no-op
            return;
        };
        let delivered = tx.send(message).unwrap_or(0);
        trace!(task_id = %task_id, delivered, "progress published");

        if terminal || tx.receiver_count() == 0 {
            senders.remove(&task_id);
        }
    }

    fn subscribe(&self, task_id: TaskId) -> ProgressSubscription {
        let rx = self
            .table
            .lock()
            .entry(task_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();
        let release: Arc<dyn SubscriptionRelease> = self.table.clone();
        ProgressSubscription::new(task_id, rx).with_release(release)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ProgressEvent, TaskStatus, TerminalEvent};
    use crate::ports::SubscriptionError;
    use chrono::Utc;
    use ulid::Ulid;

    fn progress(task_id: TaskId, p: u8) -> ProgressMessage {
        ProgressMessage::Progress(ProgressEvent {
            task_id,
            progress: p,
            step: format!("step {p}"),
            timestamp: Utc::now(),
        })
    }

    fn terminal(task_id: TaskId) -> ProgressMessage {
        ProgressMessage::Terminal(TerminalEvent {
            task_id,
            status: TaskStatus::Completed,
            result: Some(serde_json::json!({"pages": 3})),
            error: None,
            timestamp: Utc::now(),
        })
    }

    #[test]
    fn publish_without_subscribers_is_a_no_op() {
        let channel = BroadcastProgressChannel::new();
        channel.publish(progress(TaskId::from_ulid(Ulid::new()), 10));
        assert_eq!(channel.active_tasks(), 0);
    }

    #[tokio::test]
    async fn subscribers_only_see_their_task_in_order() {
        let channel = BroadcastProgressChannel::new();
        let mine = TaskId::from_ulid(Ulid::new());
        let other = TaskId::from_ulid(Ulid::new());

        let mut sub = channel.subscribe(mine);
        let _other_sub = channel.subscribe(other);

        channel.publish(progress(mine, 10));
        channel.publish(progress(other, 50));
        channel.publish(progress(mine, 45));
        channel.publish(terminal(mine));

        let mut seen = Vec::new();
        loop {
            match sub.recv().await {
                Ok(msg) => {
                    assert_eq!(msg.task_id(), mine);
                    seen.push(msg);
                }
                Err(SubscriptionError::Closed) => break,
                Err(e) => panic!("unexpected {e}"),
            }
        }
        assert_eq!(seen.len(), 3);
        assert!(seen[2].is_terminal());
        assert_eq!(channel.active_tasks(), 1);
    }

    #[tokio::test]
    async fn slow_subscriber_sees_lag() {
        let channel = BroadcastProgressChannel::with_capacity(2);
        let task_id = TaskId::from_ulid(Ulid::new());
        let mut sub = channel.subscribe(task_id);

        for p in [10, 20, 30, 40] {
            channel.publish(progress(task_id, p));
        }
        assert!(matches!(sub.recv().await, Err(SubscriptionError::Lagged(2))));
    }

    #[test]
    fn dropping_the_last_subscription_forgets_the_sender() {
        let channel = BroadcastProgressChannel::new();
        let task_id = TaskId::from_ulid(Ulid::new());

        let first = channel.subscribe(task_id);
        let second = channel.subscribe(task_id);
        assert_eq!(channel.active_tasks(), 1);

        drop(first);
        assert_eq!(channel.active_tasks(), 1);
        drop(second);
        assert_eq!(channel.active_tasks(), 0);

        // 既に消えたタスクへの publish は no-op のまま
        channel.publish(progress(task_id, 10));
        assert_eq!(channel.active_tasks(), 0);
    }

    #[test]
    fn subscription_outliving_a_terminal_message_leaves_nothing_behind() {
        let channel = BroadcastProgressChannel::new();
        let task_id = TaskId::from_ulid(Ulid::new());

        let old = channel.subscribe(task_id);
        channel.publish(terminal(task_id));
        assert_eq!(channel.active_tasks(), 0);

        // terminal 後に新しく付いた購読者が去っても古い購読者の drop が新 sender を壊さない
        let late = channel.subscribe(task_id);
        drop(old);
        assert_eq!(channel.active_tasks(), 1);
        drop(late);
        assert_eq!(channel.active_tasks(), 0);
    }
}
