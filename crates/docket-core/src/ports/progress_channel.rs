//! ProgressChannel port - タスク単位の揮発 pub/sub
//!
//! 購読者がいないときの publish は no-op（バッファも永続化もしない）。
//! 取りこぼしは Task Store からの catch-up で埋める前提です。

use std::fmt;
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::domain::{ProgressMessage, TaskId};

pub trait ProgressChannel: Send + Sync {
    /// Fire-and-forget. Never blocks and never fails.
    fn publish(&self, message: ProgressMessage);

    fn subscribe(&self, task_id: TaskId) -> ProgressSubscription;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SubscriptionError {
    #[error("subscriber fell behind by {0} messages")]
    Lagged(u64),

    #[error("progress channel closed")]
    Closed,
}

/// Called by a dropped subscription once its receiver is gone, so the
/// channel can forget senders nobody listens to.
pub trait SubscriptionRelease: Send + Sync {
    fn release(&self, task_id: TaskId);
}

struct ReleaseGuard {
    task_id: TaskId,
    hook: Arc<dyn SubscriptionRelease>,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.hook.release(self.task_id);
    }
}

impl fmt::Debug for ReleaseGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReleaseGuard")
            .field("task_id", &self.task_id)
            .finish_non_exhaustive()
    }
}

/// Live feed of one task's progress messages.
#[derive(Debug)]
pub struct ProgressSubscription {
    task_id: TaskId,
    rx: broadcast::Receiver<ProgressMessage>,
    // フィールドは宣言順に drop される。rx が先に消えてから release が走る
    _release: Option<ReleaseGuard>,
}

impl ProgressSubscription {
    pub fn new(task_id: TaskId, rx: broadcast::Receiver<ProgressMessage>) -> Self {
        Self {
            task_id,
            rx,
            _release: None,
        }
    }

    /// Notify `hook` when this subscription is dropped.
    pub fn with_release(mut self, hook: Arc<dyn SubscriptionRelease>) -> Self {
        self._release = Some(ReleaseGuard {
            task_id: self.task_id,
            hook,
        });
        self
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub async fn recv(&mut self) -> Result<ProgressMessage, SubscriptionError> {
        loop {
            match self.rx.recv().await {
                // 共有 sender の場合に備えて他タスクのメッセージは読み捨てる
                Ok(msg) if msg.task_id() != self.task_id => continue,
                Ok(msg) => return Ok(msg),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    return Err(SubscriptionError::Lagged(n));
                }
                Err(broadcast::error::RecvError::Closed) => return Err(SubscriptionError::Closed),
            }
        }
    }

    /// Next already-buffered message, `None` if nothing is waiting.
    pub fn try_recv(&mut self) -> Option<Result<ProgressMessage, SubscriptionError>> {
        loop {
            match self.rx.try_recv() {
                Ok(msg) if msg.task_id() != self.task_id => continue,
                Ok(msg) => return Some(Ok(msg)),
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    return Some(Err(SubscriptionError::Lagged(n)));
                }
                Err(broadcast::error::TryRecvError::Closed) => {
                    return Some(Err(SubscriptionError::Closed));
                }
            }
        }
    }
}
