//! State - タスクの状態
//!
//! # 状態遷移
//! - Pending -> Processing -> {Completed, Failed, Cancelled}
//! - Pending -> {Failed, Cancelled}（処理開始前の失敗・キャンセル）
//!
//! Pending には二度と戻らない。終端状態からの遷移はない。

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Recorded and queued, not yet claimed by a worker.
    Pending,

    /// A worker holds the claim and is executing it.
    Processing,

    /// Finished with a result.
    Completed,

    /// Finished with an error kind + message.
    Failed,

    /// Stopped at a safe point after a cancel request.
    Cancelled,
}

impl TaskStatus {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Forward-only transition table.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, Processing | Failed | Cancelled) => true,
            (Processing, Completed | Failed | Cancelled) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use TaskStatus::*;

    #[rstest]
    #[case(Pending, Processing, true)]
    #[case(Pending, Failed, true)]
    #[case(Pending, Cancelled, true)]
    #[case(Pending, Completed, false)]
    #[case(Processing, Completed, true)]
    #[case(Processing, Failed, true)]
    #[case(Processing, Cancelled, true)]
    #[case(Processing, Pending, false)]
    #[case(Completed, Processing, false)]
    #[case(Failed, Pending, false)]
    #[case(Cancelled, Completed, false)]
    fn transitions_only_move_forward(
        #[case] from: TaskStatus,
        #[case] to: TaskStatus,
        #[case] allowed: bool,
    ) {
        assert_eq!(from.can_transition_to(to), allowed);
    }

    #[test]
    fn terminal_states() {
        assert!(!Pending.is_terminal());
        assert!(!Processing.is_terminal());
        assert!(Completed.is_terminal());
        assert!(Failed.is_terminal());
        assert!(Cancelled.is_terminal());
    }
}
