//! Typed progress messages sent over the progress channel and the relay.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::TaskError;
use super::ids::TaskId;
use super::state::TaskStatus;
use super::task::TaskRecord;

/// Incremental progress of a processing task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub task_id: TaskId,
    pub progress: u8,
    pub step: String,
    pub timestamp: DateTime<Utc>,
}

/// Final message for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalEvent {
    pub task_id: TaskId,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    pub timestamp: DateTime<Utc>,
}

/// Snapshot emitted by the relay before live forwarding starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatchUpEvent {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressMessage {
    CatchUp(CatchUpEvent),
    Progress(ProgressEvent),
    Terminal(TerminalEvent),
}

impl ProgressMessage {
    pub fn task_id(&self) -> TaskId {
        match self {
            ProgressMessage::CatchUp(e) => e.task_id,
            ProgressMessage::Progress(e) => e.task_id,
            ProgressMessage::Terminal(e) => e.task_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressMessage::Terminal(_))
    }

    /// Catch-up snapshot of a stored record.
    pub fn catch_up(record: &TaskRecord) -> Self {
        ProgressMessage::CatchUp(CatchUpEvent {
            task_id: record.task_id,
            status: record.status,
            progress: record.progress,
            step: record.step.clone(),
            timestamp: record.updated_at,
        })
    }

    /// Terminal message built from a stored record, `None` if not terminal yet.
    pub fn terminal(record: &TaskRecord) -> Option<Self> {
        if !record.status.is_terminal() {
            return None;
        }
        Some(ProgressMessage::Terminal(TerminalEvent {
            task_id: record.task_id,
            status: record.status,
            result: record.result.clone(),
            error: record.error.clone(),
            timestamp: record.completed_at.unwrap_or(record.updated_at),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn progress_message_is_tagged() {
        let msg = ProgressMessage::Progress(ProgressEvent {
            task_id: TaskId::from_ulid(Ulid::new()),
            progress: 45,
            step: "extracting clauses".into(),
            timestamp: Utc::now(),
        });
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "progress");
        assert_eq!(v["progress"], 45);
        assert_eq!(v["step"], "extracting clauses");
    }

    #[test]
    fn terminal_omits_missing_result() {
        let msg = ProgressMessage::Terminal(TerminalEvent {
            task_id: TaskId::from_ulid(Ulid::new()),
            status: TaskStatus::Cancelled,
            result: None,
            error: None,
            timestamp: Utc::now(),
        });
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "terminal");
        assert_eq!(v["status"], "cancelled");
        assert!(v.get("result").is_none());
    }
}
