//! Task record: the durable source of truth for one task.
//!
//! All state transitions go through `TaskRecord::apply`, so every store
//! implementation enforces the same state machine by construction:
//! - status only moves forward (see `TaskStatus::can_transition_to`)
//! - progress is monotonic while processing, capped below 100, and reaches
//!   100 only on completion
//! - accrued cost never decreases and never exceeds the ceiling
//! - nothing changes once the status is terminal

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::attempt::AttemptRecord;
use super::cost::CostRates;
use super::errors::{TaskError, TransitionError};
use super::ids::{EntryId, OwnerId, TaskId};
use super::payload::TaskPayload;
use super::state::TaskStatus;
use super::task_kind::TaskKind;

/// Highest progress value a task can report before it completes.
pub const MAX_IN_FLIGHT_PROGRESS: u8 = 99;

/// Which provider instance executed the task, with its declared rates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderBinding {
    pub provider: String,
    pub model: String,
    pub rates: CostRates,
}

/// Where the task's queue entry lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueRef {
    pub stream: String,
    pub entry_id: EntryId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub kind: TaskKind,
    pub owner: OwnerId,
    pub payload: TaskPayload,

    pub status: TaskStatus,
    pub progress: u8,
    pub step: Option<String>,

    pub provider: Option<ProviderBinding>,
    pub accrued_cost: Decimal,
    pub cost_ceiling: Decimal,

    pub result: Option<serde_json::Value>,
    pub error: Option<TaskError>,

    /// Cooperative cancellation flag, polled by the worker.
    pub cancel_requested: bool,

    /// Entry the producer (or the reaper) appended for this task.
    pub queue_ref: Option<QueueRef>,

    /// Entry whose claim started processing. Other entries for the same
    /// task are duplicates and get skipped.
    pub processing_entry: Option<QueueRef>,

    pub attempts: Vec<AttemptRecord>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,

    /// Last time a worker reported progress (or started the task).
    pub last_progress_at: Option<DateTime<Utc>>,
}

/// A single-row change to a task record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskMutation {
    AttachEntry(QueueRef),
    RequestCancel,
    StartProcessing {
        entry: QueueRef,
        binding: ProviderBinding,
    },
    Progress {
        progress: u8,
        step: String,
        accrued_cost: Decimal,
    },
    RecordAttempt(AttemptRecord),
    Complete {
        result: serde_json::Value,
        accrued_cost: Decimal,
    },
    Fail(TaskError),
    Cancel,
}

impl TaskMutation {
    pub fn name(&self) -> &'static str {
        match self {
            TaskMutation::AttachEntry(_) => "attach_entry",
            TaskMutation::RequestCancel => "request_cancel",
            TaskMutation::StartProcessing { .. } => "start_processing",
            TaskMutation::Progress { .. } => "progress",
            TaskMutation::RecordAttempt(_) => "record_attempt",
            TaskMutation::Complete { .. } => "complete",
            TaskMutation::Fail(_) => "fail",
            TaskMutation::Cancel => "cancel",
        }
    }
}

impl TaskRecord {
    pub fn new(
        task_id: TaskId,
        owner: OwnerId,
        payload: TaskPayload,
        cost_ceiling: Decimal,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id,
            kind: payload.kind(),
            owner,
            payload,
            status: TaskStatus::Pending,
            progress: 0,
            step: None,
            provider: None,
            accrued_cost: Decimal::ZERO,
            cost_ceiling,
            result: None,
            error: None,
            cancel_requested: false,
            queue_ref: None,
            processing_entry: None,
            attempts: Vec::new(),
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
            last_progress_at: None,
        }
    }

    /// Remaining budget before the ceiling.
    pub fn remaining_budget(&self) -> Decimal {
        (self.cost_ceiling - self.accrued_cost).max(Decimal::ZERO)
    }

    /// Apply one mutation, enforcing the state machine.
    pub fn apply(
        &mut self,
        mutation: TaskMutation,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::AlreadyTerminal {
                task_id: self.task_id,
                status: self.status,
            });
        }

        match mutation {
            TaskMutation::AttachEntry(entry) => {
                self.queue_ref = Some(entry);
            }
            TaskMutation::RequestCancel => {
                self.cancel_requested = true;
            }
            TaskMutation::StartProcessing { entry, binding } => {
                if self.status == TaskStatus::Processing {
                    // 同じエントリの再配送（前のワーカーがクラッシュした）
                    if self.processing_entry.as_ref() != Some(&entry) {
                        return Err(TransitionError::DuplicateDelivery {
                            task_id: self.task_id,
                        });
                    }
                } else {
                    self.check_transition(TaskStatus::Processing)?;
                    self.status = TaskStatus::Processing;
                    self.processing_entry = Some(entry);
                    self.progress = 0;
                    self.started_at = Some(now);
                }
                self.provider = Some(binding);
                self.last_progress_at = Some(now);
            }
            TaskMutation::Progress {
                progress,
                step,
                accrued_cost,
            } => {
                if self.status != TaskStatus::Processing {
                    return Err(TransitionError::NotProcessing {
                        task_id: self.task_id,
                        status: self.status,
                    });
                }
                self.check_charge(accrued_cost)?;
                self.accrued_cost = accrued_cost;
                self.progress = self.progress.max(progress.min(MAX_IN_FLIGHT_PROGRESS));
                self.step = Some(step);
                self.last_progress_at = Some(now);
            }
            TaskMutation::RecordAttempt(attempt) => {
                self.attempts.push(attempt);
            }
            TaskMutation::Complete {
                result,
                accrued_cost,
            } => {
                self.check_transition(TaskStatus::Completed)?;
                self.check_charge(accrued_cost)?;
                self.status = TaskStatus::Completed;
                self.accrued_cost = accrued_cost;
                self.progress = 100;
                self.result = Some(result);
                self.completed_at = Some(now);
            }
            TaskMutation::Fail(error) => {
                self.check_transition(TaskStatus::Failed)?;
                self.status = TaskStatus::Failed;
                self.error = Some(error);
                self.completed_at = Some(now);
            }
            TaskMutation::Cancel => {
                self.check_transition(TaskStatus::Cancelled)?;
                self.status = TaskStatus::Cancelled;
                self.completed_at = Some(now);
            }
        }

        self.updated_at = now;
        Ok(())
    }

    fn check_transition(&self, next: TaskStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError::InvalidTransition {
                task_id: self.task_id,
                from: self.status,
                to: next,
            });
        }
        Ok(())
    }

    fn check_charge(&self, accrued_cost: Decimal) -> Result<(), TransitionError> {
        if accrued_cost > self.cost_ceiling {
            return Err(TransitionError::CostCeiling {
                task_id: self.task_id,
                attempted: accrued_cost,
                ceiling: self.cost_ceiling,
            });
        }
        if accrued_cost < self.accrued_cost {
            return Err(TransitionError::CostDecrease {
                task_id: self.task_id,
                current: self.accrued_cost,
                attempted: accrued_cost,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::ErrorKind;
    use crate::domain::payload::TemplateReview;
    use rust_decimal_macros::dec;
    use ulid::Ulid;

    fn record() -> TaskRecord {
        TaskRecord::new(
            TaskId::from_ulid(Ulid::new()),
            OwnerId::new("auditor-1"),
            TaskPayload::TemplateReview(TemplateReview {
                template_id: "iso-9001".into(),
                content: "4.1 Context".into(),
            }),
            dec!(1.00),
            Utc::now(),
        )
    }

    fn entry(offset: u64) -> QueueRef {
        QueueRef {
            stream: "tasks:template-review".into(),
            entry_id: EntryId::new(offset),
        }
    }

    fn binding() -> ProviderBinding {
        ProviderBinding {
            provider: "local".into(),
            model: "scripted-1".into(),
            rates: CostRates::default(),
        }
    }

    fn start(r: &mut TaskRecord) {
        r.apply(
            TaskMutation::StartProcessing {
                entry: entry(1),
                binding: binding(),
            },
            Utc::now(),
        )
        .unwrap();
    }

    fn progress(p: u8, cost: Decimal) -> TaskMutation {
        TaskMutation::Progress {
            progress: p,
            step: format!("at {p}"),
            accrued_cost: cost,
        }
    }

    #[test]
    fn new_task_is_pending() {
        let r = record();
        assert_eq!(r.status, TaskStatus::Pending);
        assert_eq!(r.kind, TaskKind::TemplateReview);
        assert_eq!(r.progress, 0);
    }

    #[test]
    fn happy_path_reaches_completed_at_100() {
        let mut r = record();
        start(&mut r);
        assert_eq!(r.status, TaskStatus::Processing);
        assert!(r.started_at.is_some());

        r.apply(progress(45, dec!(0.10)), Utc::now()).unwrap();
        r.apply(
            TaskMutation::Complete {
                result: serde_json::json!({"ok": true}),
                accrued_cost: dec!(0.20),
            },
            Utc::now(),
        )
        .unwrap();

        assert_eq!(r.status, TaskStatus::Completed);
        assert_eq!(r.progress, 100);
        assert_eq!(r.accrued_cost, dec!(0.20));
        assert!(r.completed_at.is_some());
    }

    #[test]
    fn progress_is_monotonic_and_capped() {
        let mut r = record();
        start(&mut r);

        r.apply(progress(80, Decimal::ZERO), Utc::now()).unwrap();
        r.apply(progress(10, Decimal::ZERO), Utc::now()).unwrap();
        assert_eq!(r.progress, 80);

        r.apply(progress(100, Decimal::ZERO), Utc::now()).unwrap();
        assert_eq!(r.progress, MAX_IN_FLIGHT_PROGRESS);
    }

    #[test]
    fn progress_outside_processing_is_rejected() {
        let mut r = record();
        let err = r.apply(progress(10, Decimal::ZERO), Utc::now()).unwrap_err();
        assert!(matches!(err, TransitionError::NotProcessing { .. }));
    }

    #[test]
    fn cost_above_ceiling_is_rejected() {
        let mut r = record();
        start(&mut r);
        let err = r.apply(progress(10, dec!(1.01)), Utc::now()).unwrap_err();
        assert!(matches!(err, TransitionError::CostCeiling { .. }));
        assert_eq!(r.accrued_cost, Decimal::ZERO);
    }

    #[test]
    fn terminal_task_rejects_everything() {
        let mut r = record();
        r.apply(TaskMutation::Cancel, Utc::now()).unwrap();
        assert_eq!(r.status, TaskStatus::Cancelled);

        for m in [
            TaskMutation::RequestCancel,
            TaskMutation::Fail(TaskError::new(ErrorKind::InvalidRequest, "x")),
            TaskMutation::AttachEntry(entry(2)),
        ] {
            assert!(matches!(
                r.apply(m, Utc::now()),
                Err(TransitionError::AlreadyTerminal { .. })
            ));
        }
    }

    #[test]
    fn pending_cannot_complete() {
        let mut r = record();
        let err = r
            .apply(
                TaskMutation::Complete {
                    result: serde_json::Value::Null,
                    accrued_cost: Decimal::ZERO,
                },
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, TransitionError::InvalidTransition { .. }));
    }

    #[test]
    fn redelivery_of_same_entry_resumes() {
        let mut r = record();
        start(&mut r);
        r.apply(progress(60, Decimal::ZERO), Utc::now()).unwrap();

        start(&mut r);
        assert_eq!(r.status, TaskStatus::Processing);
        assert_eq!(r.progress, 60);
    }

    #[test]
    fn second_entry_for_same_task_is_a_duplicate() {
        let mut r = record();
        start(&mut r);
        let err = r
            .apply(
                TaskMutation::StartProcessing {
                    entry: entry(9),
                    binding: binding(),
                },
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, TransitionError::DuplicateDelivery { .. }));
    }
}
