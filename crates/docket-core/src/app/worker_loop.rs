//! Worker - claim → check → process → ack
//!
//! # フロー
//! 1. WorkQueue::claim() でエントリを取得
//! 2. TaskStore で状態を再確認（終端なら ack して skip = 再配送に対する冪等ガード）
//! 3. cancel 済みならプロバイダを呼ばずに cancelled にして ack
//! 4. processing へ遷移し、Gateway 経由でプロバイダを呼ぶ
//!    - progress callback ごとに claim を touch、store を更新、channel へ publish
//!    - cancel フラグはこの境界でだけ確認する（協調的キャンセル）
//! 5. 結果に応じて completed / failed / cancelled を書き、書けてから ack
//!
//! claim を失った、あるいは store に書けなかった場合は ack せずに手放す。
//! エントリは claim timeout 後に別ワーカーへ再配送される。

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

use crate::app::gateway::{CostBudget, ProgressSink, ProviderGateway};
use crate::app::retry::{RetryDecision, RetryPolicy};
use crate::domain::{
    AttemptOutcome, AttemptRecord, ErrorKind, ProgressEvent, ProgressMessage, TaskError, TaskId,
    TaskMutation, TaskRecord, TaskStatus, TransitionError,
};
use crate::error::{ErrorClass, Halt, ProviderError, QueueError, StoreError};
use crate::ports::{Claim, Clock, IdGenerator, ProgressChannel, Provider, TaskStore, WorkQueue};

/// Knobs the worker needs from the configuration.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub group: String,
    pub streams: Vec<String>,
    pub block_timeout: Duration,
    pub task_timeout: Duration,
    pub progress_ceiling: u8,
    /// How often a claim is refreshed while a provider call is in flight.
    pub heartbeat_interval: Duration,
}

/// Everything a worker talks to. Shared by all workers in a pool.
pub struct WorkerContext {
    pub store: Arc<dyn TaskStore>,
    pub queue: Arc<dyn WorkQueue>,
    pub channel: Arc<dyn ProgressChannel>,
    pub gateway: Arc<ProviderGateway>,
    pub ids: Arc<dyn IdGenerator>,
    pub clock: Arc<dyn Clock>,
    pub retry: RetryPolicy,
    pub settings: WorkerSettings,
}

/// Why a claim was acknowledged without running the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No task record for the entry.
    Missing,
    /// A previous delivery already finished the task.
    AlreadyTerminal,
    /// Another queue entry is processing the same task.
    Duplicate,
}

/// How one claim ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Completed,
    Failed(ErrorKind),
    Cancelled,
    Skipped(SkipReason),
    /// Let go without acknowledging; the entry will be redelivered.
    Abandoned(String),
}

impl Disposition {
    pub fn is_acknowledged(&self) -> bool {
        !matches!(self, Disposition::Abandoned(_))
    }
}

pub struct Worker {
    consumer: String,
    ctx: Arc<WorkerContext>,
}

impl Worker {
    pub fn new(consumer: impl Into<String>, ctx: Arc<WorkerContext>) -> Self {
        Self {
            consumer: consumer.into(),
            ctx,
        }
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Wait up to the block timeout for one entry.
    pub async fn claim_next(&self) -> Result<Option<Claim>, QueueError> {
        let settings = &self.ctx.settings;
        self.ctx
            .queue
            .claim(
                &settings.group,
                &self.consumer,
                &settings.streams,
                settings.block_timeout,
            )
            .await
    }

    /// Claim one entry and process it.
    pub async fn run_once(&self) -> Result<Option<Disposition>, QueueError> {
        let Some(claim) = self.claim_next().await? else {
            return Ok(None);
        };
        Ok(Some(self.process(claim).await))
    }

    /// Process one claimed entry to a disposition.
    pub async fn process(&self, claim: Claim) -> Disposition {
        let task_id = claim.task_id();
        debug!(
            consumer = %self.consumer,
            task_id = %task_id,
            entry_id = %claim.entry.entry_id,
            delivery = claim.delivery_count,
            "claimed"
        );

        let disposition = self.handle(&claim).await;
        match &disposition {
            Disposition::Abandoned(reason) => {
                warn!(consumer = %self.consumer, task_id = %task_id, reason = %reason, "abandoning claim");
            }
            other => {
                if let Err(e) = self.ctx.queue.ack(&claim).await {
                    // 終端状態は書けているので、再配送されても skip される
                    warn!(consumer = %self.consumer, task_id = %task_id, error = %e, "ack failed");
                }
                info!(consumer = %self.consumer, task_id = %task_id, disposition = ?other, "claim settled");
            }
        }
        disposition
    }

    async fn handle(&self, claim: &Claim) -> Disposition {
        let ctx = &self.ctx;
        let task_id = claim.task_id();

        let record = match ctx.store.get(task_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!(task_id = %task_id, "queue entry without task record");
                return Disposition::Skipped(SkipReason::Missing);
            }
            Err(e) => return Disposition::Abandoned(format!("store read failed: {e}")),
        };

        // 冪等ガード: 前の配送がすでに終わらせている
        if record.status.is_terminal() {
            return Disposition::Skipped(SkipReason::AlreadyTerminal);
        }
        if record.cancel_requested {
            return self.finish(task_id, TaskMutation::Cancel).await;
        }

        let provider = match ctx.gateway.enabled_for(record.kind) {
            Ok(provider) => provider,
            Err(e) => {
                let error = TaskError::new(ErrorKind::ProviderUnavailable, e.to_string());
                return self.finish(task_id, TaskMutation::Fail(error)).await;
            }
        };

        let start = TaskMutation::StartProcessing {
            entry: claim.queue_ref(),
            binding: provider.descriptor().binding(),
        };
        let record = match ctx.store.apply(task_id, start).await {
            Ok(record) => record,
            Err(StoreError::Transition(TransitionError::DuplicateDelivery { .. })) => {
                return Disposition::Skipped(SkipReason::Duplicate);
            }
            Err(StoreError::Transition(TransitionError::AlreadyTerminal { .. })) => {
                return Disposition::Skipped(SkipReason::AlreadyTerminal);
            }
            Err(e) => return Disposition::Abandoned(format!("could not start: {e}")),
        };
        if claim.is_redelivery() {
            info!(task_id = %task_id, progress = record.progress, "resuming redelivered task");
        }

        self.run_attempts(claim, record, provider.as_ref()).await
    }

    async fn run_attempts(
        &self,
        claim: &Claim,
        mut record: TaskRecord,
        provider: &dyn Provider,
    ) -> Disposition {
        let ctx = &self.ctx;
        let task_id = record.task_id;
        // 以前の配送で記録された試行も上限に数える
        let mut attempt = record.attempts.len() as u32;

        loop {
            attempt += 1;

            if let Err(e) = ctx.queue.touch(claim).await {
                return Disposition::Abandoned(e.to_string());
            }
            if attempt > 1 {
                match ctx.store.get(task_id).await {
                    Ok(Some(fresh)) => record = fresh,
                    Ok(None) => return Disposition::Abandoned("task record vanished".into()),
                    Err(e) => return Disposition::Abandoned(format!("store read failed: {e}")),
                }
                if record.status.is_terminal() {
                    return Disposition::Skipped(SkipReason::AlreadyTerminal);
                }
                if record.cancel_requested {
                    return self.finish(task_id, TaskMutation::Cancel).await;
                }
            }

            let sink = AttemptSink {
                worker: self,
                claim,
                task_id,
                last_progress: Mutex::new(record.progress),
                accrued: Mutex::new(record.accrued_cost),
            };
            let budget = CostBudget::new(record.accrued_cost, record.cost_ceiling);
            let started_at = ctx.clock.now();

            let result = tokio::select! {
                r = tokio::time::timeout(
                    ctx.settings.task_timeout,
                    ctx.gateway.invoke(provider, &record.payload, budget, &sink),
                ) => r.unwrap_or(Err(ProviderError::TaskTimeout(ctx.settings.task_timeout))),
                lost = heartbeat(ctx.queue.as_ref(), claim, ctx.settings.heartbeat_interval) => {
                    warn!(task_id = %task_id, error = %lost, "claim lost during provider call");
                    Err(ProviderError::Halted(Halt::ClaimLost))
                }
            };

            let attempt_record = |cost: Decimal, outcome: AttemptOutcome| AttemptRecord {
                attempt_id: ctx.ids.generate_attempt_id(),
                number: attempt,
                consumer: self.consumer.clone(),
                provider: provider.descriptor().name.clone(),
                started_at,
                finished_at: ctx.clock.now(),
                cost,
                outcome,
            };
            let spent = sink.accrued() - budget.accrued;

            let error = match result {
                Ok(output) => {
                    let history = attempt_record(output.call_cost, AttemptOutcome::Succeeded);
                    if let Err(d) = self.record_attempt(task_id, history).await {
                        return d;
                    }
                    return self
                        .finish(
                            task_id,
                            TaskMutation::Complete {
                                result: output.result,
                                accrued_cost: output.accrued_cost,
                            },
                        )
                        .await;
                }
                Err(error) => error,
            };

            match &error {
                ProviderError::Halted(Halt::Cancelled) => {
                    let history = attempt_record(spent, AttemptOutcome::Cancelled);
                    if let Err(d) = self.record_attempt(task_id, history).await {
                        return d;
                    }
                    info!(task_id = %task_id, "cancelled at progress boundary");
                    return self.finish(task_id, TaskMutation::Cancel).await;
                }
                ProviderError::Halted(halt) => {
                    return Disposition::Abandoned(halt.to_string());
                }
                _ => {}
            }

            match ctx.retry.decide(attempt, &error) {
                RetryDecision::RetryAfter(delay) => {
                    warn!(
                        task_id = %task_id,
                        attempt,
                        error = %error,
                        delay_ms = delay.as_millis() as u64,
                        "attempt failed, retrying"
                    );
                    let history = attempt_record(
                        spent,
                        AttemptOutcome::Retrying {
                            message: error.to_string(),
                        },
                    );
                    if let Err(d) = self.record_attempt(task_id, history).await {
                        return d;
                    }
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::Exhausted | RetryDecision::GiveUp => {
                    let failure = TaskError::new(failure_kind(&error), error.to_string());
                    warn!(task_id = %task_id, attempt, error = %failure, "task failed");
                    let history = attempt_record(
                        spent,
                        AttemptOutcome::Failed {
                            error: failure.clone(),
                        },
                    );
                    if let Err(d) = self.record_attempt(task_id, history).await {
                        return d;
                    }
                    return self.finish(task_id, TaskMutation::Fail(failure)).await;
                }
            }
        }
    }

    async fn record_attempt(
        &self,
        task_id: TaskId,
        attempt: AttemptRecord,
    ) -> Result<(), Disposition> {
        match self
            .ctx
            .store
            .apply(task_id, TaskMutation::RecordAttempt(attempt))
            .await
        {
            Ok(_) => Ok(()),
            Err(StoreError::Transition(TransitionError::AlreadyTerminal { .. })) => {
                Err(Disposition::Skipped(SkipReason::AlreadyTerminal))
            }
            Err(e) => Err(Disposition::Abandoned(format!("could not record attempt: {e}"))),
        }
    }

    /// Write a terminal mutation and publish the terminal message.
    async fn finish(&self, task_id: TaskId, mutation: TaskMutation) -> Disposition {
        let record = match self.ctx.store.apply(task_id, mutation).await {
            Ok(record) => record,
            Err(StoreError::Transition(TransitionError::AlreadyTerminal { .. })) => {
                return Disposition::Skipped(SkipReason::AlreadyTerminal);
            }
            Err(e) => {
                error!(task_id = %task_id, error = %e, "terminal write failed");
                return Disposition::Abandoned(format!("terminal write failed: {e}"));
            }
        };

        if let Some(message) = ProgressMessage::terminal(&record) {
            self.ctx.channel.publish(message);
        }
        match record.status {
            TaskStatus::Cancelled => Disposition::Cancelled,
            TaskStatus::Failed => Disposition::Failed(
                record
                    .error
                    .map_or(ErrorKind::ProviderUnavailable, |e| e.kind),
            ),
            _ => Disposition::Completed,
        }
    }
}

/// Terminal error kind for a provider failure that will not be retried.
fn failure_kind(error: &ProviderError) -> ErrorKind {
    match error.class() {
        ErrorClass::CostLimit => ErrorKind::CostLimitExceeded,
        ErrorClass::Permanent => ErrorKind::InvalidRequest,
        ErrorClass::Transient | ErrorClass::Timeout | ErrorClass::Unavailable | ErrorClass::Halted => {
            ErrorKind::ProviderUnavailable
        }
    }
}

/// Refresh `claim` until it is lost. Only returns on `ClaimLost`.
async fn heartbeat(queue: &dyn WorkQueue, claim: &Claim, every: Duration) -> QueueError {
    let mut ticker = tokio::time::interval(every.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match queue.touch(claim).await {
            Ok(()) => {}
            Err(lost @ QueueError::ClaimLost { .. }) => return lost,
            Err(e) => warn!(task_id = %claim.task_id(), error = %e, "heartbeat failed"),
        }
    }
}

/// Progress boundary handling for one attempt.
struct AttemptSink<'a> {
    worker: &'a Worker,
    claim: &'a Claim,
    task_id: TaskId,
    last_progress: Mutex<u8>,
    accrued: Mutex<Decimal>,
}

impl AttemptSink<'_> {
    fn accrued(&self) -> Decimal {
        *self.accrued.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ProgressSink for AttemptSink<'_> {
    async fn on_progress(
        &self,
        progress: u8,
        step: String,
        accrued_cost: Decimal,
    ) -> Result<(), Halt> {
        let ctx = &self.worker.ctx;

        match ctx.queue.touch(self.claim).await {
            Ok(()) => {}
            Err(QueueError::ClaimLost { .. }) => return Err(Halt::ClaimLost),
            Err(e) => warn!(task_id = %self.task_id, error = %e, "claim refresh failed"),
        }

        let mutation = TaskMutation::Progress {
            progress: progress.min(ctx.settings.progress_ceiling),
            step: step.clone(),
            accrued_cost,
        };
        let record = match ctx.store.apply(self.task_id, mutation).await {
            Ok(record) => record,
            Err(StoreError::Transition(TransitionError::CostCeiling { attempted, ceiling, .. })) => {
                return Err(Halt::CostLimitExceeded { attempted, ceiling });
            }
            Err(e) => return Err(Halt::Store(e.to_string())),
        };
        *self.accrued.lock().unwrap_or_else(|e| e.into_inner()) = record.accrued_cost;

        if record.cancel_requested {
            return Err(Halt::Cancelled);
        }

        // store の値（単調）をそのまま流す
        let should_publish = {
            let mut last = self.last_progress.lock().unwrap_or_else(|e| e.into_inner());
            let changed = record.progress > *last;
            *last = (*last).max(record.progress);
            changed
        };
        if should_publish {
            ctx.channel.publish(ProgressMessage::Progress(ProgressEvent {
                task_id: self.task_id,
                progress: record.progress,
                step,
                timestamp: record.updated_at,
            }));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::payload::DocumentParse;
    use crate::domain::{CostRates, OwnerId, TaskPayload, TaskStatus};
    use crate::impls::{
        BroadcastProgressChannel, InMemoryTaskStore, InMemoryWorkQueue, ScriptedFailure,
        ScriptedProvider,
    };
    use crate::ports::{SystemClock, UlidGenerator};
    use rust_decimal_macros::dec;

    const STREAM: &str = "tasks:document-parse";

    struct Harness {
        ctx: Arc<WorkerContext>,
        provider: Arc<ScriptedProvider>,
        channel: Arc<BroadcastProgressChannel>,
    }

    fn harness(provider: ScriptedProvider) -> Harness {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let provider = Arc::new(provider);
        let mut gateway = ProviderGateway::new(Duration::from_secs(5));
        gateway.register(provider.clone()).unwrap();
        gateway.enable_defaults(&crate::domain::TaskKind::ALL);
        let channel = Arc::new(BroadcastProgressChannel::new());

        let ctx = Arc::new(WorkerContext {
            store: Arc::new(InMemoryTaskStore::new(clock.clone())),
            queue: Arc::new(InMemoryWorkQueue::new(Duration::from_secs(30), clock.clone())),
            channel: channel.clone(),
            gateway: Arc::new(gateway),
            ids: Arc::new(UlidGenerator::new(SystemClock)),
            clock,
            retry: RetryPolicy {
                base_delay: Duration::from_millis(1),
                ..RetryPolicy::default()
            },
            settings: WorkerSettings {
                group: "task-workers".into(),
                streams: vec![STREAM.into()],
                block_timeout: Duration::from_millis(50),
                task_timeout: Duration::from_secs(5),
                progress_ceiling: 99,
                heartbeat_interval: Duration::from_secs(1),
            },
        });
        Harness {
            ctx,
            provider,
            channel,
        }
    }

    async fn enqueue(h: &Harness, ceiling: Decimal) -> TaskId {
        let task_id = h.ctx.ids.generate_task_id();
        let payload = TaskPayload::DocumentParse(DocumentParse {
            document_id: "doc-1".into(),
            file_name: "procedures.docx".into(),
            content: "x".repeat(100),
        });
        let record = TaskRecord::new(
            task_id,
            OwnerId::new("u1"),
            payload.clone(),
            ceiling,
            h.ctx.clock.now(),
        );
        h.ctx.store.insert(record).await.unwrap();
        h.ctx.queue.append(STREAM, task_id, &payload).await.unwrap();
        task_id
    }

    async fn run_one(h: &Harness) -> Disposition {
        Worker::new("w-1", h.ctx.clone())
            .run_once()
            .await
            .unwrap()
            .unwrap()
    }

    async fn record(h: &Harness, id: TaskId) -> TaskRecord {
        h.ctx.store.get(id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn happy_path_completes_and_acks() {
        let h = harness(ScriptedProvider::new("local", "m"));
        let id = enqueue(&h, dec!(5)).await;
        let mut sub = h.channel.subscribe(id);

        assert_eq!(run_one(&h).await, Disposition::Completed);

        let r = record(&h, id).await;
        assert_eq!(r.status, TaskStatus::Completed);
        assert_eq!(r.progress, 100);
        assert!(r.result.is_some());
        assert_eq!(r.attempts.len(), 1);
        assert!(h.ctx.queue.pending("tasks:document-parse", "task-workers").await.unwrap().is_empty());

        let mut seen = Vec::new();
        while let Ok(msg) = sub.recv().await {
            seen.push(msg);
        }
        let progress: Vec<u8> = seen
            .iter()
            .filter_map(|m| match m {
                ProgressMessage::Progress(p) => Some(p.progress),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![10, 45, 80]);
        assert!(seen.last().unwrap().is_terminal());
    }

    #[tokio::test]
    async fn transient_errors_retry_then_give_up() {
        let h = harness(
            ScriptedProvider::new("local", "m")
                .failing_always(ScriptedFailure::Transient("503".into())),
        );
        let id = enqueue(&h, dec!(5)).await;

        assert_eq!(
            run_one(&h).await,
            Disposition::Failed(ErrorKind::ProviderUnavailable)
        );
        assert_eq!(h.provider.calls(), 3);
        let r = record(&h, id).await;
        assert_eq!(r.attempts.len(), 3);
        assert!(matches!(r.attempts[2].outcome, AttemptOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn transient_then_success() {
        let h = harness(ScriptedProvider::new("local", "m"));
        h.provider.fail_next(ScriptedFailure::Transient("reset".into()));
        let id = enqueue(&h, dec!(5)).await;

        assert_eq!(run_one(&h).await, Disposition::Completed);
        assert_eq!(h.provider.calls(), 2);
        assert_eq!(record(&h, id).await.attempts.len(), 2);
    }

    #[tokio::test]
    async fn permanent_error_fails_without_retry() {
        let h = harness(ScriptedProvider::new("local", "m"));
        h.provider.fail_next(ScriptedFailure::Permanent("unsupported layout".into()));
        let id = enqueue(&h, dec!(5)).await;

        assert_eq!(run_one(&h).await, Disposition::Failed(ErrorKind::InvalidRequest));
        assert_eq!(h.provider.calls(), 1);
        assert_eq!(record(&h, id).await.error.unwrap().kind, ErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn cost_breach_mid_stream_fails_with_dedicated_kind() {
        let h = harness(
            ScriptedProvider::new("local", "m")
                .with_rates(CostRates::new(dec!(0.001), dec!(0.002)))
                .with_limits(1_000, 100)
                .with_output_units(1_000),
        );
        // pre-flight: 0.1 + 0.2 = 0.3; 45% の時点で 0.1 + 0.9 = 1.0 > 0.5
        let id = enqueue(&h, dec!(0.5)).await;

        assert_eq!(
            run_one(&h).await,
            Disposition::Failed(ErrorKind::CostLimitExceeded)
        );
        let r = record(&h, id).await;
        assert_eq!(r.status, TaskStatus::Failed);
        assert!(r.result.is_none());
        assert!(r.accrued_cost <= r.cost_ceiling);
        assert_eq!(r.progress, 10);
    }

    #[tokio::test]
    async fn cancelled_before_start_never_calls_provider() {
        let h = harness(ScriptedProvider::new("local", "m"));
        let id = enqueue(&h, dec!(5)).await;
        h.ctx.store.apply(id, TaskMutation::RequestCancel).await.unwrap();

        assert_eq!(run_one(&h).await, Disposition::Cancelled);
        assert_eq!(h.provider.calls(), 0);
        assert_eq!(record(&h, id).await.status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn terminal_task_is_acked_and_skipped() {
        let h = harness(ScriptedProvider::new("local", "m"));
        let id = enqueue(&h, dec!(5)).await;
        h.ctx.store.apply(id, TaskMutation::Cancel).await.unwrap();

        assert_eq!(
            run_one(&h).await,
            Disposition::Skipped(SkipReason::AlreadyTerminal)
        );
        assert_eq!(h.provider.calls(), 0);
    }

    #[tokio::test]
    async fn attempt_timeout_counts_as_transient() {
        let h = harness(
            ScriptedProvider::new("local", "m")
                .failing_always(ScriptedFailure::Stall(Duration::from_secs(10))),
        );
        let mut ctx = Arc::try_unwrap(h.ctx).ok().unwrap();
        ctx.settings.task_timeout = Duration::from_millis(20);
        ctx.retry.max_attempts = 2;
        let h = Harness {
            ctx: Arc::new(ctx),
            ..h
        };
        let id = enqueue(&h, dec!(5)).await;

        assert_eq!(
            run_one(&h).await,
            Disposition::Failed(ErrorKind::ProviderUnavailable)
        );
        assert_eq!(h.provider.calls(), 2);
        assert_eq!(record(&h, id).await.attempts.len(), 2);
    }

    #[test]
    fn failure_kinds_follow_error_class() {
        assert_eq!(
            failure_kind(&ProviderError::Permanent("x".into())),
            ErrorKind::InvalidRequest
        );
        assert_eq!(
            failure_kind(&ProviderError::CostLimitExceeded {
                attempted: dec!(2),
                ceiling: dec!(1)
            }),
            ErrorKind::CostLimitExceeded
        );
        assert_eq!(
            failure_kind(&ProviderError::Timeout(Duration::from_secs(1))),
            ErrorKind::ProviderUnavailable
        );
    }
}
