//! ProgressRelay - 1 接続 × 1 タスクの中継
//!
//! # フロー
//! 1. 先に subscribe してから Task Store のスナップショットを読む（隙間を作らない）
//! 2. 終端なら終端メッセージだけ送って終わる。そうでなければ catch-up を送る
//! 3. 以降は channel から来たものをそのまま転送する
//!
//! 終了条件は 3 つ: 終端メッセージを送った / クライアントが閉じた / unsubscribe。
//! channel が何も運ばなくても、store を定期的に見て終端メッセージを合成する。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::domain::{ProgressMessage, TaskId, TaskRecord, TaskStatus};
use crate::error::RelayError;
use crate::ports::{
    ClientConnection, ProgressChannel, ProgressSubscription, SubscriptionError, TaskStore,
};

/// Why a relay stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayExit {
    /// The terminal message was delivered.
    Terminal(TaskStatus),
    ClientClosed,
    Unsubscribed,
}

#[derive(Clone)]
pub struct ProgressRelay {
    store: Arc<dyn TaskStore>,
    channel: Arc<dyn ProgressChannel>,
    poll_interval: Duration,
}

/// A relay running in the background. Dropping it unsubscribes.
pub struct RelayHandle {
    task_id: TaskId,
    unsubscribe_tx: watch::Sender<bool>,
    join: JoinHandle<Result<RelayExit, RelayError>>,
}

impl RelayHandle {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn unsubscribe(&self) {
        let _ = self.unsubscribe_tx.send(true);
    }

    /// Wait for the relay to stop.
    pub async fn join(self) -> Result<RelayExit, RelayError> {
        // sender を生かしたまま待つ（drop すると unsubscribe 扱いになる）
        let Self {
            unsubscribe_tx,
            join,
            ..
        } = self;
        let result = join.await;
        drop(unsubscribe_tx);
        result.map_err(|e| RelayError::Aborted(e.to_string()))?
    }
}

impl ProgressRelay {
    pub fn new(
        store: Arc<dyn TaskStore>,
        channel: Arc<dyn ProgressChannel>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            channel,
            poll_interval,
        }
    }

    /// Start relaying `task_id` to `conn` on a background task.
    ///
    /// Fails up front if the task does not exist.
    pub async fn spawn(
        &self,
        task_id: TaskId,
        conn: Arc<dyn ClientConnection>,
    ) -> Result<RelayHandle, RelayError> {
        if self.store.get(task_id).await?.is_none() {
            return Err(RelayError::NotFound(task_id));
        }

        let (unsubscribe_tx, unsubscribe_rx) = watch::channel(false);
        let relay = self.clone();
        let join =
            tokio::spawn(async move { relay.run(task_id, conn.as_ref(), unsubscribe_rx).await });

        Ok(RelayHandle {
            task_id,
            unsubscribe_tx,
            join,
        })
    }

    /// Relay in the current task until one of the exit conditions.
    ///
    /// Setting `unsubscribe` to true, or dropping its sender, stops the relay.
    pub async fn run(
        &self,
        task_id: TaskId,
        conn: &dyn ClientConnection,
        mut unsubscribe: watch::Receiver<bool>,
    ) -> Result<RelayExit, RelayError> {
        let mut sub = self.channel.subscribe(task_id);

        let snapshot = self.snapshot(task_id).await?;
        if let Some(exit) = self.send_snapshot(conn, &snapshot).await {
            return Ok(exit);
        }
        let mut last = snapshot.progress;
        // channel が閉じたら store のポーリングだけで続ける
        let mut live = true;

        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        poll.tick().await;

        info!(task_id = %task_id, progress = last, "relay attached");

        loop {
            tokio::select! {
                biased;

                received = sub.recv(), if live => match received {
                    Ok(ProgressMessage::Progress(event)) => {
                        if event.progress < last {
                            debug!(task_id = %task_id, progress = event.progress, last, "dropping stale progress");
                            continue;
                        }
                        last = event.progress;
                        if conn.send(&ProgressMessage::Progress(event)).await.is_err() {
                            return Ok(self.closed(task_id));
                        }
                    }
                    Ok(ProgressMessage::Terminal(terminal)) => {
                        let status = terminal.status;
                        if conn.send(&ProgressMessage::Terminal(terminal)).await.is_err() {
                            return Ok(self.closed(task_id));
                        }
                        info!(task_id = %task_id, status = %status, "relay finished");
                        return Ok(RelayExit::Terminal(status));
                    }
                    Ok(message @ ProgressMessage::CatchUp(_)) => {
                        if conn.send(&message).await.is_err() {
                            return Ok(self.closed(task_id));
                        }
                    }
                    Err(SubscriptionError::Lagged(missed)) => {
                        warn!(task_id = %task_id, missed, "relay lagged, re-syncing from store");
                        // 読めなければ次の poll で追いつく
                        if let Some(snapshot) = self.try_snapshot(task_id).await {
                            if let Some(exit) = self.resync(conn, &snapshot, &mut last).await {
                                return Ok(exit);
                            }
                        }
                    }
                    Err(SubscriptionError::Closed) => {
                        debug!(task_id = %task_id, "progress channel closed, polling store");
                        live = false;
                    }
                },
                _ = conn.closed() => {
                    return Ok(self.closed(task_id));
                }
                _ = unsubscribe.changed() => {
                    info!(task_id = %task_id, "relay unsubscribed");
                    return Ok(RelayExit::Unsubscribed);
                }
                _ = poll.tick() => {
                    let Some(snapshot) = self.try_snapshot(task_id).await else {
                        continue;
                    };
                    if snapshot.status.is_terminal() && live {
                        // 終端より前に publish された分を先に流す
                        if let Some(exit) = self.drain(&mut sub, conn, &mut last).await {
                            return Ok(exit);
                        }
                    }
                    if snapshot.status.is_terminal() || !live {
                        if let Some(exit) = self.resync(conn, &snapshot, &mut last).await {
                            return Ok(exit);
                        }
                    }
                }
            }
        }
    }

    async fn snapshot(&self, task_id: TaskId) -> Result<TaskRecord, RelayError> {
        self.store
            .get(task_id)
            .await?
            .ok_or(RelayError::NotFound(task_id))
    }

    /// Snapshot for a running relay. A store hiccup is logged and skipped so
    /// the relay keeps polling until it can deliver the terminal message.
    async fn try_snapshot(&self, task_id: TaskId) -> Option<TaskRecord> {
        match self.snapshot(task_id).await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "relay could not read task, retrying on next poll");
                None
            }
        }
    }

    /// Initial snapshot: terminal message for finished tasks, catch-up otherwise.
    async fn send_snapshot(
        &self,
        conn: &dyn ClientConnection,
        snapshot: &TaskRecord,
    ) -> Option<RelayExit> {
        if let Some(terminal) = ProgressMessage::terminal(snapshot) {
            if conn.send(&terminal).await.is_err() {
                return Some(self.closed(snapshot.task_id));
            }
            return Some(RelayExit::Terminal(snapshot.status));
        }
        if conn.send(&ProgressMessage::catch_up(snapshot)).await.is_err() {
            return Some(self.closed(snapshot.task_id));
        }
        None
    }

    /// Forward whatever is already buffered on the live feed.
    async fn drain(
        &self,
        sub: &mut ProgressSubscription,
        conn: &dyn ClientConnection,
        last: &mut u8,
    ) -> Option<RelayExit> {
        while let Some(Ok(message)) = sub.try_recv() {
            match message {
                ProgressMessage::Progress(event) if event.progress >= *last => {
                    *last = event.progress;
                    if conn.send(&ProgressMessage::Progress(event)).await.is_err() {
                        return Some(self.closed(sub.task_id()));
                    }
                }
                ProgressMessage::Terminal(terminal) => {
                    let status = terminal.status;
                    if conn.send(&ProgressMessage::Terminal(terminal)).await.is_err() {
                        return Some(self.closed(sub.task_id()));
                    }
                    return Some(RelayExit::Terminal(status));
                }
                _ => {}
            }
        }
        None
    }

    /// Bring the client up to date from the store after a gap.
    async fn resync(
        &self,
        conn: &dyn ClientConnection,
        snapshot: &TaskRecord,
        last: &mut u8,
    ) -> Option<RelayExit> {
        if snapshot.status.is_terminal() {
            return self.send_snapshot(conn, snapshot).await;
        }
        if snapshot.progress > *last {
            *last = snapshot.progress;
            return self.send_snapshot(conn, snapshot).await;
        }
        None
    }

    fn closed(&self, task_id: TaskId) -> RelayExit {
        debug!(task_id = %task_id, "relay client closed");
        RelayExit::ClientClosed
    }
}
