//! WorkerPool - N 個のワーカーを同じ consumer group で回す
//!
//! - `request_shutdown()` で新しい claim を取らなくなる
//! - 実行中のタスクは最後まで走らせる（次の progress 境界で止めたいなら cancel を使う）
//! - `shutdown_and_join()` で全ワーカーの終了を待てる

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::app::worker_loop::{Worker, WorkerContext};

const CLAIM_ERROR_BACKOFF: Duration = Duration::from_millis(500);

/// Handle on a running pool.
pub struct WorkerPool {
    shutdown_tx: watch::Sender<bool>,
    consumers: Vec<String>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `n` workers named `{prefix}-{index}`.
    pub fn spawn(n: usize, prefix: &str, ctx: Arc<WorkerContext>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut consumers = Vec::with_capacity(n);
        let mut joins = Vec::with_capacity(n);
        for index in 0..n {
            let worker = Worker::new(format!("{prefix}-{index}"), Arc::clone(&ctx));
            consumers.push(worker.consumer().to_string());
            let mut rx = shutdown_rx.clone();

            joins.push(tokio::spawn(async move {
                worker_loop(worker, &mut rx).await;
            }));
        }
        info!(workers = n, group = %ctx.settings.group, "worker pool started");

        Self {
            shutdown_tx,
            consumers,
            joins,
        }
    }

    /// Default consumer prefix: unique per process.
    pub fn default_prefix() -> String {
        format!("worker-{}", std::process::id())
    }

    pub fn consumers(&self) -> &[String] {
        &self.consumers
    }

    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for j in self.joins {
            if let Err(e) = j.await {
                warn!(error = %e, "worker task panicked");
            }
        }
        info!("worker pool stopped");
    }
}

async fn worker_loop(worker: Worker, shutdown_rx: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        // claim はブロックしうるので shutdown と競合させる
        let claimed = tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            claimed = worker.claim_next() => claimed,
        };

        match claimed {
            // 実行中は shutdown で中断しない
            Ok(Some(claim)) => {
                worker.process(claim).await;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(consumer = %worker.consumer(), error = %e, "claim failed");
                tokio::time::sleep(CLAIM_ERROR_BACKOFF).await;
            }
        }
    }
}
