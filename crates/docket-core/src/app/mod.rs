//! App - アプリケーション層
//!
//! ports を組み合わせてオーケストレーションを実装します。
//!
//! # 主要コンポーネント
//! - **AppBuilder / App**: ワイヤリングと起動時検証、外向きの操作
//! - **TaskProducer**: validate → store → queue
//! - **Worker / WorkerPool**: claim → check → process → ack
//! - **ProviderGateway**: プロバイダ選択とコスト上限の強制
//! - **ProgressRelay**: 1 接続ぶんの progress 中継
//! - **TaskCanceller / StatusQuery**: キャンセル受付と照会
//! - **ReaperLoop**: 孤児タスクの再投入と stuck の検出

pub mod builder;
pub mod cancel;
pub mod gateway;
pub mod producer;
pub mod reaper_loop;
pub mod relay;
pub mod retry;
pub mod status;
pub mod worker_loop;
pub mod worker_pool;

pub use self::builder::{App, AppBuilder};
pub use self::cancel::TaskCanceller;
pub use self::gateway::{CostBudget, GovernedOutput, ProgressSink, ProviderGateway};
pub use self::producer::TaskProducer;
pub use self::reaper_loop::{ReaperHandle, ReaperLoop, SweepReport};
pub use self::relay::{ProgressRelay, RelayExit, RelayHandle};
pub use self::retry::{RetryDecision, RetryPolicy};
pub use self::status::{StatusQuery, TaskView};
pub use self::worker_loop::{Disposition, SkipReason, Worker, WorkerContext, WorkerSettings};
pub use self::worker_pool::WorkerPool;
