//! docket-core
//!
//! Asynchronous task orchestration: a durable work queue with consumer
//! groups, a worker pool that runs cost-bounded provider calls, and
//! per-client relays that stream progress back.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task_kind, payload, cost, state, task, attempt, progress, errors）
//! - **ports**: 抽象化レイヤー（TaskStore, WorkQueue, ProgressChannel, Provider, ClientConnection, Clock, IdGenerator）
//! - **app**: アプリケーションロジック（builder, producer, worker, gateway, relay, cancel, status, reaper）
//! - **impls**: 実装（in-memory, file journal, broadcast channel, scripted provider）
//! - **config**: 環境変数からの設定読み込みと検証
//! - **error**: コンポーネントごとのエラー型
//! - **observability**: 運用向けカウンタ

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod observability;
pub mod ports;

pub use app::{App, AppBuilder};
pub use config::OrchestratorConfig;
