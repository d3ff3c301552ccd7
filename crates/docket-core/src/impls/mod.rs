//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryTaskStore / InMemoryWorkQueue**: テスト・単一プロセス用
//! - **FileTaskStore / FileWorkQueue**: JSON-lines journal による永続版
//! - **BroadcastProgressChannel**: tokio broadcast による揮発 pub/sub
//! - **ScriptedProvider**: 決定的なローカルプロバイダ
//! - **ChannelConnection**: mpsc をクライアント接続に見立てたもの
//!
//! 本番用の Redis Streams / PostgreSQL 実装は別クレートに置く想定です。

pub mod broadcast_channel;
pub mod channel_connection;
pub mod file_queue;
pub mod file_store;
pub mod inmem_queue;
pub mod inmem_store;
pub mod journal;
pub mod scripted_provider;

pub use self::broadcast_channel::BroadcastProgressChannel;
pub use self::channel_connection::ChannelConnection;
pub use self::file_queue::FileWorkQueue;
pub use self::file_store::FileTaskStore;
pub use self::inmem_queue::InMemoryWorkQueue;
pub use self::inmem_store::InMemoryTaskStore;
pub use self::journal::Journal;
pub use self::scripted_provider::{ScriptedFailure, ScriptedProvider};
