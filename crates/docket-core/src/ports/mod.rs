//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」。producer / worker / relay はこの trait
//! だけに依存し、実装（in-memory, file journal, 将来の Redis/Postgres）は
//! 起動時に差し込みます。

pub mod clock;
pub mod connection;
pub mod id_generator;
pub mod progress_channel;
pub mod provider;
pub mod task_store;
pub mod work_queue;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::connection::ClientConnection;
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::progress_channel::{
    ProgressChannel, ProgressSubscription, SubscriptionError, SubscriptionRelease,
};
pub use self::provider::{
    ProgressCallback, Provider, ProviderDescriptor, ProviderOutput, ProviderProgress,
};
pub use self::task_store::TaskStore;
pub use self::work_queue::{Claim, PendingEntry, QueueEntry, WorkQueue};
