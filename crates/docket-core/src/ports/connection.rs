//! ClientConnection port - Relay の送り先（WebSocket / SSE など）
//!
//! Relay はこの trait 越しにしかクライアントを知らない。

use async_trait::async_trait;

use crate::domain::ProgressMessage;
use crate::error::ConnectionClosed;

#[async_trait]
pub trait ClientConnection: Send + Sync {
    /// Deliver one message. `ConnectionClosed` once the client is gone.
    async fn send(&self, message: &ProgressMessage) -> Result<(), ConnectionClosed>;

    /// Resolves when the client side closes.
    async fn closed(&self);
}
